use std::collections::HashMap;

use snipjit_lir::{ExprId, LinearIr, LirError, OpKind};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Loop-escape repair.
///
/// A `Result` whose producer is inside a loop is moved right after the
/// `LoopEnd` of the producer's outermost loop; a `Result` placed before a
/// producer that is outside any loop is moved right after the producer.
/// Results moved behind the same anchor keep their relative order. Inputs
/// and outputs are never rewritten.
#[derive(Default)]
pub struct MoveResultOutOfLoop;

impl Pass for MoveResultOutOfLoop {
    fn name(&self) -> &'static str {
        "move_result_out_of_loop"
    }

    fn description(&self) -> &'static str {
        "Move subgraph results behind the loops computing them"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Scheduling
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        let results: Vec<ExprId> = lir
            .iter()
            .filter(|e| matches!(e.op, OpKind::Result { .. }))
            .map(|e| e.id)
            .collect();

        let mut moved_behind: HashMap<ExprId, usize> = HashMap::new();
        let mut changed = false;

        for id in results {
            let Some(position) = lir.position_of(id) else {
                continue;
            };
            let Some(parent) = lir.get(position).and_then(|e| e.inputs.first().copied()) else {
                continue;
            };
            let parent_position =
                lir.producer_position(parent)
                    .ok_or(PassError::Structural {
                        pass: self.name(),
                        source: LirError::DanglingValue {
                            expr: id,
                            value: parent,
                        },
                    })?;

            let nesting = lir.loop_nesting();
            let anchor = match nesting[parent_position].first() {
                Some(&outermost) => {
                    lir.loop_bounds(outermost)
                        .ok_or(PassError::Structural {
                            pass: self.name(),
                            source: LirError::UnclosedLoop { loop_id: outermost },
                        })?
                        .1
                }
                None => parent_position,
            };
            if position > anchor {
                continue;
            }

            let anchor_id = lir.get(anchor).map(|e| e.id).unwrap_or(id);
            let already = moved_behind.entry(anchor_id).or_insert(0);
            // Removing `position` shifts the anchor down by one, so `anchor`
            // becomes the slot right behind it.
            let result = lir.remove(position);
            lir.insert(anchor + *already, result);
            *already += 1;
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_util::{emit, op_names, param};
    use crate::passes::{DependencyGraph, InsertLoops};
    use snipjit_lir::{LoopKind, PortKind, Precision, ValueKind};

    /// Two outputs stored in one loop, each result right behind its store.
    fn nested_results() -> LinearIr {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        let out0 = lir.add_port(PortKind::Output, Precision::F32);
        let out1 = lir.add_port(PortKind::Output, Precision::F32);
        let l = lir.add_loop(0, 4, LoopKind::Vector);
        let x = emit(&mut lir, OpKind::Load { count: 4 }, vec![a], &[ValueKind::Vec], &[l]).unwrap();
        let s0 = emit(&mut lir, OpKind::Store { count: 4 }, vec![x], &[ValueKind::Memory { port: out0 }], &[l]).unwrap();
        emit(&mut lir, OpKind::Result { index: 0 }, vec![s0], &[], &[]);
        let s1 = emit(&mut lir, OpKind::Store { count: 4 }, vec![x], &[ValueKind::Memory { port: out1 }], &[l]).unwrap();
        emit(&mut lir, OpKind::Result { index: 1 }, vec![s1], &[], &[]);
        InsertLoops.run(&mut lir, &PassContext::new(4)).unwrap();
        lir
    }

    #[test]
    fn test_nested_result_creates_cycle() {
        let lir = nested_results();
        assert!(!DependencyGraph::build(&lir).is_acyclic());
    }

    #[test]
    fn test_results_move_behind_loop_in_order() {
        let mut lir = nested_results();
        assert!(MoveResultOutOfLoop.run(&mut lir, &PassContext::new(4)).unwrap());
        assert_eq!(
            op_names(&lir),
            vec![
                "Parameter[0]",
                "LoopBegin L0",
                "Load<4>",
                "Store<4>",
                "Store<4>",
                "LoopEnd L0",
                "Result[0]",
                "Result[1]"
            ]
        );
        assert!(DependencyGraph::build(&lir).is_acyclic());
        assert_eq!(lir.validate(), Ok(()));
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let mut lir = nested_results();
        MoveResultOutOfLoop.run(&mut lir, &PassContext::new(4)).unwrap();
        let once = lir.expressions().to_vec();
        assert!(!MoveResultOutOfLoop.run(&mut lir, &PassContext::new(4)).unwrap());
        assert_eq!(lir.expressions(), &once[..]);
    }

    #[test]
    fn test_result_before_out_of_loop_parent_moves_after_it() {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        let out = lir.add_port(PortKind::Output, Precision::F32);
        let x = emit(&mut lir, OpKind::Load { count: 1 }, vec![a], &[ValueKind::Vec], &[]).unwrap();
        let s = emit(&mut lir, OpKind::Store { count: 1 }, vec![x], &[ValueKind::Memory { port: out }], &[]).unwrap();
        emit(&mut lir, OpKind::Result { index: 0 }, vec![s], &[], &[]);
        // Put the result in front of its store.
        lir.move_expr(3, 1);
        assert!(lir.validate().is_err());

        assert!(MoveResultOutOfLoop.run(&mut lir, &PassContext::new(1)).unwrap());
        assert_eq!(op_names(&lir), vec!["Parameter[0]", "Load<1>", "Store<1>", "Result[0]"]);
        assert_eq!(lir.validate(), Ok(()));
    }
}
