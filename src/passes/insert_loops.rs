use snipjit_lir::{LinearIr, LoopId, OpKind, Precision, ValueId, ValueKind};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Materialize `LoopBegin`/`LoopEnd` markers from the `loop_ids`
/// annotations.
///
/// Loop structure follows annotated expressions only: an expression without
/// annotation placed between two annotated ones stays where it is, and so
/// ends up inside the loop body. Runs once; a sequence that already has
/// markers is left untouched.
#[derive(Default)]
pub struct InsertLoops;

fn marker(lir: &mut LinearIr, op: OpKind, inputs: Vec<ValueId>, enclosing: &[LoopId]) -> snipjit_lir::Expression {
    let kinds: &[ValueKind] = match op {
        OpKind::LoopBegin { .. } => &[ValueKind::Gpr],
        _ => &[],
    };
    let mut expr = lir.create(op, inputs, kinds, Precision::I32);
    expr.loop_ids = enclosing.to_vec();
    expr
}

impl Pass for InsertLoops {
    fn name(&self) -> &'static str {
        "insert_loops"
    }

    fn description(&self) -> &'static str {
        "Insert loop markers around annotated regions"
    }

    fn category(&self) -> PassCategory {
        PassCategory::LoopStructure
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        if !lir.placed_loops().is_empty() || lir.iter().all(|e| e.loop_ids.is_empty()) {
            return Ok(false);
        }
        if let Some(unknown) = lir
            .iter()
            .flat_map(|e| e.loop_ids.iter())
            .find(|l| lir.loop_info(**l).is_none())
        {
            return Err(PassError::Invariant {
                pass: self.name(),
                message: format!("annotation refers to unregistered loop {}", unknown),
            });
        }

        let old = lir.take_expressions();
        let mut out = Vec::with_capacity(old.len() + 4);
        let mut open: Vec<(LoopId, ValueId)> = Vec::new();

        for expr in old {
            if !expr.loop_ids.is_empty() {
                let common = open
                    .iter()
                    .zip(&expr.loop_ids)
                    .take_while(|((open_id, _), want)| open_id == *want)
                    .count();
                while open.len() > common {
                    if let Some((loop_id, counter)) = open.pop() {
                        let enclosing: Vec<LoopId> = open.iter().map(|(l, _)| *l).collect();
                        out.push(marker(lir, OpKind::LoopEnd { loop_id }, vec![counter], &enclosing));
                    }
                }
                for &loop_id in &expr.loop_ids[common..] {
                    let enclosing: Vec<LoopId> = open.iter().map(|(l, _)| *l).collect();
                    let begin = marker(lir, OpKind::LoopBegin { loop_id }, vec![], &enclosing);
                    let counter = begin.outputs[0];
                    out.push(begin);
                    open.push((loop_id, counter));
                }
            }
            out.push(expr);
        }
        while let Some((loop_id, counter)) = open.pop() {
            let enclosing: Vec<LoopId> = open.iter().map(|(l, _)| *l).collect();
            out.push(marker(lir, OpKind::LoopEnd { loop_id }, vec![counter], &enclosing));
        }

        lir.set_expressions(out);
        Ok(true)
    }
}
