use std::collections::HashMap;

use snipjit_lir::{Expression, LinearIr, LoopId, LoopKind, OpKind, Precision, ValueId, ValueKind};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Split every vector loop into a vector loop plus a scalar tail loop.
///
/// With a static extent the split is resolved at compile time: an extent
/// divisible by the vector width keeps only the vector loop, an extent
/// smaller than it turns the vector loop into the tail. Dynamic extents keep
/// both loops and let the runtime work amounts decide.
///
/// The tail loop is a clone of the vector body with one-element loads and
/// stores. Memory values written in the body are rebound so that consumers
/// behind the tail loop read the tail's stores, which are the last writes.
#[derive(Default)]
pub struct InsertTailLoop;

impl InsertTailLoop {
    fn shrink_to_scalar(op: OpKind) -> OpKind {
        match op {
            OpKind::Load { .. } => OpKind::Load { count: 1 },
            OpKind::Store { .. } => OpKind::Store { count: 1 },
            other => other,
        }
    }

    fn split(&self, lir: &mut LinearIr, vector: LoopId, extent: Option<usize>) -> Result<(), PassError> {
        let Some((begin, end)) = lir.loop_bounds(vector) else {
            return Ok(());
        };
        let Some(info) = lir.loop_info(vector).cloned() else {
            return Ok(());
        };
        let body: Vec<Expression> = lir.expressions()[begin + 1..end]
            .iter()
            .filter(|e| !matches!(e.op, OpKind::Result { .. }))
            .cloned()
            .collect();
        if body.iter().any(|e| e.op.is_loop_marker()) {
            return Err(PassError::Invariant {
                pass: self.name(),
                message: format!("vector loop {} contains a nested loop", vector),
            });
        }

        let tail = lir.add_loop(info.dim, 1, LoopKind::Tail);
        if let Some(tail_info) = lir.loop_info_mut(tail) {
            tail_info.work_amount = extent.map(|e| e % info.increment);
        }
        if let Some(vector_info) = lir.loop_info_mut(vector) {
            vector_info.is_last_in_dim = false;
            vector_info.work_amount = extent.map(|e| e - e % info.increment);
        }

        let enclosing = lir.get(begin).map(|e| e.loop_ids.clone()).unwrap_or_default();
        let mut tail_begin = lir.create(OpKind::LoopBegin { loop_id: tail }, vec![], &[ValueKind::Gpr], Precision::I32);
        tail_begin.loop_ids = enclosing.clone();
        let counter = tail_begin.outputs[0];

        let mut remap: HashMap<ValueId, ValueId> = HashMap::new();
        let mut clones = vec![tail_begin];
        for expr in &body {
            let inputs = expr
                .inputs
                .iter()
                .map(|v| remap.get(v).copied().unwrap_or(*v))
                .collect();
            let kinds: Vec<ValueKind> = expr
                .outputs
                .iter()
                .filter_map(|v| lir.value_kind(*v))
                .collect();
            let mut clone = lir.create(Self::shrink_to_scalar(expr.op), inputs, &kinds, expr.precision);
            clone.loop_ids = expr
                .loop_ids
                .iter()
                .map(|&l| if l == vector { tail } else { l })
                .collect();
            for (old, new) in expr.outputs.iter().zip(&clone.outputs) {
                remap.insert(*old, *new);
            }
            clones.push(clone);
        }
        let mut tail_end = lir.create(OpKind::LoopEnd { loop_id: tail }, vec![counter], &[], Precision::I32);
        tail_end.loop_ids = enclosing;
        clones.push(tail_end);

        let insert_at = end + 1;
        let inserted = clones.len();
        for (offset, clone) in clones.into_iter().enumerate() {
            lir.insert(insert_at + offset, clone);
        }

        // Rebind later consumers of values written in the body.
        for position in insert_at + inserted..lir.len() {
            if let Some(expr) = lir.get_mut(position) {
                for input in &mut expr.inputs {
                    if let Some(new) = remap.get(input) {
                        *input = *new;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Pass for InsertTailLoop {
    fn name(&self) -> &'static str {
        "insert_tail_loop"
    }

    fn description(&self) -> &'static str {
        "Split vector loops into a vector part and a scalar tail"
    }

    fn category(&self) -> PassCategory {
        PassCategory::LoopStructure
    }

    fn run(&mut self, lir: &mut LinearIr, ctx: &PassContext) -> Result<bool, PassError> {
        let candidates: Vec<LoopId> = lir
            .placed_loops()
            .into_iter()
            .filter(|&l| {
                lir.loop_info(l).is_some_and(|info| {
                    info.kind == LoopKind::Vector && info.increment > 1 && info.is_last_in_dim
                })
            })
            .collect();

        let mut changed = false;
        for vector in candidates {
            let Some(info) = lir.loop_info(vector).cloned() else {
                continue;
            };
            let extent = ctx.static_extent(info.dim);
            match extent {
                Some(e) if e % info.increment == 0 => {
                    if info.work_amount != Some(e) {
                        if let Some(info) = lir.loop_info_mut(vector) {
                            info.work_amount = Some(e);
                        }
                        changed = true;
                    }
                }
                Some(e) if e < info.increment => {
                    if let Some(info) = lir.loop_info_mut(vector) {
                        info.kind = LoopKind::Tail;
                        info.increment = 1;
                        info.work_amount = Some(e);
                    }
                    if let Some((begin, end)) = lir.loop_bounds(vector) {
                        for position in begin + 1..end {
                            if let Some(expr) = lir.get_mut(position) {
                                expr.op = Self::shrink_to_scalar(expr.op);
                            }
                        }
                    }
                    changed = true;
                }
                _ => {
                    self.split(lir, vector, extent)?;
                    changed = true;
                }
            }
        }

        // Outer loops walk their whole dimension one step at a time.
        for id in lir.placed_loops() {
            let extent = lir.loop_info(id).and_then(|info| {
                (info.kind == LoopKind::Outer && info.work_amount.is_none())
                    .then(|| ctx.static_extent(info.dim))
                    .flatten()
            });
            if let (Some(e), Some(info)) = (extent, lir.loop_info_mut(id)) {
                info.work_amount = Some(e);
                changed = true;
            }
        }
        Ok(changed)
    }
}
