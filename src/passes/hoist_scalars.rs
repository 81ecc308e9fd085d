use snipjit_lir::{ExprId, LinearIr, OpKind};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Move scalar constants in front of the outermost loop enclosing them.
///
/// A broadcast constant is loop-invariant; hoisting it means the tail split
/// does not clone it and the register holding it is filled once per call.
#[derive(Default)]
pub struct HoistScalars;

impl Pass for HoistScalars {
    fn name(&self) -> &'static str {
        "hoist_scalars"
    }

    fn description(&self) -> &'static str {
        "Hoist loop-invariant scalar constants out of loops"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Scheduling
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        let scalars: Vec<ExprId> = lir
            .iter()
            .filter(|e| matches!(e.op, OpKind::Scalar { .. }))
            .map(|e| e.id)
            .collect();

        let mut changed = false;
        for id in scalars {
            let Some(position) = lir.position_of(id) else {
                continue;
            };
            let nesting = lir.loop_nesting();
            let Some(&outermost) = nesting[position].first() else {
                continue;
            };
            let Some((begin, _)) = lir.loop_bounds(outermost) else {
                continue;
            };
            let mut scalar = lir.remove(position);
            scalar.loop_ids.clear();
            lir.insert(begin, scalar);
            changed = true;
        }
        Ok(changed)
    }
}
