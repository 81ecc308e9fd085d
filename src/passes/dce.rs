use std::collections::HashSet;

use snipjit_lir::{LinearIr, ValueId};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Dead code elimination.
///
/// Removes pure expressions (loads, constants, arithmetic) whose outputs are
/// never read, repeating until nothing else becomes dead. Stores, results,
/// buffers and loop markers are always kept.
#[derive(Default)]
pub struct DeadCodeElimination {
    removed: usize,
}

impl DeadCodeElimination {
    /// Expressions removed by the last run.
    pub fn removed(&self) -> usize {
        self.removed
    }
}

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn description(&self) -> &'static str {
        "Remove pure expressions with unused outputs"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Cleanup
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        self.removed = 0;
        loop {
            let used: HashSet<ValueId> = lir.iter().flat_map(|e| e.inputs.iter().copied()).collect();
            let before = lir.len();
            lir.retain(|e| !(e.op.is_pure() && e.outputs.iter().all(|o| !used.contains(o))));
            let removed = before - lir.len();
            if removed == 0 {
                break;
            }
            self.removed += removed;
        }
        Ok(self.removed > 0)
    }
}
