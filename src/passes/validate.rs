use snipjit_lir::LinearIr;

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

/// Structural sanity check: loop markers matched and properly nested, no
/// dangling values, no use before definition.
#[derive(Default)]
pub struct Validate;

impl Pass for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn description(&self) -> &'static str {
        "Check structural invariants of the sequence"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Verification
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        lir.validate().map_err(|source| PassError::Structural {
            pass: self.name(),
            source,
        })?;
        Ok(false)
    }
}
