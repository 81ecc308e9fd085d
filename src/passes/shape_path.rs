use std::collections::HashMap;

use snipjit_lir::LinearIr;

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;
use crate::subgraph::Layout;

/// What is known about a port's shape at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeSignature {
    /// Fully static shape in a given layout.
    Known(Vec<usize>, Layout),
    /// Whatever the iteration shape is; every output has it.
    Master,
    /// Nothing shareable; the payload keeps it distinct.
    Opaque(usize),
}

/// Assign a shape-path class to every port: ports with equal signatures are
/// guaranteed to see equal shapes and strides at run time, so the runtime
/// configurator derives their strides once per class.
#[derive(Default)]
pub struct MarkInvariantShapePath;

impl Pass for MarkInvariantShapePath {
    fn name(&self) -> &'static str {
        "mark_invariant_shape_path"
    }

    fn description(&self) -> &'static str {
        "Group ports whose shapes are always equal"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Analysis
    }

    fn run(&mut self, lir: &mut LinearIr, ctx: &PassContext) -> Result<bool, PassError> {
        if ctx.port_signatures.is_empty() {
            return Ok(false);
        }
        if ctx.port_signatures.len() != lir.ports().len() {
            return Err(PassError::Invariant {
                pass: self.name(),
                message: format!(
                    "{} signatures for {} ports",
                    ctx.port_signatures.len(),
                    lir.ports().len()
                ),
            });
        }

        let mut classes: HashMap<&ShapeSignature, usize> = HashMap::new();
        let mut changed = false;
        for (port, signature) in ctx.port_signatures.iter().enumerate() {
            let next = classes.len();
            let class = *classes.entry(signature).or_insert(next);
            if let Some(info) = lir.port_mut(port) {
                if info.shape_path != Some(class) {
                    info.shape_path = Some(class);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}
