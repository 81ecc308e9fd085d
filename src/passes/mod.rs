//! Transformation passes over the linear IR.
//!
//! Each pass mutates a [`LinearIr`] and reports whether it changed
//! anything. Passes are composable and run in a fixed order by a
//! [`PassPipeline`]; [`PassPipeline::standard`] is the order the compiler
//! uses. Running a pass a second time on its own output must be a no-op.

mod dce;
mod dependency;
mod hoist_scalars;
mod insert_loops;
mod move_result;
mod shape_path;
mod tail_loop;
mod validate;

pub use dce::DeadCodeElimination;
pub use dependency::{check_acyclic, DependencyGraph, VerifyAcyclic};
pub use hoist_scalars::HoistScalars;
pub use insert_loops::InsertLoops;
pub use move_result::MoveResultOutOfLoop;
pub use shape_path::{MarkInvariantShapePath, ShapeSignature};
pub use tail_loop::InsertTailLoop;
pub use validate::Validate;

use snipjit_lir::LinearIr;
use tracing::{debug, debug_span};

use crate::error::PassError;

/// What a pass is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassCategory {
    /// Creates or reshapes loop structure
    LoopStructure,
    /// Reorders expressions without changing loop structure
    Scheduling,
    /// Removes expressions that do not affect outputs
    Cleanup,
    /// Annotates the sequence without moving anything
    Analysis,
    /// Checks invariants, never changes anything
    Verification,
}

/// Facts about the compilation every pass may consult.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    /// Vector width in lanes.
    pub lanes: usize,
    /// Iteration shape when every dimension is known at compile time.
    pub static_master: Option<Vec<usize>>,
    /// Shape signature per port, consumed by the shape path analysis.
    pub port_signatures: Vec<ShapeSignature>,
}

impl PassContext {
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes,
            ..Self::default()
        }
    }

    pub fn with_static_master(mut self, master: Vec<usize>) -> Self {
        self.static_master = Some(master);
        self
    }

    pub fn with_port_signatures(mut self, signatures: Vec<ShapeSignature>) -> Self {
        self.port_signatures = signatures;
        self
    }

    /// Static extent of dimension `dim` counted from the innermost.
    pub fn static_extent(&self, dim: usize) -> Option<usize> {
        let master = self.static_master.as_ref()?;
        Some(if dim < master.len() {
            master[master.len() - 1 - dim]
        } else {
            1
        })
    }
}

pub trait Pass {
    /// Unique name for this pass
    fn name(&self) -> &'static str;

    /// Description of what this pass does
    fn description(&self) -> &'static str;

    fn category(&self) -> PassCategory;

    /// Run the pass, returning whether the sequence changed.
    fn run(&mut self, lir: &mut LinearIr, ctx: &PassContext) -> Result<bool, PassError>;
}

/// Which passes ran and whether each changed the sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub runs: Vec<(&'static str, bool)>,
}

impl PipelineReport {
    pub fn changed(&self, pass: &str) -> bool {
        self.runs.iter().any(|(name, changed)| *name == pass && *changed)
    }
}

#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// The order the compiler runs. Loop-escape repair runs once after loop
    /// insertion and again after the tail split, which clones loop bodies.
    pub fn standard() -> Self {
        Self::new()
            .with_pass(InsertLoops)
            .with_pass(MoveResultOutOfLoop)
            .with_pass(HoistScalars)
            .with_pass(InsertTailLoop)
            .with_pass(MoveResultOutOfLoop)
            .with_pass(DeadCodeElimination::default())
            .with_pass(MarkInvariantShapePath)
            .with_pass(Validate)
            .with_pass(VerifyAcyclic)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&mut self, lir: &mut LinearIr, ctx: &PassContext) -> Result<PipelineReport, PassError> {
        let mut report = PipelineReport::default();
        for pass in &mut self.passes {
            let name = pass.name();
            let span = debug_span!("pass", pass = name);
            let _enter = span.enter();
            let changed = pass.run(lir, ctx)?;
            if cfg!(debug_assertions) {
                lir.validate()
                    .map_err(|source| PassError::Structural { pass: name, source })?;
            }
            debug!(changed, expressions = lir.len(), "pass finished");
            report.runs.push((name, changed));
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use snipjit_lir::{LinearIr, LoopId, OpKind, PortKind, Precision, ValueId, ValueKind};

    /// Append an expression carrying `loops` and return its first output.
    pub fn emit(
        lir: &mut LinearIr,
        op: OpKind,
        inputs: Vec<ValueId>,
        kinds: &[ValueKind],
        loops: &[LoopId],
    ) -> Option<ValueId> {
        let mut expr = lir.create(op, inputs, kinds, Precision::F32);
        expr.loop_ids = loops.to_vec();
        let out = expr.output();
        lir.push(expr);
        out
    }

    pub fn param(lir: &mut LinearIr, index: usize) -> ValueId {
        let port = lir.add_port(PortKind::Input, Precision::F32);
        emit(lir, OpKind::Parameter { index }, vec![], &[ValueKind::Memory { port }], &[])
            .unwrap_or(ValueId(u32::MAX))
    }

    pub fn op_names(lir: &LinearIr) -> Vec<String> {
        lir.iter().map(|e| e.op.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowering::lower;
    use crate::subgraph::{Dim, Subgraph};
    use snipjit_lir::{OpKind, Precision};

    fn two_output_subgraph() -> Subgraph {
        let mut sg = Subgraph::new();
        let a = sg.input(&[Dim::Static(3), Dim::Static(10)], Precision::F32);
        let b = sg.input(&[Dim::Static(10)], Precision::F32);
        let two = sg.scalar_f32(2.0);
        let s = sg.add(a, b);
        let m = sg.mul(s, two);
        sg.output(s);
        sg.output(m);
        sg
    }

    #[test]
    fn test_standard_pipeline_registers_every_pass() {
        let pipeline = PassPipeline::standard();
        assert_eq!(
            pipeline.names(),
            vec![
                "insert_loops",
                "move_result_out_of_loop",
                "hoist_scalars",
                "insert_tail_loop",
                "move_result_out_of_loop",
                "dead_code_elimination",
                "mark_invariant_shape_path",
                "validate",
                "verify_acyclic",
            ]
        );
    }

    #[test]
    fn test_standard_pipeline_order() {
        let names = PassPipeline::standard().names();
        assert_eq!(names.first(), Some(&"insert_loops"));
        assert_eq!(names.last(), Some(&"verify_acyclic"));
        assert_eq!(names.iter().filter(|n| **n == "move_result_out_of_loop").count(), 2);
    }

    #[test]
    fn test_standard_pipeline_produces_acyclic_sequence() {
        let mut lowered = lower(&two_output_subgraph(), 8).unwrap();
        let ctx = PassContext::new(8).with_static_master(vec![3, 10]);
        let report = PassPipeline::standard().run(&mut lowered.lir, &ctx).unwrap();
        assert!(report.changed("insert_loops"));
        assert!(report.changed("insert_tail_loop"));
        assert!(DependencyGraph::build(&lowered.lir).is_acyclic());

        // Every Result ends up outside every loop.
        let nesting = lowered.lir.loop_nesting();
        for (pos, expr) in lowered.lir.iter().enumerate() {
            if matches!(expr.op, OpKind::Result { .. }) {
                assert!(nesting[pos].is_empty(), "result at {} still nested", pos);
            }
        }
    }

    #[test]
    fn test_repair_second_run_is_noop() {
        let mut lowered = lower(&two_output_subgraph(), 8).unwrap();
        let ctx = PassContext::new(8);
        PassPipeline::standard().run(&mut lowered.lir, &ctx).unwrap();
        let before = lowered.lir.expressions().to_vec();
        let changed = MoveResultOutOfLoop.run(&mut lowered.lir, &ctx).unwrap();
        assert!(!changed);
        assert_eq!(lowered.lir.expressions(), &before[..]);
    }

    #[test]
    fn test_static_extent_pads_missing_dims() {
        let ctx = PassContext::new(4).with_static_master(vec![7]);
        assert_eq!(ctx.static_extent(0), Some(7));
        assert_eq!(ctx.static_extent(1), Some(1));
        assert_eq!(PassContext::new(4).static_extent(0), None);
    }
}
