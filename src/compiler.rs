//! The compilation driver: subgraph in, executable kernel out.

use snipjit_lir::{LinearIr, PortKind};
use snipjit_platform::{TargetCapabilities, MAX_VECTOR_LANES};
use tracing::{debug, info, info_span};

use crate::config::{CompileOptions, SpecializationPolicy};
use crate::emitter::{self, EmitterTable, Kernel, KernelKind, SPILL_SLOT_BYTES};
use crate::env;
use crate::error::{CompileError, Result};
use crate::lowering::{lower, GemmSite};
use crate::passes::{PassContext, PassPipeline, PipelineReport, ShapeSignature};
use crate::regalloc::allocate;
use crate::runtime::{KernelLayout, RuntimeConfig, RuntimeConfigurator};
use crate::subgraph::{broadcast_shapes, Subgraph};

/// A kernel together with everything needed to configure its calls.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    subgraph: Subgraph,
    kernel: Kernel,
    lir: LinearIr,
    configurator: RuntimeConfigurator,
    static_config: Option<RuntimeConfig>,
    gemm_sites: Vec<GemmSite>,
    report: PipelineReport,
    target: TargetCapabilities,
}

impl CompiledKernel {
    pub fn name(&self) -> &str {
        &self.kernel.name
    }

    pub fn kind(&self) -> KernelKind {
        self.kernel.kind
    }

    pub fn is_static(&self) -> bool {
        self.kernel.kind == KernelKind::Static
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// The sequence after the pass pipeline.
    pub fn lir(&self) -> &LinearIr {
        &self.lir
    }

    pub fn subgraph(&self) -> &Subgraph {
        &self.subgraph
    }

    pub fn configurator(&self) -> &RuntimeConfigurator {
        &self.configurator
    }

    /// Configuration a static kernel was specialized for.
    pub fn static_config(&self) -> Option<&RuntimeConfig> {
        self.static_config.as_ref()
    }

    pub fn gemm_sites(&self) -> &[GemmSite] {
        &self.gemm_sites
    }

    pub fn pipeline_report(&self) -> &PipelineReport {
        &self.report
    }

    pub fn target(&self) -> &TargetCapabilities {
        &self.target
    }

    /// Whether calls with `input_shapes` need a different kernel: a static
    /// kernel only runs its own shapes, a dynamic one anything its input
    /// declarations accept.
    pub fn requires_recompilation(&self, input_shapes: &[Vec<usize>]) -> bool {
        if let Some(config) = &self.static_config {
            return config.input_shapes != input_shapes;
        }
        let decls = self.subgraph.inputs();
        decls.len() != input_shapes.len()
            || decls
                .iter()
                .zip(input_shapes)
                .any(|(decl, shape)| !decl.accepts(shape))
            || self.subgraph.infer_shapes(input_shapes).is_err()
    }
}

/// Shape signature per port for the shape path analysis.
fn port_signatures(subgraph: &Subgraph, lir: &LinearIr) -> Vec<ShapeSignature> {
    let mut inputs = subgraph.inputs().iter();
    lir.ports()
        .iter()
        .enumerate()
        .map(|(port, info)| match info.kind {
            PortKind::Input => match inputs.next() {
                Some(decl) => match decl.static_shape() {
                    Some(shape) => ShapeSignature::Known(shape, decl.layout),
                    None => ShapeSignature::Opaque(port),
                },
                None => ShapeSignature::Opaque(port),
            },
            PortKind::Output => ShapeSignature::Master,
            PortKind::Buffer => ShapeSignature::Opaque(port),
        })
        .collect()
}

/// Compile `subgraph` for `target`.
pub fn compile(subgraph: &Subgraph, target: &TargetCapabilities, options: &CompileOptions) -> Result<CompiledKernel> {
    let span = info_span!("compile", kernel = %options.name);
    let _enter = span.enter();

    subgraph.check()?;
    let lanes = options
        .vector_lanes
        .unwrap_or(target.vector_lanes)
        .clamp(1, MAX_VECTOR_LANES);
    let static_shapes = match options.specialization {
        SpecializationPolicy::Auto => subgraph.static_input_shapes(),
        SpecializationPolicy::ForceDynamic => None,
    };
    let kind = if static_shapes.is_some() {
        KernelKind::Static
    } else {
        KernelKind::Dynamic
    };

    let lowered = lower(subgraph, lanes)?;
    let mut lir = lowered.lir;
    let table = EmitterTable::standard();
    table.check_support(&lir)?;

    let mut ctx = PassContext::new(lanes).with_port_signatures(port_signatures(subgraph, &lir));
    if let Some(shapes) = &static_shapes {
        let outputs = subgraph.output_shapes(shapes).map_err(CompileError::Shape)?;
        let mut master = Vec::new();
        for shape in &outputs {
            master = broadcast_shapes(&master, shape)
                .ok_or_else(|| CompileError::Shape(format!("outputs {:?} do not broadcast", outputs)))?;
        }
        ctx = ctx.with_static_master(master);
    }
    let report = PassPipeline::standard().run(&mut lir, &ctx)?;
    if env::dump_lis() {
        debug!("sequence after pipeline:\n{}", lir);
    }

    let ra = allocate(&lir, target, kind)?;
    let layout = KernelLayout::from_lir(&lir, lanes, ra.spill_slots * SPILL_SLOT_BYTES);
    let configurator = RuntimeConfigurator::new(
        subgraph.clone(),
        layout,
        lowered.gemm_sites.clone(),
        options.repacking,
    );
    let static_config = match &static_shapes {
        Some(shapes) => Some(
            configurator
                .configure(shapes, options.effective_threads())
                .map_err(|e| CompileError::Shape(e.to_string()))?,
        ),
        None => None,
    };
    let baked = static_config.as_ref().map(RuntimeConfig::static_args);
    let kernel = emitter::emit(&options.name, &lir, &ra, kind, lanes, baked.as_ref(), &table)?;

    info!(kind = %kind, lanes, insts = kernel.len(), spills = kernel.spill_slots, "kernel compiled");
    Ok(CompiledKernel {
        subgraph: subgraph.clone(),
        kernel,
        lir,
        configurator,
        static_config,
        gemm_sites: lowered.gemm_sites,
        report,
        target: target.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EmitError, SnipjitError};
    use crate::subgraph::Dim;
    use snipjit_lir::Precision;
    use snipjit_platform::{IsaTier, Target, TargetArchitecture, TargetOperatingSystem};

    fn avx2() -> TargetCapabilities {
        TargetCapabilities::for_isa(
            Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux),
            IsaTier::Avx2,
        )
    }

    fn add_relu(dims: &[Dim], precision: Precision) -> Subgraph {
        let mut g = Subgraph::new();
        let a = g.input(dims, precision);
        let b = g.input(dims, precision);
        let sum = g.add(a, b);
        let out = g.relu(sum);
        g.output(out);
        g
    }

    #[test]
    fn test_static_subgraph_gets_static_kernel() {
        let g = add_relu(&[Dim::Static(2), Dim::Static(8)], Precision::F32);
        let compiled = compile(&g, &avx2(), &CompileOptions::new().with_name("add_relu")).unwrap();
        assert!(compiled.is_static());
        assert_eq!(compiled.name(), "add_relu");
        assert!(compiled.static_config().is_some());
        assert!(compiled.pipeline_report().changed("insert_loops"));

        let listing = compiled.kernel().to_string();
        assert!(listing.starts_with("kernel add_relu (static, 8 lanes, 3 ports"));
        assert!(listing.trim_end().ends_with("ret"));
    }

    #[test]
    fn test_dynamic_kernels() {
        let g = add_relu(&[Dim::Dynamic, Dim::Static(8)], Precision::F32);
        let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
        assert_eq!(compiled.kind(), KernelKind::Dynamic);
        assert!(compiled.static_config().is_none());

        let forced = add_relu(&[Dim::Static(2), Dim::Static(8)], Precision::F32);
        let compiled = compile(&forced, &avx2(), &CompileOptions::new().dynamic()).unwrap();
        assert_eq!(compiled.kind(), KernelKind::Dynamic);
    }

    #[test]
    fn test_requires_recompilation() {
        let g = add_relu(&[Dim::Static(2), Dim::Static(8)], Precision::F32);
        let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
        assert!(!compiled.requires_recompilation(&[vec![2, 8], vec![2, 8]]));
        assert!(compiled.requires_recompilation(&[vec![3, 8], vec![3, 8]]));

        let g = add_relu(&[Dim::Dynamic, Dim::Static(8)], Precision::F32);
        let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
        assert!(!compiled.requires_recompilation(&[vec![5, 8], vec![5, 8]]));
        assert!(!compiled.requires_recompilation(&[vec![5, 8], vec![1, 8]]));
        assert!(compiled.requires_recompilation(&[vec![5, 4], vec![5, 4]]));
        assert!(compiled.requires_recompilation(&[vec![5, 8], vec![3, 8]]));
    }

    #[test]
    fn test_bf16_rejected_before_passes() {
        let g = add_relu(&[Dim::Static(2), Dim::Static(8)], Precision::Bf16);
        let err = compile(&g, &avx2(), &CompileOptions::new()).unwrap_err();
        assert!(matches!(
            err,
            SnipjitError::Compile(CompileError::Emit(EmitError::Unsupported {
                precision: Precision::Bf16,
                ..
            }))
        ));
    }

    #[test]
    fn test_lane_override_is_clamped() {
        let g = add_relu(&[Dim::Static(2), Dim::Static(64)], Precision::F32);
        let options = CompileOptions::new().with_vector_lanes(64);
        let compiled = compile(&g, &avx2(), &options).unwrap();
        assert_eq!(compiled.kernel().lanes, MAX_VECTOR_LANES);
    }
}
