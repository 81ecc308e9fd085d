//! Runtime configuration: everything shape-dependent a kernel call needs.
//!
//! The configurator turns the input shapes of one call (declared shapes for
//! static kernels, observed shapes for dynamic ones) into a
//! [`RuntimeConfig`]: the master shape and parallel domain, per-port strides
//! and data offsets, loop arguments, the per-thread scratch layout, matmul
//! configs and the repacking plan.

use std::collections::HashMap;
use std::fmt;

use snipjit_lir::{LinearIr, LoopArgs, LoopKind, OpKind, PortKind, Precision, ValueKind};
use tracing::{debug, info};

use super::domain::{broadcast_strides, dense_strides, pad_shape, Strided, TENSOR_RANK};
use super::kernel_cache::{GemmConfig, RepackConfig};
use crate::config::RepackingPolicy;
use crate::emitter::StaticArgs;
use crate::error::RuntimeError;
use crate::lowering::GemmSite;
use crate::subgraph::{broadcast_shapes, Layout, Subgraph};

/// Offsets of scratch regions are rounded up to this.
pub const SCRATCH_ALIGN: usize = 64;

/// Parallel-domain dimensions the kernel is invoked over; the last two
/// master dimensions are walked inside the kernel.
pub const DOMAIN_DIMS: usize = TENSOR_RANK - 2;

fn align_up(n: usize) -> usize {
    n.div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLayout {
    pub kind: PortKind,
    pub precision: Precision,
    /// Position among the ports of the same kind.
    pub index: usize,
    pub shape_path: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopLayout {
    pub dim: usize,
    pub increment: usize,
    pub kind: LoopKind,
    pub is_last_in_dim: bool,
    /// Ports the loop advances, in the order of its pointer increments.
    pub ports: Vec<usize>,
}

/// What the configurator needs to know about a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub ports: Vec<PortLayout>,
    /// Placed loops in slot order.
    pub loops: Vec<LoopLayout>,
    pub lanes: usize,
    pub spill_bytes: usize,
    /// Per input: read by the element-wise region.
    pub loaded_inputs: Vec<bool>,
}

impl KernelLayout {
    pub fn from_lir(lir: &LinearIr, lanes: usize, spill_bytes: usize) -> Self {
        let mut counts: HashMap<PortKind, usize> = HashMap::new();
        let ports: Vec<PortLayout> = lir
            .ports()
            .iter()
            .map(|info| {
                let count = counts.entry(info.kind).or_insert(0);
                let index = *count;
                *count += 1;
                PortLayout {
                    kind: info.kind,
                    precision: info.precision,
                    index,
                    shape_path: info.shape_path,
                }
            })
            .collect();

        let loops = lir
            .placed_loops()
            .into_iter()
            .filter_map(|id| {
                let info = lir.loop_info(id)?;
                Some(LoopLayout {
                    dim: info.dim,
                    increment: info.increment,
                    kind: info.kind,
                    is_last_in_dim: info.is_last_in_dim,
                    ports: lir.loop_ports(id),
                })
            })
            .collect();

        let mut loaded_inputs = vec![false; lir.count_ports(PortKind::Input)];
        for expr in lir.iter() {
            if !matches!(expr.op, OpKind::Load { .. }) {
                continue;
            }
            let port = expr.inputs.first().and_then(|v| match lir.value_kind(*v) {
                Some(ValueKind::Memory { port }) => Some(port),
                _ => None,
            });
            if let Some(port) = port {
                if let Some(PortLayout {
                    kind: PortKind::Input,
                    index,
                    ..
                }) = ports.get(port)
                {
                    loaded_inputs[*index] = true;
                }
            }
        }

        Self {
            ports,
            loops,
            lanes,
            spill_bytes,
            loaded_inputs,
        }
    }
}

/// How non-planar inputs reach the kernel for one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RepackingStrategy {
    /// The kernel reads every input with its own strides.
    #[default]
    None,
    /// Inputs are repacked in full before the units are dispatched.
    Separate,
    /// Each worker repacks the slice of the unit it runs next.
    InParallel,
}

impl fmt::Display for RepackingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Separate => "separate",
            Self::InParallel => "in_parallel",
        };
        write!(f, "{}", s)
    }
}

/// Repacking plan of one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackingDescriptor {
    pub input: usize,
    pub config: RepackConfig,
    /// Source byte offset per parallel-domain dimension.
    pub in_offsets: Vec<i64>,
    /// Batch slices of the input itself, with their source byte offsets.
    pub source_domain: Strided,
    /// The same slices, with their byte offsets in the repacked tensor.
    pub out_offsets: Strided,
    /// Offset of this input's region in the repack scratch (per thread for
    /// in-parallel repacking).
    pub region_offset: usize,
}

impl RepackingDescriptor {
    pub fn slice_bytes(&self) -> usize {
        self.config.dst_bytes()
    }

    /// Source byte offset of the slice unit `indexes` reads.
    pub fn source_offset(&self, indexes: &[usize]) -> i64 {
        indexes
            .iter()
            .zip(&self.in_offsets)
            .map(|(&i, &off)| i as i64 * off)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    /// Broadcast of the outputs, padded to `TENSOR_RANK`.
    pub master_shape: Vec<usize>,
    /// Master shape with the last two dimensions set to 1.
    pub parallel_domain: Vec<usize>,
    pub units: usize,
    /// Per port, bytes per parallel-domain dimension.
    pub data_offsets: Vec<Vec<i64>>,
    /// Per port, element strides of the last two master dimensions.
    pub inner_strides: Vec<i64>,
    pub row_strides: Vec<i64>,
    /// Per loop slot.
    pub loop_args: Vec<LoopArgs>,
    /// Per buffer, offsets within the per-thread scratch region.
    pub buffer_offsets: Vec<usize>,
    /// Per-thread scratch: spill slots and buffers.
    pub internal_size: usize,
    pub gemms: Vec<GemmConfig>,
    pub repacking: RepackingStrategy,
    pub repacks: Vec<RepackingDescriptor>,
    /// Separate: the whole repack region; in-parallel: one worker's share.
    pub repack_region_size: usize,
}

impl RuntimeConfig {
    /// Repack scratch needed with `nthreads` workers.
    pub fn external_size(&self, nthreads: usize) -> usize {
        match self.repacking {
            RepackingStrategy::None => 0,
            RepackingStrategy::Separate => self.repack_region_size,
            RepackingStrategy::InParallel => self.repack_region_size * nthreads.max(1),
        }
    }

    /// The values a static kernel bakes in.
    pub fn static_args(&self) -> StaticArgs {
        StaticArgs {
            loop_args: self.loop_args.clone(),
            inner_strides: self.inner_strides.clone(),
            data_offsets: self.data_offsets.clone(),
        }
    }

    pub fn repack_configs(&self) -> Vec<(usize, RepackConfig)> {
        self.repacks.iter().map(|r| (r.input, r.config)).collect()
    }
}

/// Port strides in elements over the padded rank.
type PortStrides = Vec<i64>;

#[derive(Debug, Clone)]
pub struct RuntimeConfigurator {
    subgraph: Subgraph,
    layout: KernelLayout,
    sites: Vec<GemmSite>,
    policy: RepackingPolicy,
}

impl RuntimeConfigurator {
    pub fn new(subgraph: Subgraph, layout: KernelLayout, sites: Vec<GemmSite>, policy: RepackingPolicy) -> Self {
        Self {
            subgraph,
            layout,
            sites,
            policy,
        }
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Inputs eligible for repacking: stored transposed and read by the
    /// element-wise region.
    fn repack_candidates(&self) -> Vec<usize> {
        self.subgraph
            .inputs()
            .iter()
            .enumerate()
            .filter(|(i, decl)| {
                decl.layout == Layout::TransposedLast2 && self.layout.loaded_inputs.get(*i).copied().unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Pick the repacking strategy for a configuration.
    ///
    /// Auto goes in-parallel when every worker gets at least one unit and
    /// the per-unit repack traffic is small next to the per-unit compute
    /// (a quarter of it or less); otherwise it repacks separately.
    fn resolve_strategy(
        &self,
        candidates: &[usize],
        shapes: &[Vec<usize>],
        master: &[usize],
        units: usize,
        gemms: &[GemmConfig],
        nthreads: usize,
    ) -> RepackingStrategy {
        if candidates.is_empty() {
            return RepackingStrategy::None;
        }
        match self.policy {
            RepackingPolicy::Disabled => RepackingStrategy::None,
            RepackingPolicy::Separate => RepackingStrategy::Separate,
            RepackingPolicy::InParallel => RepackingStrategy::InParallel,
            RepackingPolicy::Auto => {
                let tile = master[TENSOR_RANK - 2] * master[TENSOR_RANK - 1];
                let compute = tile + gemms.iter().map(|g| g.m * g.n * g.k).sum::<usize>();
                let repack: usize = candidates
                    .iter()
                    .map(|&i| {
                        let p = pad_shape(&shapes[i], TENSOR_RANK);
                        p[TENSOR_RANK - 2] * p[TENSOR_RANK - 1]
                    })
                    .sum();
                if units >= nthreads.max(1) && repack * 4 <= compute {
                    RepackingStrategy::InParallel
                } else {
                    RepackingStrategy::Separate
                }
            }
        }
    }

    /// Logical element strides of an input in its effective layout, with
    /// broadcast dimensions zeroed.
    fn input_strides(shape: &[usize], layout: Layout) -> PortStrides {
        let padded = pad_shape(shape, TENSOR_RANK);
        let raw = match layout {
            Layout::Planar => dense_strides(&padded),
            Layout::TransposedLast2 => {
                let mut storage = padded.clone();
                storage.swap(TENSOR_RANK - 2, TENSOR_RANK - 1);
                let mut strides = dense_strides(&storage);
                strides.swap(TENSOR_RANK - 2, TENSOR_RANK - 1);
                strides
            }
        };
        broadcast_strides(&padded, &raw)
    }

    /// Compute the configuration for `input_shapes` with `nthreads` workers.
    pub fn configure(&self, input_shapes: &[Vec<usize>], nthreads: usize) -> Result<RuntimeConfig, RuntimeError> {
        let inputs = self.subgraph.inputs();
        if input_shapes.len() != inputs.len() {
            return Err(RuntimeError::ArityMismatch {
                what: "input shapes",
                expected: inputs.len(),
                found: input_shapes.len(),
            });
        }
        let node_shapes = self
            .subgraph
            .infer_shapes(input_shapes)
            .map_err(RuntimeError::IncompatibleShapes)?;
        let output_shapes: Vec<Vec<usize>> = self
            .subgraph
            .outputs()
            .iter()
            .map(|o| node_shapes[o.0].clone())
            .collect();

        let mut master = Vec::new();
        for shape in &output_shapes {
            master = broadcast_shapes(&master, shape).ok_or_else(|| {
                RuntimeError::IncompatibleShapes(format!("outputs {:?} do not broadcast", output_shapes))
            })?;
        }
        for (i, shape) in output_shapes.iter().enumerate() {
            if pad_shape(shape, master.len()) != master {
                return Err(RuntimeError::IncompatibleShapes(format!(
                    "output {} has shape {:?}, iteration shape is {:?}",
                    i, shape, master
                )));
            }
        }
        let master = pad_shape(&master, TENSOR_RANK);
        let mut parallel_domain = master.clone();
        parallel_domain[TENSOR_RANK - 2] = 1;
        parallel_domain[TENSOR_RANK - 1] = 1;
        let units: usize = parallel_domain.iter().product();

        // Matmul configs only depend on the operand shapes and layouts; the
        // layouts may change once the repacking plan is known.
        let candidates = self.repack_candidates();
        let draft_gemms = self.gemm_configs(&node_shapes, &[])?;
        let repacking = self.resolve_strategy(&candidates, input_shapes, &master, units, &draft_gemms, nthreads);
        let repacked: Vec<usize> = match repacking {
            RepackingStrategy::None => Vec::new(),
            _ => candidates,
        };
        let gemms = self.gemm_configs(&node_shapes, &repacked)?;

        let mut strides_by_path: HashMap<(usize, bool), PortStrides> = HashMap::new();
        let mut port_strides: Vec<PortStrides> = Vec::with_capacity(self.layout.ports.len());
        for port in &self.layout.ports {
            let is_repacked = port.kind == PortKind::Input && repacked.contains(&port.index);
            let key = port.shape_path.map(|p| (p, is_repacked));
            if let Some(strides) = key.and_then(|k| strides_by_path.get(&k)) {
                port_strides.push(strides.clone());
                continue;
            }
            let strides = match port.kind {
                PortKind::Input => {
                    let layout = if is_repacked {
                        Layout::Planar
                    } else {
                        inputs[port.index].layout
                    };
                    Self::input_strides(&input_shapes[port.index], layout)
                }
                PortKind::Output => broadcast_strides(&master, &dense_strides(&master)),
                PortKind::Buffer => {
                    let g = gemms.get(port.index).ok_or_else(|| {
                        RuntimeError::IncompatibleShapes(format!("buffer {} has no matmul", port.index))
                    })?;
                    let tile = pad_shape(&[g.m, g.n], TENSOR_RANK);
                    let mut strides = broadcast_strides(&tile, &dense_strides(&tile));
                    strides[..DOMAIN_DIMS].iter_mut().for_each(|s| *s = 0);
                    strides
                }
            };
            if let Some(k) = key {
                strides_by_path.insert(k, strides.clone());
            }
            port_strides.push(strides);
        }

        let data_offsets: Vec<Vec<i64>> = self
            .layout
            .ports
            .iter()
            .zip(&port_strides)
            .map(|(port, strides)| {
                let elem = port.precision.size_bytes() as i64;
                let in_parallel_repacked = repacking == RepackingStrategy::InParallel
                    && port.kind == PortKind::Input
                    && repacked.contains(&port.index);
                if port.kind == PortKind::Buffer || in_parallel_repacked {
                    return vec![0; TENSOR_RANK];
                }
                let mut offsets: Vec<i64> = strides.iter().map(|s| s * elem).collect();
                offsets[DOMAIN_DIMS..].iter_mut().for_each(|o| *o = 0);
                offsets
            })
            .collect();
        let inner_strides: Vec<i64> = port_strides.iter().map(|s| s[TENSOR_RANK - 1]).collect();
        let row_strides: Vec<i64> = port_strides.iter().map(|s| s[TENSOR_RANK - 2]).collect();

        let loop_args = self
            .layout
            .loops
            .iter()
            .map(|l| {
                let extent = master[TENSOR_RANK - 1 - l.dim.min(TENSOR_RANK - 1)];
                let work_amount = match l.kind {
                    LoopKind::Outer => extent,
                    LoopKind::Vector => extent - extent % l.increment.max(1),
                    LoopKind::Tail => extent % self.layout.lanes.max(1),
                };
                let (ptr_increments, finalization_offsets) = l
                    .ports
                    .iter()
                    .map(|&port| {
                        let elem = self.layout.ports[port].precision.size_bytes() as i64;
                        let stride = if l.dim == 0 {
                            inner_strides[port]
                        } else {
                            row_strides[port]
                        };
                        let step = stride * elem;
                        let finalize = if l.is_last_in_dim { -(extent as i64) * step } else { 0 };
                        (step * l.increment as i64, finalize)
                    })
                    .unzip();
                LoopArgs {
                    work_amount,
                    ptr_increments,
                    finalization_offsets,
                }
            })
            .collect();

        let mut buffer_offsets = Vec::with_capacity(gemms.len());
        let mut internal_size = align_up(self.layout.spill_bytes);
        for (g, port) in gemms
            .iter()
            .zip(self.layout.ports.iter().filter(|p| p.kind == PortKind::Buffer))
        {
            buffer_offsets.push(internal_size);
            internal_size += align_up(g.m * g.n * port.precision.size_bytes());
        }

        let (repacks, repack_region_size) = self.repacking_plan(&repacked, input_shapes, repacking);

        let config = RuntimeConfig {
            input_shapes: input_shapes.to_vec(),
            output_shapes,
            master_shape: master,
            parallel_domain,
            units,
            data_offsets,
            inner_strides,
            row_strides,
            loop_args,
            buffer_offsets,
            internal_size,
            gemms,
            repacking,
            repacks,
            repack_region_size,
        };
        info!(
            master = ?config.master_shape,
            units = config.units,
            repacking = %config.repacking,
            internal = config.internal_size,
            "runtime configuration"
        );
        Ok(config)
    }

    fn gemm_configs(&self, node_shapes: &[Vec<usize>], repacked: &[usize]) -> Result<Vec<GemmConfig>, RuntimeError> {
        let inputs = self.subgraph.inputs();
        self.sites
            .iter()
            .map(|site| {
                let a_shape = &node_shapes[self.input_node(site.a_input)?];
                let b_shape = &node_shapes[self.input_node(site.b_input)?];
                let layout_of = |i: usize| {
                    if repacked.contains(&i) {
                        Layout::Planar
                    } else {
                        inputs[i].layout
                    }
                };
                let a = Self::input_strides(a_shape, layout_of(site.a_input));
                let b = Self::input_strides(b_shape, layout_of(site.b_input));
                let (m, k) = (a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]);
                let n = b_shape[b_shape.len() - 1];
                Ok(GemmConfig {
                    m,
                    n,
                    k,
                    a_strides: [a[TENSOR_RANK - 2], a[TENSOR_RANK - 1]],
                    b_strides: [b[TENSOR_RANK - 2], b[TENSOR_RANK - 1]],
                    ldc: n,
                    transposed_b: layout_of(site.b_input) == Layout::TransposedLast2,
                })
            })
            .collect()
    }

    fn input_node(&self, input: usize) -> Result<usize, RuntimeError> {
        self.subgraph
            .input_node(input)
            .map(|n| n.0)
            .ok_or(RuntimeError::MissingArgument {
                what: "input node",
                index: input,
            })
    }

    fn repacking_plan(
        &self,
        repacked: &[usize],
        input_shapes: &[Vec<usize>],
        strategy: RepackingStrategy,
    ) -> (Vec<RepackingDescriptor>, usize) {
        let mut descriptors = Vec::with_capacity(repacked.len());
        let mut region = 0usize;
        for &input in repacked {
            let decl = &self.subgraph.inputs()[input];
            let elem = decl.precision.size_bytes();
            let padded = pad_shape(&input_shapes[input], TENSOR_RANK);
            let source = Self::input_strides(&input_shapes[input], decl.layout);
            let (rows, cols) = (padded[TENSOR_RANK - 2], padded[TENSOR_RANK - 1]);
            let config = RepackConfig {
                rows,
                cols,
                elem_bytes: elem,
                src_row_stride: source[TENSOR_RANK - 2],
                src_col_stride: source[TENSOR_RANK - 1],
            };
            let slice = config.dst_bytes() as i64;
            let in_offsets: Vec<i64> = source[..DOMAIN_DIMS].iter().map(|s| s * elem as i64).collect();
            let extents = &padded[..DOMAIN_DIMS];
            let out_strides: Vec<i64> = dense_strides(extents).iter().map(|s| s * slice).collect();
            let descriptor = RepackingDescriptor {
                input,
                config,
                in_offsets: in_offsets.clone(),
                source_domain: Strided::from_parts(extents, &in_offsets),
                out_offsets: Strided::from_parts(extents, &out_strides),
                region_offset: region,
            };
            // Separate repacks the whole tensor, in-parallel one slice per worker.
            let slices = match strategy {
                RepackingStrategy::Separate => extents.iter().product(),
                _ => 1,
            };
            region += align_up(slices * config.dst_bytes());
            descriptors.push(descriptor);
        }
        if !descriptors.is_empty() {
            debug!(inputs = descriptors.len(), region, %strategy, "repacking plan");
        }
        (descriptors, region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::config::CompileOptions;
    use crate::subgraph::Dim;
    use snipjit_platform::{IsaTier, Target, TargetArchitecture, TargetCapabilities, TargetOperatingSystem};

    fn avx2() -> TargetCapabilities {
        TargetCapabilities::for_isa(
            Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux),
            IsaTier::Avx2,
        )
    }

    fn dims(shape: &[usize]) -> Vec<Dim> {
        shape.iter().map(|&n| Dim::Static(n)).collect()
    }

    fn add_relu(shape: &[Dim]) -> Subgraph {
        let mut g = Subgraph::new();
        let a = g.input(shape, Precision::F32);
        let b = g.input(shape, Precision::F32);
        let sum = g.add(a, b);
        let out = g.relu(sum);
        g.output(out);
        g
    }

    #[test]
    fn test_static_loop_args() {
        let g = add_relu(&dims(&[2, 3, 8]));
        let options = CompileOptions::new().with_vector_lanes(4).with_threads_hint(2);
        let compiled = compile(&g, &avx2(), &options).unwrap();
        let config = compiled.static_config().unwrap();

        assert_eq!(config.master_shape, vec![1, 1, 1, 2, 3, 8]);
        assert_eq!(config.parallel_domain, vec![1, 1, 1, 2, 1, 1]);
        assert_eq!(config.units, 2);
        assert_eq!(config.loop_args.len(), 2);

        let outer = &config.loop_args[0];
        assert_eq!(outer.work_amount, 3);
        assert_eq!(outer.ptr_increments, vec![32, 32, 32]);
        assert_eq!(outer.finalization_offsets, vec![-96, -96, -96]);

        let vector = &config.loop_args[1];
        assert_eq!(vector.work_amount, 8);
        assert_eq!(vector.ptr_increments, vec![16, 16, 16]);
        assert_eq!(vector.finalization_offsets, vec![-32, -32, -32]);

        assert_eq!(config.data_offsets[0], vec![0, 0, 0, 96, 0, 0]);
        assert_eq!(config.repacking, RepackingStrategy::None);
    }

    #[test]
    fn test_dynamic_tail_work_amounts() {
        let g = add_relu(&[Dim::Dynamic, Dim::Static(3), Dim::Dynamic]);
        let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
        let config = compiled
            .configurator()
            .configure(&[vec![2, 3, 10], vec![2, 3, 10]], 2)
            .unwrap();

        let work: Vec<usize> = config.loop_args.iter().map(|a| a.work_amount).collect();
        assert_eq!(work, vec![3, 8, 2]);
        // Only the tail loop rewinds the innermost dimension.
        assert_eq!(config.loop_args[1].finalization_offsets, vec![0, 0, 0]);
        assert_eq!(config.loop_args[2].finalization_offsets, vec![-40, -40, -40]);
        assert_eq!(config.loop_args[1].ptr_increments, vec![32, 32, 32]);
    }

    #[test]
    fn test_broadcast_input_strides() {
        let mut g = Subgraph::new();
        let a = g.input(&dims(&[2, 3, 8]), Precision::F32);
        let b = g.input(&dims(&[8]), Precision::F32);
        let out = g.add(a, b);
        g.output(out);
        let compiled = compile(&g, &avx2(), &CompileOptions::new().with_threads_hint(1)).unwrap();
        let config = compiled.static_config().unwrap();
        assert_eq!(config.row_strides[1], 0);
        assert_eq!(config.inner_strides[1], 1);
        assert_eq!(config.data_offsets[1], vec![0; TENSOR_RANK]);
    }

    #[test]
    fn test_incompatible_outputs_rejected() {
        let g = add_relu(&[Dim::Dynamic, Dim::Dynamic]);
        let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
        let err = compiled
            .configurator()
            .configure(&[vec![2, 8], vec![3, 8]], 1)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::IncompatibleShapes(_)));
    }

    fn transposed_add(policy: RepackingPolicy) -> RuntimeConfig {
        let mut g = Subgraph::new();
        let a = g.input_with_layout(&dims(&[4, 8, 8]), Precision::F32, Layout::TransposedLast2);
        let b = g.input(&dims(&[4, 8, 8]), Precision::F32);
        let out = g.add(a, b);
        g.output(out);
        let options = CompileOptions::new().with_repacking(policy).with_threads_hint(2);
        let compiled = compile(&g, &avx2(), &options).unwrap();
        compiled.static_config().unwrap().clone()
    }

    #[test]
    fn test_transposed_strides_without_repacking() {
        let config = transposed_add(RepackingPolicy::Disabled);
        assert_eq!(config.repacking, RepackingStrategy::None);
        assert_eq!(config.inner_strides[0], 8);
        assert_eq!(config.row_strides[0], 1);
        assert_eq!(config.inner_strides[1], 1);
        assert_eq!(config.external_size(4), 0);
    }

    #[test]
    fn test_auto_repacks_separately_for_light_compute() {
        let config = transposed_add(RepackingPolicy::Auto);
        assert_eq!(config.repacking, RepackingStrategy::Separate);
        assert_eq!(config.inner_strides[0], 1);
        assert_eq!(config.row_strides[0], 8);
        assert_eq!(config.repacks.len(), 1);
        assert_eq!(config.repacks[0].slice_bytes(), 256);
        assert_eq!(config.repack_region_size, 1024);
        assert_eq!(config.external_size(8), 1024);
        // The repacked tensor is dense, so batch offsets still apply.
        assert_eq!(config.data_offsets[0], vec![0, 0, 0, 256, 0, 0]);
    }

    #[test]
    fn test_auto_repacks_in_parallel_next_to_matmul() {
        let mut g = Subgraph::new();
        let x = g.input_with_layout(&dims(&[4, 8, 8]), Precision::F32, Layout::TransposedLast2);
        let p = g.input(&dims(&[4, 8, 64]), Precision::F32);
        let q = g.input(&dims(&[4, 64, 8]), Precision::F32);
        let mm = g.matmul(p, q);
        let out = g.add(x, mm);
        g.output(out);
        let options = CompileOptions::new()
            .with_repacking(RepackingPolicy::Auto)
            .with_threads_hint(2);
        let compiled = compile(&g, &avx2(), &options).unwrap();
        let config = compiled.static_config().unwrap();

        assert_eq!(config.repacking, RepackingStrategy::InParallel);
        assert_eq!(config.data_offsets[0], vec![0; TENSOR_RANK]);
        assert_eq!(config.repack_region_size, 256);
        assert_eq!(config.external_size(2), 512);
        assert_eq!(config.repacks[0].source_offset(&[0, 0, 0, 3]), 3 * 256);
        assert_eq!(config.gemms.len(), 1);
        assert_eq!((config.gemms[0].m, config.gemms[0].n, config.gemms[0].k), (8, 8, 64));
        // Spill area first, then the matmul tile.
        assert_eq!(config.buffer_offsets[0], align_up(compiled.kernel().spill_bytes()));
    }

    #[test]
    fn test_unloaded_transposed_input_is_not_repacked() {
        let mut g = Subgraph::new();
        let p = g.input(&dims(&[8, 4]), Precision::F32);
        let q = g.input_with_layout(&dims(&[4, 8]), Precision::F32, Layout::TransposedLast2);
        let mm = g.matmul(p, q);
        g.output(mm);
        let options = CompileOptions::new().with_repacking(RepackingPolicy::Separate);
        let compiled = compile(&g, &avx2(), &options).unwrap();
        let config = compiled.static_config().unwrap();
        assert_eq!(config.repacking, RepackingStrategy::None);
        assert!(config.gemms[0].transposed_b);
    }
}
