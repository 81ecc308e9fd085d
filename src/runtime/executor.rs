//! Subgraph execution over the thread pool.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::configurator::{RepackingStrategy, RuntimeConfig, DOMAIN_DIMS};
use super::domain::{unravel, TENSOR_RANK};
use super::fault;
use super::kernel_cache::{KernelExecutorCache, KernelExecutorTable};
use super::parallel::{splitter, SyncPtr, ThreadPool};
use super::scratch::{HeapAllocator, ScratchAllocator, ScratchBuffer};
use super::tensor::Tensor;
use crate::compiler::CompiledKernel;
use crate::emitter::{CallArgs, KernelKind};
use crate::env;
use crate::error::RuntimeError;

/// Per-shape configurations a dynamic executor remembers by default.
pub const DEFAULT_SPECIALIZATION_CACHE: usize = 8;

/// Shared resources executors run with.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub pool: Arc<ThreadPool>,
    pub cache: Arc<KernelExecutorCache>,
    pub allocator: Arc<dyn ScratchAllocator>,
    /// Arm the fault hook (debug builds on Linux only).
    pub segfault_detector: bool,
}

impl ExecContext {
    pub fn new(threads: usize) -> Result<Self, RuntimeError> {
        Ok(Self {
            pool: Arc::new(ThreadPool::new(threads)?),
            cache: Arc::new(KernelExecutorCache::new()),
            allocator: Arc::new(HeapAllocator),
            segfault_detector: env::segfault_detector_enabled(),
        })
    }

    /// Context sized by `SNIPJIT_THREADS`, or one worker per CPU.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self {
            pool: Arc::new(ThreadPool::from_env()?),
            cache: Arc::new(KernelExecutorCache::new()),
            allocator: Arc::new(HeapAllocator),
            segfault_detector: env::segfault_detector_enabled(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<KernelExecutorCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ScratchAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_segfault_detector(mut self, enabled: bool) -> Self {
        self.segfault_detector = enabled;
        self
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Dynamic kernel that has not seen input shapes yet.
    Unconfigured,
    /// A configuration is bound, no call has completed with it yet.
    Configured,
    Executing,
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub calls: usize,
    /// Configurations bound after the first.
    pub reconfigurations: usize,
    /// Shape changes served from the specialization cache.
    pub config_cache_hits: usize,
    pub repack_invocations: usize,
    /// In-parallel repacks skipped because the worker already held the slice.
    pub repack_skips: usize,
}

/// Last source offset each input was repacked from, per worker.
#[derive(Debug, Default, Clone)]
struct RepackMemo {
    last: Vec<Option<i64>>,
}

impl RepackMemo {
    fn reset(&mut self, inputs: usize) {
        self.last.clear();
        self.last.resize(inputs, None);
    }
}

/// Runs a compiled kernel over its parallel domain.
pub struct SubgraphExecutor {
    compiled: Arc<CompiledKernel>,
    ctx: ExecContext,
    state: ExecutorState,
    config: Option<Arc<RuntimeConfig>>,
    configs: LruCache<Vec<Vec<usize>>, Arc<RuntimeConfig>>,
    table: KernelExecutorTable,
    scratch: Option<Arc<ScratchBuffer>>,
    memos: Vec<RepackMemo>,
    stats: ExecutionStats,
}

impl std::fmt::Debug for SubgraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphExecutor")
            .field("kernel", &self.compiled.name())
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl SubgraphExecutor {
    pub fn new(compiled: Arc<CompiledKernel>, ctx: ExecContext) -> Self {
        if ctx.segfault_detector && compiled.target().target.operating_system.supports_fault_hook() {
            fault::install();
        }
        let capacity = env::specialization_cache_capacity().unwrap_or(DEFAULT_SPECIALIZATION_CACHE);
        let mut executor = Self {
            configs: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            compiled,
            ctx,
            state: ExecutorState::Unconfigured,
            config: None,
            table: KernelExecutorTable::default(),
            scratch: None,
            memos: Vec::new(),
            stats: ExecutionStats::default(),
        };
        if let Some(config) = executor.compiled.static_config().cloned() {
            executor.bind(Arc::new(config));
        }
        executor
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    pub fn config(&self) -> Option<&RuntimeConfig> {
        self.config.as_deref()
    }

    pub fn compiled(&self) -> &CompiledKernel {
        &self.compiled
    }

    pub fn context(&self) -> &ExecContext {
        &self.ctx
    }

    /// Make `config` current: rebind auxiliary kernels and drop every
    /// worker's repack memo.
    fn bind(&mut self, config: Arc<RuntimeConfig>) {
        let inputs = self.compiled.subgraph().inputs().len();
        self.table
            .bind(&self.ctx.cache, &config.gemms, &config.repack_configs(), inputs);
        for memo in &mut self.memos {
            memo.reset(inputs);
        }
        if self.config.is_some() {
            self.stats.reconfigurations += 1;
        }
        self.config = Some(config);
        self.state = ExecutorState::Configured;
    }

    /// Configuration for `shapes`, reconfiguring when they changed.
    fn prepare(&mut self, shapes: &[Vec<usize>]) -> Result<Arc<RuntimeConfig>, RuntimeError> {
        if let Some(config) = &self.config {
            if config.input_shapes == shapes {
                return Ok(config.clone());
            }
        }
        if let Some(config) = self.compiled.static_config() {
            let (index, expected, found) = config
                .input_shapes
                .iter()
                .zip(shapes)
                .enumerate()
                .find(|(_, (e, f))| e != f)
                .map(|(i, (e, f))| (i, e.clone(), f.clone()))
                .unwrap_or_default();
            return Err(RuntimeError::ShapeMismatch {
                what: "input",
                index,
                expected,
                found,
            });
        }

        let key = shapes.to_vec();
        let config = match self.configs.get(&key) {
            Some(config) => {
                self.stats.config_cache_hits += 1;
                config.clone()
            }
            None => {
                let config = Arc::new(self.compiled.configurator().configure(shapes, self.ctx.threads())?);
                self.configs.put(key, config.clone());
                config
            }
        };
        info!(kernel = %self.compiled.name(), shapes = ?shapes, "reconfigured for new shapes");
        self.bind(config.clone());
        Ok(config)
    }

    fn check_tensors(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), RuntimeError> {
        let decls = self.compiled.subgraph().inputs();
        if inputs.len() != decls.len() {
            return Err(RuntimeError::ArityMismatch {
                what: "inputs",
                expected: decls.len(),
                found: inputs.len(),
            });
        }
        let expected_outputs = self.compiled.subgraph().outputs().len();
        if outputs.len() != expected_outputs {
            return Err(RuntimeError::ArityMismatch {
                what: "outputs",
                expected: expected_outputs,
                found: outputs.len(),
            });
        }
        for (index, (tensor, decl)) in inputs.iter().zip(decls).enumerate() {
            if tensor.precision() != decl.precision {
                return Err(RuntimeError::PrecisionMismatch {
                    what: "input",
                    index,
                    expected: decl.precision,
                    found: tensor.precision(),
                });
            }
            if tensor.layout() != decl.layout {
                return Err(RuntimeError::IncompatibleShapes(format!(
                    "input {} is stored as {:?}, declared {:?}",
                    index,
                    tensor.layout(),
                    decl.layout
                )));
            }
        }
        Ok(())
    }

    /// Run the kernel over `inputs`, writing `outputs`.
    pub fn execute(&mut self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), RuntimeError> {
        self.check_tensors(inputs, outputs)?;
        let shapes: Vec<Vec<usize>> = inputs.iter().map(|t| t.shape().to_vec()).collect();
        let config = self.prepare(&shapes)?;

        let n_inputs = inputs.len();
        let output_ports = &self.compiled.configurator().layout().ports[n_inputs..];
        for (index, tensor) in outputs.iter().enumerate() {
            if tensor.shape() != config.output_shapes[index].as_slice() {
                return Err(RuntimeError::ShapeMismatch {
                    what: "output",
                    index,
                    expected: config.output_shapes[index].clone(),
                    found: tensor.shape().to_vec(),
                });
            }
            let expected = output_ports[index].precision;
            if tensor.precision() != expected {
                return Err(RuntimeError::PrecisionMismatch {
                    what: "output",
                    index,
                    expected,
                    found: tensor.precision(),
                });
            }
        }

        self.state = ExecutorState::Executing;
        let result = self.dispatch(&config, inputs, outputs);
        self.state = ExecutorState::Idle;
        self.stats.calls += 1;
        result
    }

    fn ensure_scratch(&mut self, size: usize) -> Result<*mut u8, RuntimeError> {
        let reusable = self.scratch.as_ref().is_some_and(|s| s.len() >= size);
        if !reusable {
            debug!(size, "allocating scratch");
            self.scratch = Some(self.ctx.allocator.allocate(size)?);
        }
        Ok(self
            .scratch
            .as_ref()
            .map_or(std::ptr::null_mut(), |s| s.as_mut_ptr()))
    }

    fn dispatch(&mut self, config: &RuntimeConfig, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), RuntimeError> {
        let nthreads = self.ctx.threads().min(config.units).max(1);
        let internal = config.internal_size;
        let external_offset = internal * nthreads;
        let scratch = self.ensure_scratch(external_offset + config.external_size(nthreads))?;
        let external = SyncPtr(scratch.wrapping_add(external_offset));
        let scratch = SyncPtr(scratch);

        let mut src_base: Vec<SyncPtr<u8>> = inputs.iter().map(|t| SyncPtr(t.as_ptr() as *mut u8)).collect();
        let dst_base: Vec<SyncPtr<u8>> = outputs.iter_mut().map(|t| SyncPtr(t.as_mut_ptr())).collect();

        let invocations = AtomicUsize::new(0);
        let skips = AtomicUsize::new(0);

        if config.repacking == RepackingStrategy::Separate {
            for desc in &config.repacks {
                let Some(repack) = self.table.repack(desc.input) else {
                    return Err(RuntimeError::MissingExecutor { site: desc.input });
                };
                let src = src_base[desc.input];
                let region = SyncPtr(external.get().wrapping_add(desc.region_offset));
                let slices = desc.source_domain.len();
                self.ctx.pool.parallel_for(&[slices], |_, idx| {
                    let from = src.get().wrapping_offset(desc.source_domain.offset_of(idx[0]) as isize);
                    let to = region.get().wrapping_offset(desc.out_offsets.offset_of(idx[0]) as isize);
                    // Slices are disjoint regions of the repack scratch.
                    unsafe { repack.run(from, to) };
                });
                invocations.fetch_add(slices, Ordering::Relaxed);
                src_base[desc.input] = region;
            }
        }

        let inputs_count = inputs.len();
        if self.memos.len() < nthreads {
            self.memos.resize(nthreads, RepackMemo::default());
        }
        for memo in &mut self.memos {
            memo.reset(inputs_count);
        }

        let compiled = &self.compiled;
        let kernel = compiled.kernel();
        let table = &self.table;
        let detector = self.ctx.segfault_detector;
        let failure: Mutex<Option<RuntimeError>> = Mutex::new(None);
        let in_parallel = config.repacking == RepackingStrategy::InParallel;

        self.ctx.pool.run_with_state(&mut self.memos[..nthreads], |ithr, nthr, memo| {
            let (start, end) = splitter(config.units, nthr, ithr);
            trace!(ithr, start, end, "worker dispatch");
            let thread_scratch = scratch.get().wrapping_add(ithr * internal);
            let repack_region = external.get().wrapping_add(ithr * config.repack_region_size);

            let mut base_src: Vec<*const u8> = src_base.iter().map(|p| p.get() as *const u8).collect();
            if in_parallel {
                for desc in &config.repacks {
                    base_src[desc.input] = repack_region.wrapping_add(desc.region_offset);
                }
            }
            let base_dst: Vec<*mut u8> = dst_base.iter().map(|p| p.get()).collect();
            let mut unit_src = base_src.clone();
            let mut unit_dst = base_dst.clone();
            let mut index = [0usize; TENSOR_RANK];

            for unit in start..end {
                unravel(unit, &config.parallel_domain, &mut index);
                if in_parallel {
                    for desc in &config.repacks {
                        let offset = desc.source_offset(&index[..DOMAIN_DIMS]);
                        if memo.last[desc.input] == Some(offset) {
                            skips.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        let Some(repack) = table.repack(desc.input) else {
                            *failure.lock() = Some(RuntimeError::MissingExecutor { site: desc.input });
                            return;
                        };
                        let from = src_base[desc.input].get().wrapping_offset(offset as isize);
                        // Each worker owns its repack region.
                        unsafe { repack.run(from, base_src[desc.input] as *mut u8) };
                        memo.last[desc.input] = Some(offset);
                        invocations.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let indexes: &[usize] = match kernel.kind {
                    KernelKind::Static => &index,
                    KernelKind::Dynamic => {
                        let offset_of = |port: usize| -> isize {
                            config.data_offsets[port]
                                .iter()
                                .zip(&index)
                                .map(|(off, &i)| off * i as i64)
                                .sum::<i64>() as isize
                        };
                        for (i, ptr) in unit_src.iter_mut().enumerate() {
                            *ptr = base_src[i].wrapping_offset(offset_of(i));
                        }
                        for (j, ptr) in unit_dst.iter_mut().enumerate() {
                            *ptr = base_dst[j].wrapping_offset(offset_of(inputs_count + j));
                        }
                        &[]
                    }
                };
                let (src_ptrs, dst_ptrs) = match kernel.kind {
                    KernelKind::Static => (&base_src, &base_dst),
                    KernelKind::Dynamic => (&unit_src, &unit_dst),
                };
                let args = CallArgs {
                    src_ptrs,
                    dst_ptrs,
                    scratch: thread_scratch,
                    buffer_offsets: &config.buffer_offsets,
                    loop_args: &config.loop_args,
                    inner_strides: &config.inner_strides,
                    executors: table,
                };
                let _scope = detector.then(|| fault::enter(kernel.name.as_str(), kernel.kind, unit));
                // Pointers and scratch follow the configuration the kernel is
                // called with; units of one worker run sequentially.
                if let Err(err) = unsafe { kernel.call(&args, indexes) } {
                    *failure.lock() = Some(err);
                    return;
                }
            }
        });

        self.stats.repack_invocations += invocations.load(Ordering::Relaxed);
        self.stats.repack_skips += skips.load(Ordering::Relaxed);
        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
