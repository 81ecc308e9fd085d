//! Auxiliary kernels (matmul, repacking) and the cache sharing them.
//!
//! Auxiliary kernels depend only on their config, so every executor in a
//! process can share them. The [`KernelExecutorCache`] is injected through
//! the execution context; each executor binds what its current
//! configuration needs into its own [`KernelExecutorTable`].

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

/// `C[m, n] = A[m, k] * B[k, n]` over f32, strides in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmConfig {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Row and column stride of A.
    pub a_strides: [i64; 2],
    /// Row and column stride of B.
    pub b_strides: [i64; 2],
    pub ldc: usize,
    /// B is read with its last two dimensions swapped.
    pub transposed_b: bool,
}

#[derive(Debug)]
pub struct GemmKernel {
    config: GemmConfig,
}

impl GemmKernel {
    pub fn new(config: GemmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    /// # Safety
    ///
    /// `a`, `b` and `c` must cover the extents and strides of the config.
    pub unsafe fn run(&self, a: *const u8, b: *const u8, c: *mut u8) {
        let GemmConfig {
            m,
            n,
            k,
            a_strides,
            b_strides,
            ldc,
            ..
        } = self.config;
        let (a, b, c) = (a as *const f32, b as *const f32, c as *mut f32);
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    let x = ptr::read_unaligned(a.offset(i as isize * a_strides[0] as isize + p as isize * a_strides[1] as isize));
                    let y = ptr::read_unaligned(b.offset(p as isize * b_strides[0] as isize + j as isize * b_strides[1] as isize));
                    acc += x * y;
                }
                ptr::write_unaligned(c.add(i * ldc + j), acc);
            }
        }
    }
}

/// Copy a `[rows, cols]` slice read with arbitrary strides into dense
/// row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepackConfig {
    pub rows: usize,
    pub cols: usize,
    pub elem_bytes: usize,
    /// Source strides in elements.
    pub src_row_stride: i64,
    pub src_col_stride: i64,
}

impl RepackConfig {
    pub fn dst_bytes(&self) -> usize {
        self.rows * self.cols * self.elem_bytes
    }
}

#[derive(Debug)]
pub struct RepackKernel {
    config: RepackConfig,
}

impl RepackKernel {
    pub fn new(config: RepackConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RepackConfig {
        &self.config
    }

    /// # Safety
    ///
    /// `src` must cover the strided slice and `dst` `dst_bytes()` bytes;
    /// the two must not overlap.
    pub unsafe fn run(&self, src: *const u8, dst: *mut u8) {
        let RepackConfig {
            rows,
            cols,
            elem_bytes,
            src_row_stride,
            src_col_stride,
        } = self.config;
        let eb = elem_bytes as isize;
        for r in 0..rows {
            for c in 0..cols {
                let from = src.offset((r as isize * src_row_stride as isize + c as isize * src_col_stride as isize) * eb);
                let to = dst.add((r * cols + c) * elem_bytes);
                ptr::copy_nonoverlapping(from, to, elem_bytes);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKey {
    Gemm(GemmConfig),
    Repack(RepackConfig),
}

#[derive(Debug, Clone)]
pub enum AuxKernel {
    Gemm(Arc<GemmKernel>),
    Repack(Arc<RepackKernel>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

/// Process-wide store of auxiliary kernels keyed by config. Lookups take
/// the read lock; a miss takes the write lock and inserts if still absent.
#[derive(Debug, Default)]
pub struct KernelExecutorCache {
    kernels: RwLock<HashMap<ExecutorKey, AuxKernel>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl KernelExecutorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(&self, key: ExecutorKey, make: impl FnOnce() -> AuxKernel) -> AuxKernel {
        if let Some(kernel) = self.kernels.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return kernel.clone();
        }
        let mut kernels = self.kernels.write();
        if let Some(kernel) = kernels.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return kernel.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(?key, "building auxiliary kernel");
        let kernel = make();
        kernels.insert(key, kernel.clone());
        kernel
    }

    pub fn gemm(&self, config: GemmConfig) -> Arc<GemmKernel> {
        match self.get_or_insert_with(ExecutorKey::Gemm(config), || {
            AuxKernel::Gemm(Arc::new(GemmKernel::new(config)))
        }) {
            AuxKernel::Gemm(kernel) => kernel,
            AuxKernel::Repack(_) => Arc::new(GemmKernel::new(config)),
        }
    }

    pub fn repack(&self, config: RepackConfig) -> Arc<RepackKernel> {
        match self.get_or_insert_with(ExecutorKey::Repack(config), || {
            AuxKernel::Repack(Arc::new(RepackKernel::new(config)))
        }) {
            AuxKernel::Repack(kernel) => kernel,
            AuxKernel::Gemm(_) => Arc::new(RepackKernel::new(config)),
        }
    }

    pub fn len(&self) -> usize {
        self.kernels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Drop every kernel and reset the counters. Executors keep the kernels
    /// they already bound.
    pub fn clear(&self) {
        self.kernels.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Auxiliary kernels bound for one executor's current configuration.
#[derive(Debug, Clone, Default)]
pub struct KernelExecutorTable {
    gemm: Vec<Arc<GemmKernel>>,
    repack: Vec<Option<Arc<RepackKernel>>>,
}

impl KernelExecutorTable {
    /// Matmul kernel of call site `site`.
    pub fn gemm(&self, site: usize) -> Option<&GemmKernel> {
        self.gemm.get(site).map(|k| k.as_ref())
    }

    /// Repack kernel of input `input`, if that input is repacked.
    pub fn repack(&self, input: usize) -> Option<&RepackKernel> {
        self.repack.get(input).and_then(|k| k.as_deref())
    }

    pub fn bind(&mut self, cache: &KernelExecutorCache, gemms: &[GemmConfig], repacks: &[(usize, RepackConfig)], inputs: usize) {
        self.reset();
        self.gemm = gemms.iter().map(|config| cache.gemm(*config)).collect();
        self.repack = vec![None; inputs];
        for (input, config) in repacks {
            if let Some(slot) = self.repack.get_mut(*input) {
                *slot = Some(cache.repack(*config));
            }
        }
    }

    pub fn reset(&mut self) {
        self.gemm.clear();
        self.repack.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.gemm.is_empty() && self.repack.iter().all(Option::is_none)
    }
}
