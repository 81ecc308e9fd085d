//! Runtime side of a compiled kernel
//!
//! The configurator turns observed input shapes into loop arguments,
//! strides, offsets and a repacking plan. The executor splits the parallel
//! domain across a rayon-backed pool and calls the kernel once per unit.

pub mod configurator;
pub mod domain;
pub mod executor;
pub mod fault;
pub mod kernel_cache;
pub mod parallel;
pub mod scratch;
pub mod tensor;

pub use configurator::{
    KernelLayout, LoopLayout, PortLayout, RepackingDescriptor, RepackingStrategy, RuntimeConfig,
    RuntimeConfigurator,
};
pub use domain::{Strided, TENSOR_RANK};
pub use executor::{ExecContext, ExecutionStats, ExecutorState, SubgraphExecutor};
pub use kernel_cache::{
    AuxKernel, CacheStats, ExecutorKey, GemmConfig, GemmKernel, KernelExecutorCache,
    KernelExecutorTable, RepackConfig, RepackKernel,
};
pub use parallel::{splitter, ThreadPool};
pub use scratch::{HeapAllocator, ScratchAllocator, ScratchBuffer};
pub use tensor::Tensor;
