//! # snipjit
//!
//! snipjit compiles small fused tensor subgraphs (element-wise chains with
//! optional matrix multiplies) into loop kernels and runs them over a
//! parallel domain.
//!
//! ## Overview
//!
//! - **Subgraph**: nodes built through [`Subgraph`], with static or dynamic
//!   input dimensions.
//! - **LIS**: the linear IR in `snipjit-lir`, transformed by the pass
//!   pipeline in [`passes`].
//! - **Register allocation**: linear scan over live intervals, see
//!   [`regalloc`].
//! - **Emitter**: per-operation emitters producing a [`Kernel`].
//! - **Runtime**: [`RuntimeConfigurator`] and [`SubgraphExecutor`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use snipjit::{compile, CompileOptions, Dim, ExecContext, Precision, Subgraph};
//! use snipjit::{SubgraphExecutor, TargetCapabilities, Tensor};
//!
//! let mut graph = Subgraph::new();
//! let a = graph.input(&[Dim::Static(2), Dim::Static(8)], Precision::F32);
//! let b = graph.input(&[Dim::Static(2), Dim::Static(8)], Precision::F32);
//! let sum = graph.add(a, b);
//! let out = graph.relu(sum);
//! graph.output(out);
//!
//! let kernel = compile(&graph, &TargetCapabilities::detect_host(), &CompileOptions::new())?;
//! let mut executor = SubgraphExecutor::new(Arc::new(kernel), ExecContext::new(2)?);
//!
//! let lhs = Tensor::from_f32(&[2, 8], &[1.0; 16])?;
//! let rhs = Tensor::from_f32(&[2, 8], &[-3.0; 16])?;
//! let mut outputs = vec![Tensor::zeros(&[2, 8], Precision::F32)];
//! executor.execute(&[lhs, rhs], &mut outputs)?;
//! assert!(outputs[0].to_f32_vec().iter().all(|&v| v == 0.0));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Environment
//!
//! `SNIPJIT_THREADS`, `SNIPJIT_REPACKING`, `SNIPJIT_SEGFAULT_DETECTOR`,
//! `SNIPJIT_DUMP_LIS` and `SNIPJIT_SPECIALIZATION_CACHE` override defaults,
//! see [`env`].

pub mod compiler;
pub mod config;
pub mod emitter;
pub mod env;
pub mod error;
pub mod lowering;
pub mod passes;
pub mod regalloc;
pub mod runtime;
pub mod subgraph;

pub use compiler::{compile, CompiledKernel};
pub use config::{CompileOptions, RepackingPolicy, SpecializationPolicy};
pub use emitter::{Kernel, KernelKind};
pub use error::{
    CompileError, EmitError, PassError, RegAllocError, Result, RuntimeError, SnipjitError,
};
pub use runtime::{
    ExecContext, ExecutionStats, ExecutorState, KernelExecutorCache, RepackingStrategy,
    RuntimeConfig, SubgraphExecutor, Tensor, ThreadPool,
};
pub use subgraph::{Dim, Layout, NodeId, Subgraph};

pub use snipjit_lir::{BinaryOp, LinearIr, Precision, UnaryOp};
pub use snipjit_platform::{IsaTier, Target, TargetArchitecture, TargetCapabilities, TargetOperatingSystem};
