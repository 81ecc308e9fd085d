//! Error types for the snipjit compiler and executor.
//!
//! Errors are layered the way the pipeline is: structural errors from the
//! pass pipeline, resource errors from the register allocator, selection
//! errors from the emitter, and runtime errors from the executor. All of them
//! fold into [`SnipjitError`].

use snipjit_lir::{ExprId, LirError, Precision, RegisterClass, ValueId};
use thiserror::Error;

/// Errors raised while transforming a linear IR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    /// A pass left the sequence malformed. Always an internal bug.
    #[error("pass `{pass}` left a malformed sequence: {source}")]
    Structural {
        pass: &'static str,
        #[source]
        source: LirError,
    },

    /// The dependency graph still has a cycle after loop-escape repair.
    #[error("dependency cycle through {expr} ({op}) after loop-escape repair")]
    CyclicDependency { expr: ExprId, op: &'static str },

    /// A pass found the sequence in a shape it cannot handle.
    #[error("pass `{pass}`: {message}")]
    Invariant { pass: &'static str, message: String },
}

/// Register budget exhaustion. Fatal for the subgraph being compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegAllocError {
    #[error("no {class} register left for {value} ({available} available)")]
    BudgetExceeded {
        value: ValueId,
        class: RegisterClass,
        available: usize,
    },

    #[error("{ports} data pointers and {args} argument registers do not fit in {available} general-purpose registers")]
    TooManyDataPointers {
        ports: usize,
        args: usize,
        available: usize,
    },
}

/// Emitter selection and code generation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    /// No emitter handles this operation at this precision.
    #[error("unsupported operation `{op}` at precision {precision}")]
    Unsupported { op: String, precision: Precision },

    #[error("value {value} has no register assignment")]
    MissingLocation { value: ValueId },

    #[error("port {port} has no pinned data pointer")]
    MissingDataPointer { port: usize },

    #[error("static kernel `{kernel}` emitted without a static runtime configuration")]
    MissingStaticConfig { kernel: String },

    #[error("loop end for {loop_id} without a matching loop begin")]
    UnmatchedLoop { loop_id: String },
}

/// Everything `compile` can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The subgraph uses a construct no kernel can be generated for.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("precision error: {0}")]
    Precision(String),

    #[error(transparent)]
    Pass(#[from] PassError),

    #[error(transparent)]
    RegAlloc(#[from] RegAllocError),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Errors surfaced by the subgraph executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("expected {expected} {what}, got {found}")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} {index}: expected precision {expected}, got {found}")]
    PrecisionMismatch {
        what: &'static str,
        index: usize,
        expected: Precision,
        found: Precision,
    },

    /// Observed shape differs from the one a static kernel was built for, or
    /// from the one the current configuration expects.
    #[error("{what} {index}: expected shape {expected:?}, got {found:?}")]
    ShapeMismatch {
        what: &'static str,
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("incompatible shapes: {0}")]
    IncompatibleShapes(String),

    #[error("tensor data holds {found} bytes, shape needs {expected}")]
    DataSize { expected: usize, found: usize },

    #[error("failed to allocate {size} bytes of scratch memory")]
    Allocation { size: usize },

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("no auxiliary kernel bound for call site {site}")]
    MissingExecutor { site: usize },

    /// The call arguments lack an entry the kernel reads.
    #[error("call arguments have no {what} {index}")]
    MissingArgument { what: &'static str, index: usize },
}

/// Main error type of the crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnipjitError {
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("execution failed: {0}")]
    Runtime(#[from] RuntimeError),
}

impl From<PassError> for SnipjitError {
    fn from(err: PassError) -> Self {
        SnipjitError::Compile(err.into())
    }
}

impl From<RegAllocError> for SnipjitError {
    fn from(err: RegAllocError) -> Self {
        SnipjitError::Compile(err.into())
    }
}

impl From<EmitError> for SnipjitError {
    fn from(err: EmitError) -> Self {
        SnipjitError::Compile(err.into())
    }
}

pub type Result<T> = std::result::Result<T, SnipjitError>;
