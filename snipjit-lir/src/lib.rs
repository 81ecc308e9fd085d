//! snipjit-lir - Lowered Instruction Sequence type definitions
//!
//! The LIS is the representation every compiler stage of snipjit works on:
//! a flat, ordered list of [`Expression`]s with explicit loop markers,
//! buffers and subgraph boundary markers, plus an arena of [`Value`]s that
//! expressions produce and consume.
//!
//! ## Architecture
//!
//! - Memory values name a *port*: a data pointer slot of the kernel
//!   (inputs first, then outputs, then scratch buffers).
//! - Register values are either general-purpose (loop work counters) or
//!   vector registers (everything the kernel computes).
//! - Loops are described by [`LoopInfo`] and delimited in the sequence by a
//!   `LoopBegin`/`LoopEnd` pair. Expressions carry a `loop_ids` annotation
//!   that the loop insertion pass turns into markers.
//!
//! ## Usage
//!
//! ```rust
//! use snipjit_lir::{LinearIr, OpKind, PortKind, Precision, ValueKind};
//!
//! let mut lir = LinearIr::new();
//! let port = lir.add_port(PortKind::Input, Precision::F32);
//! let param = lir.append(OpKind::Parameter { index: 0 }, vec![], &[ValueKind::Memory { port }], Precision::F32);
//! assert_eq!(lir.len(), 1);
//! # let _ = param;
//! ```

pub mod error;
pub mod expression;
pub mod linear_ir;
pub mod loops;
pub mod register;
pub mod types;

pub use error::LirError;
pub use expression::{BinaryOp, BufferScope, ExprId, Expression, OpKind, UnaryOp, Value, ValueId, ValueKind};
pub use linear_ir::{LinearIr, PortInfo, PortKind};
pub use loops::{LoopArgs, LoopId, LoopInfo, LoopKind};
pub use register::{PhysicalReg, RegisterClass};
pub use types::Precision;
