//! Structural errors of a linear IR.

use thiserror::Error;

use crate::expression::{ExprId, ValueId};
use crate::loops::LoopId;

/// A malformed LIS. These never come from user input: the sequence is built
/// internally, so any of these means a pass broke an invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LirError {
    #[error("loop end for {loop_id} at position {position} has no open loop begin")]
    UnmatchedLoopEnd { loop_id: LoopId, position: usize },

    #[error("loop {loop_id} is never closed")]
    UnclosedLoop { loop_id: LoopId },

    #[error("loop {loop_id} begins twice")]
    DuplicateLoopBegin { loop_id: LoopId },

    #[error("loop end for {found} closes over still-open loop {expected}")]
    OverlappingLoops { expected: LoopId, found: LoopId },

    #[error("loop {loop_id} is not registered")]
    UnknownLoop { loop_id: LoopId },

    #[error("expression {expr} reads dangling value {value}")]
    DanglingValue { expr: ExprId, value: ValueId },

    #[error("expression {expr} reads value {value} before it is defined")]
    UseBeforeDefinition { expr: ExprId, value: ValueId },

    #[error("port {port} is out of range")]
    UnknownPort { port: usize },
}
