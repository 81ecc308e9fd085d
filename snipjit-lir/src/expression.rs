//! Expressions and values of the linear IR.

use std::fmt;

use crate::loops::LoopId;
use crate::types::Precision;

/// Stable identity of an expression, unaffected by reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Index of a value in the IR's value arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// What a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// The contents of a data pointer slot.
    Memory { port: usize },
    /// A general-purpose register (loop work counters).
    Gpr,
    /// A vector register.
    Vec,
}

impl ValueKind {
    pub fn port(self) -> Option<usize> {
        match self {
            ValueKind::Memory { port } => Some(port),
            _ => None,
        }
    }
}

/// A value is produced by exactly one expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub producer: ExprId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Relu,
    Neg,
    Abs,
    Sqrt,
    Exp,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Relu => "relu",
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }
}

/// How long a scratch buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferScope {
    /// One region per worker thread, reused by every unit that worker runs.
    PerThread,
}

/// Operation kind of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Subgraph input `index`; outputs the memory value of its port.
    Parameter { index: usize },
    /// Subgraph output `index`; consumes the memory value written for it.
    Result { index: usize },
    /// Scratch region; outputs the memory value of its port.
    Buffer { id: usize, scope: BufferScope },
    LoopBegin { loop_id: LoopId },
    LoopEnd { loop_id: LoopId },
    /// Reads `count` elements from a memory value into a vector register.
    Load { count: usize },
    /// Writes `count` lanes of a vector register; outputs the port's new memory value.
    Store { count: usize },
    /// A constant broadcast to every lane (raw 32-bit pattern).
    Scalar { bits: u32 },
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Matrix multiply of two memory operands into a buffer.
    Gemm { site: usize },
}

impl OpKind {
    pub fn is_loop_marker(&self) -> bool {
        matches!(self, OpKind::LoopBegin { .. } | OpKind::LoopEnd { .. })
    }

    /// Consumers that need their producer's enclosing loops to be finished.
    pub fn consumes_completed(&self) -> bool {
        matches!(self, OpKind::Result { .. } | OpKind::Gemm { .. })
    }

    /// Pure compute: removable when its outputs are unused.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            OpKind::Load { .. } | OpKind::Scalar { .. } | OpKind::Unary(_) | OpKind::Binary(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter { .. } => "Parameter",
            OpKind::Result { .. } => "Result",
            OpKind::Buffer { .. } => "Buffer",
            OpKind::LoopBegin { .. } => "LoopBegin",
            OpKind::LoopEnd { .. } => "LoopEnd",
            OpKind::Load { .. } => "Load",
            OpKind::Store { .. } => "Store",
            OpKind::Scalar { .. } => "Scalar",
            OpKind::Unary(op) => op.name(),
            OpKind::Binary(op) => op.name(),
            OpKind::Gemm { .. } => "Gemm",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Parameter { index } => write!(f, "Parameter[{}]", index),
            OpKind::Result { index } => write!(f, "Result[{}]", index),
            OpKind::Buffer { id, .. } => write!(f, "Buffer[{}]", id),
            OpKind::LoopBegin { loop_id } => write!(f, "LoopBegin {}", loop_id),
            OpKind::LoopEnd { loop_id } => write!(f, "LoopEnd {}", loop_id),
            OpKind::Load { count } => write!(f, "Load<{}>", count),
            OpKind::Store { count } => write!(f, "Store<{}>", count),
            OpKind::Scalar { bits } => write!(f, "Scalar 0x{:08x}", bits),
            OpKind::Unary(op) => write!(f, "{}", op.name()),
            OpKind::Binary(op) => write!(f, "{}", op.name()),
            OpKind::Gemm { site } => write!(f, "Gemm[{}]", site),
        }
    }
}

/// A node of the linear IR.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub id: ExprId,
    pub op: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    /// Enclosing loops, outermost first. Authoritative only before loop
    /// markers are inserted; afterwards nesting is positional.
    pub loop_ids: Vec<LoopId>,
    pub precision: Precision,
}

impl Expression {
    pub fn output(&self) -> Option<ValueId> {
        self.outputs.first().copied()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.outputs.is_empty() {
            let outs: Vec<String> = self.outputs.iter().map(|v| v.to_string()).collect();
            write!(f, "{} = ", outs.join(", "))?;
        }
        write!(f, "{}", self.op)?;
        if !self.inputs.is_empty() {
            let ins: Vec<String> = self.inputs.iter().map(|v| v.to_string()).collect();
            write!(f, " {}", ins.join(", "))?;
        }
        write!(f, " : {}", self.precision)
    }
}
