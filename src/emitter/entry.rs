//! Op dispatch table.

use std::collections::HashMap;

use snipjit_lir::{BinaryOp, Expression, LinearIr, OpKind, Precision, UnaryOp};

use super::ops::{self, EmitContext};
use crate::error::EmitError;

/// Table key: an operation kind with its payload stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKey {
    Parameter,
    Result,
    Buffer,
    LoopBegin,
    LoopEnd,
    Load,
    Store,
    Scalar,
    Unary(UnaryOp),
    Binary(BinaryOp),
    Gemm,
}

impl From<&OpKind> for OpKey {
    fn from(op: &OpKind) -> Self {
        match op {
            OpKind::Parameter { .. } => OpKey::Parameter,
            OpKind::Result { .. } => OpKey::Result,
            OpKind::Buffer { .. } => OpKey::Buffer,
            OpKind::LoopBegin { .. } => OpKey::LoopBegin,
            OpKind::LoopEnd { .. } => OpKey::LoopEnd,
            OpKind::Load { .. } => OpKey::Load,
            OpKind::Store { .. } => OpKey::Store,
            OpKind::Scalar { .. } => OpKey::Scalar,
            OpKind::Unary(op) => OpKey::Unary(*op),
            OpKind::Binary(op) => OpKey::Binary(*op),
            OpKind::Gemm { .. } => OpKey::Gemm,
        }
    }
}

pub type EmitFn = fn(&mut EmitContext<'_>, &Expression) -> Result<(), EmitError>;

#[derive(Clone, Copy)]
pub struct EmitterEntry {
    pub name: &'static str,
    pub precisions: &'static [Precision],
    pub emit: EmitFn,
}

impl EmitterEntry {
    pub fn supports(&self, precision: Precision) -> bool {
        self.precisions.contains(&precision)
    }
}

impl std::fmt::Debug for EmitterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitterEntry")
            .field("name", &self.name)
            .field("precisions", &self.precisions)
            .finish()
    }
}

const ANY: &[Precision] = &[Precision::F32, Precision::I32, Precision::Bf16];
const NUMERIC: &[Precision] = &[Precision::F32, Precision::I32];
const FLOAT: &[Precision] = &[Precision::F32];

#[derive(Debug, Clone)]
pub struct EmitterTable {
    entries: HashMap<OpKey, EmitterEntry>,
}

impl EmitterTable {
    /// The table of every operation the kernel machine implements.
    pub fn standard() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
        };
        table.register(OpKey::Parameter, "parameter", ANY, ops::emit_nop);
        table.register(OpKey::Result, "result", ANY, ops::emit_nop);
        table.register(OpKey::Buffer, "buffer", ANY, ops::emit_nop);
        table.register(OpKey::LoopBegin, "loop_begin", ANY, ops::emit_loop_begin);
        table.register(OpKey::LoopEnd, "loop_end", ANY, ops::emit_loop_end);
        table.register(OpKey::Load, "load", NUMERIC, ops::emit_load);
        table.register(OpKey::Store, "store", NUMERIC, ops::emit_store);
        table.register(OpKey::Scalar, "scalar", NUMERIC, ops::emit_scalar);
        for op in [UnaryOp::Relu, UnaryOp::Neg, UnaryOp::Abs] {
            table.register(OpKey::Unary(op), op.name(), NUMERIC, ops::emit_unary);
        }
        for op in [UnaryOp::Sqrt, UnaryOp::Exp] {
            table.register(OpKey::Unary(op), op.name(), FLOAT, ops::emit_unary);
        }
        for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Max, BinaryOp::Min] {
            table.register(OpKey::Binary(op), op.name(), NUMERIC, ops::emit_binary);
        }
        table.register(OpKey::Binary(BinaryOp::Div), "div", FLOAT, ops::emit_binary);
        table.register(OpKey::Gemm, "gemm", FLOAT, ops::emit_gemm);
        table
    }

    pub fn register(&mut self, key: OpKey, name: &'static str, precisions: &'static [Precision], emit: EmitFn) {
        self.entries.insert(key, EmitterEntry { name, precisions, emit });
    }

    pub fn lookup(&self, op: &OpKind) -> Option<&EmitterEntry> {
        self.entries.get(&OpKey::from(op))
    }

    /// Entry for `expr`, or `Unsupported` when the operation is missing or
    /// does not take the expression's precision.
    pub fn entry_for(&self, expr: &Expression) -> Result<&EmitterEntry, EmitError> {
        self.lookup(&expr.op)
            .filter(|entry| entry.supports(expr.precision))
            .ok_or_else(|| EmitError::Unsupported {
                op: expr.op.name().to_string(),
                precision: expr.precision,
            })
    }

    /// Check every expression of `lir` before anything is emitted.
    pub fn check_support(&self, lir: &LinearIr) -> Result<(), EmitError> {
        for expr in lir.iter() {
            self.entry_for(expr)?;
        }
        Ok(())
    }
}

impl Default for EmitterTable {
    fn default() -> Self {
        Self::standard()
    }
}
