//! Loop descriptors.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

impl LoopId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    /// Walks a dimension one row at a time.
    Outer,
    /// Innermost loop stepping by the vector width.
    Vector,
    /// Scalar remainder of a vector loop.
    Tail,
}

/// Static description of one loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    pub id: LoopId,
    /// Dimension walked, counted from the innermost (0 = last dim).
    pub dim: usize,
    /// Elements consumed per iteration.
    pub increment: usize,
    pub kind: LoopKind,
    /// Known work amount in elements, `None` for dynamic shapes.
    pub work_amount: Option<usize>,
    /// Whether this loop is the last one walking `dim` inside its parent,
    /// and so owns the finalization that rewinds the dimension.
    pub is_last_in_dim: bool,
}

impl LoopInfo {
    pub fn new(id: LoopId, dim: usize, increment: usize, kind: LoopKind) -> Self {
        Self {
            id,
            dim,
            increment,
            kind,
            work_amount: None,
            is_last_in_dim: true,
        }
    }
}

/// Runtime arguments of one loop: what a dynamic kernel reads per call and
/// what a static kernel bakes in. Offsets are in bytes and indexed like the
/// loop's port list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoopArgs {
    pub work_amount: usize,
    pub ptr_increments: Vec<i64>,
    pub finalization_offsets: Vec<i64>,
}
