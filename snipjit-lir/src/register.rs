//! Physical register model of the kernel machine.
//!
//! ## Register Classes
//!
//! - **GPR**: general-purpose registers for pointers and loop counters
//! - **Vec**: vector registers for element data
//!
//! The allocator hands out [`PhysicalReg`]s by index inside a class; the
//! emitter never needs names beyond the index.
use std::fmt;

/// Register class determines which physical registers can be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    /// General Purpose Register (pointers, counters)
    Gpr,
    /// Vector Register (SIMD lanes)
    Vec,
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterClass::Gpr => write!(f, "gpr"),
            RegisterClass::Vec => write!(f, "vec"),
        }
    }
}

/// Physical register, identified by its index within its class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalReg {
    pub class: RegisterClass,
    pub index: u8,
}

impl PhysicalReg {
    pub const fn new(index: u8, class: RegisterClass) -> Self {
        Self { index, class }
    }

    pub const fn gpr(index: u8) -> Self {
        Self::new(index, RegisterClass::Gpr)
    }

    pub const fn vec(index: u8) -> Self {
        Self::new(index, RegisterClass::Vec)
    }
}

impl fmt::Display for PhysicalReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            RegisterClass::Gpr => write!(f, "r{}", self.index),
            RegisterClass::Vec => write!(f, "v{}", self.index),
        }
    }
}
