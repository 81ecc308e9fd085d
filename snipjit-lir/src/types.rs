//! Element precisions.

use std::fmt;
use std::str::FromStr;

/// Element type of a tensor or of the lanes of a vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    F32,
    I32,
    Bf16,
}

impl Precision {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Precision::F32 | Precision::I32 => 4,
            Precision::Bf16 => 2,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Precision::F32 | Precision::Bf16)
    }
}

impl FromStr for Precision {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" => Ok(Self::F32),
            "i32" => Ok(Self::I32),
            "bf16" => Ok(Self::Bf16),
            _ => Err("Unknown precision"),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F32 => "f32",
            Self::I32 => "i32",
            Self::Bf16 => "bf16",
        };
        write!(f, "{}", s)
    }
}
