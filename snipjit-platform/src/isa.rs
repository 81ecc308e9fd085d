//! Vector instruction-set tiers and register budgets.
//!
//! A [`TargetCapabilities`] value is what the compiler consumes: how many
//! f32 lanes one vector register holds, and how many general-purpose and
//! vector registers the register allocator may hand out. Detection mirrors
//! the runtime CPU query; tests usually build a descriptor explicitly with
//! [`TargetCapabilities::for_isa`] so results do not depend on the host.

use std::fmt;
use std::str::FromStr;

use crate::target::{Target, TargetArchitecture};

/// Widest vector the kernel machine models, in 32-bit lanes.
pub const MAX_VECTOR_LANES: usize = 16;

/// Largest vector register file any supported tier exposes.
pub const MAX_VEC_REGS: usize = 32;

/// Vector instruction tier, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsaTier {
    /// No usable vector unit; one lane per register.
    Scalar,
    /// x86_64 SSE4.1, 128-bit registers.
    Sse41,
    /// x86_64 AVX2, 256-bit registers.
    Avx2,
    /// x86_64 AVX-512F, 512-bit registers.
    Avx512,
    /// AArch64 Advanced SIMD, 128-bit registers.
    Neon,
}

impl IsaTier {
    /// Number of f32 lanes per vector register.
    pub fn vector_lanes(self) -> usize {
        match self {
            IsaTier::Scalar => 1,
            IsaTier::Sse41 | IsaTier::Neon => 4,
            IsaTier::Avx2 => 8,
            IsaTier::Avx512 => 16,
        }
    }

    /// Size of the architectural vector register file.
    pub fn vec_regs(self) -> usize {
        match self {
            IsaTier::Scalar | IsaTier::Sse41 | IsaTier::Avx2 => 16,
            IsaTier::Avx512 | IsaTier::Neon => 32,
        }
    }

    /// Detect the best tier the running CPU supports.
    pub fn detect_runtime() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx512f") {
                return IsaTier::Avx512;
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                return IsaTier::Avx2;
            }
            if std::arch::is_x86_feature_detected!("sse4.1") {
                return IsaTier::Sse41;
            }
            IsaTier::Scalar
        }
        // Advanced SIMD is mandatory on AArch64.
        #[cfg(target_arch = "aarch64")]
        {
            IsaTier::Neon
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            IsaTier::Scalar
        }
    }
}

impl FromStr for IsaTier {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalar" => Ok(Self::Scalar),
            "sse41" | "sse4.1" => Ok(Self::Sse41),
            "avx2" => Ok(Self::Avx2),
            "avx512" | "avx512f" => Ok(Self::Avx512),
            "neon" => Ok(Self::Neon),
            _ => Err("Unknown ISA tier"),
        }
    }
}

impl fmt::Display for IsaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scalar => "scalar",
            Self::Sse41 => "sse41",
            Self::Avx2 => "avx2",
            Self::Avx512 => "avx512",
            Self::Neon => "neon",
        };
        write!(f, "{}", s)
    }
}

/// Everything the compiler needs to know about the machine it emits for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetCapabilities {
    pub target: Target,
    pub isa: IsaTier,
    /// f32 lanes per vector register.
    pub vector_lanes: usize,
    /// Architectural general-purpose registers.
    pub num_gprs: usize,
    /// GPRs never handed out (stack pointer, frame pointer, link register).
    pub reserved_gprs: usize,
    pub num_vec_regs: usize,
}

impl TargetCapabilities {
    /// Capabilities of the running host.
    pub fn detect_host() -> Self {
        Self::for_isa(Target::detect_host(), IsaTier::detect_runtime())
    }

    /// Canonical budgets for `isa` on `target`.
    pub fn for_isa(target: Target, isa: IsaTier) -> Self {
        let (num_gprs, reserved_gprs) = match target.architecture {
            TargetArchitecture::Aarch64 => (31, 3),
            TargetArchitecture::X86_64 | TargetArchitecture::Unknown => (16, 2),
        };
        Self {
            target,
            isa,
            vector_lanes: isa.vector_lanes(),
            num_gprs,
            reserved_gprs,
            num_vec_regs: isa.vec_regs(),
        }
    }

    /// Override the lane count, clamped to `1..=MAX_VECTOR_LANES`.
    pub fn with_vector_lanes(mut self, lanes: usize) -> Self {
        self.vector_lanes = lanes.clamp(1, MAX_VECTOR_LANES);
        self
    }

    /// Override the register budgets. Mostly useful to provoke spills in tests.
    pub fn with_register_budget(mut self, num_gprs: usize, num_vec_regs: usize) -> Self {
        self.num_gprs = num_gprs;
        self.num_vec_regs = num_vec_regs.min(MAX_VEC_REGS);
        self
    }

    /// GPRs left after the reserved ones.
    pub fn available_gprs(&self) -> usize {
        self.num_gprs.saturating_sub(self.reserved_gprs)
    }
}

impl fmt::Display for TargetCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} lanes, {} gprs, {} vec regs)",
            self.target, self.isa, self.vector_lanes, self.num_gprs, self.num_vec_regs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetOperatingSystem;

    fn x86() -> Target {
        Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux)
    }

    #[test]
    fn test_tier_ordering() {
        assert!(IsaTier::Scalar < IsaTier::Sse41);
        assert!(IsaTier::Avx2 < IsaTier::Avx512);
    }

    #[test]
    fn test_avx2_budget() {
        let caps = TargetCapabilities::for_isa(x86(), IsaTier::Avx2);
        assert_eq!(caps.vector_lanes, 8);
        assert_eq!(caps.num_vec_regs, 16);
        assert_eq!(caps.available_gprs(), 14);
    }

    #[test]
    fn test_lane_override_is_clamped() {
        let caps = TargetCapabilities::for_isa(x86(), IsaTier::Avx2).with_vector_lanes(64);
        assert_eq!(caps.vector_lanes, MAX_VECTOR_LANES);
        let caps = caps.with_vector_lanes(0);
        assert_eq!(caps.vector_lanes, 1);
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!("avx512f".parse::<IsaTier>(), Ok(IsaTier::Avx512));
        assert_eq!(IsaTier::Neon.to_string(), "neon");
        assert!("mmx".parse::<IsaTier>().is_err());
    }
}
