//! snipjit-platform - Target and ISA capability detection
//!
//! This crate describes the machine a kernel is generated for: architecture
//! and operating system, the vector instruction tier, and the register
//! budgets the register allocator and emitter must respect. It is separated
//! from the main crate so tests and tools can build capability descriptors
//! without pulling in the compiler.
//!
//! ## Modules
//!
//! - [`target`] - Target architecture and operating system definitions
//! - [`detection`] - Host system detection functions
//! - [`isa`] - Vector ISA tiers and per-target register budgets

pub mod detection;
pub mod isa;
pub mod target;

pub use detection::{cpu_count, detect_host_architecture_only, detect_host_os};
pub use isa::{IsaTier, TargetCapabilities, MAX_VECTOR_LANES, MAX_VEC_REGS};
pub use target::{Target, TargetArchitecture, TargetOperatingSystem};

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_from_str_roundtrip() {
        let host = Target::detect_host();
        let parsed_back = Target::from_str(&host.to_string()).expect("valid target should parse");
        assert_eq!(host, parsed_back);
    }

    #[test]
    fn test_detect_functions_consistency() {
        let combined = Target::detect_host();
        assert_eq!(
            combined.architecture,
            TargetArchitecture::from_str(detect_host_architecture_only())
                .unwrap_or(TargetArchitecture::Unknown)
        );
        assert_eq!(
            combined.operating_system,
            TargetOperatingSystem::from_str(detect_host_os())
                .unwrap_or(TargetOperatingSystem::Other)
        );
    }

    #[test]
    fn test_host_capabilities_are_bounded() {
        let caps = TargetCapabilities::detect_host();
        assert!(caps.vector_lanes >= 1 && caps.vector_lanes <= MAX_VECTOR_LANES);
        assert!(caps.num_vec_regs <= MAX_VEC_REGS);
        assert!(caps.available_gprs() > 0);
    }
}
