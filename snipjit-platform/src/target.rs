//! The (architecture, OS) pair a kernel is compiled for.
//!
//! Only the architecture changes code generation, through the GPR budget in
//! [`crate::TargetCapabilities::for_isa`]. The OS decides whether the fault
//! hook can be installed. Textual form is `<arch>-<os>`, e.g. `x86_64-linux`.

use std::fmt;
use std::str::FromStr;

use crate::detection::{detect_host_architecture_only, detect_host_os};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub architecture: TargetArchitecture,
    pub operating_system: TargetOperatingSystem,
}

impl Target {
    pub fn new(architecture: TargetArchitecture, operating_system: TargetOperatingSystem) -> Self {
        Self {
            architecture,
            operating_system,
        }
    }

    /// ```
    /// use snipjit_platform::Target;
    /// let host = Target::detect_host();
    /// assert_eq!(host.to_string().parse::<Target>(), Ok(host));
    /// ```
    pub fn detect_host() -> Self {
        Self::new(
            detect_host_architecture_only().parse().unwrap_or(TargetArchitecture::Unknown),
            detect_host_os().parse().unwrap_or(TargetOperatingSystem::Other),
        )
    }
}

impl FromStr for Target {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (arch, os) = s.split_once('-').ok_or("expected `<arch>-<os>`")?;
        Ok(Self::new(arch.parse()?, os.parse()?))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.architecture, self.operating_system)
    }
}

/// Architectures with a distinct general-purpose register budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArchitecture {
    X86_64,
    Aarch64,
    /// Anything else; budgeted like x86_64.
    Unknown,
}

impl TargetArchitecture {
    const NAMES: [(Self, &'static str); 3] = [
        (Self::X86_64, "x86_64"),
        (Self::Aarch64, "aarch64"),
        (Self::Unknown, "unknown"),
    ];

    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(arch, _)| *arch == self)
            .map_or("unknown", |(_, name)| name)
    }
}

impl FromStr for TargetArchitecture {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(arch, _)| *arch)
            .ok_or("unsupported architecture")
    }
}

impl fmt::Display for TargetArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOperatingSystem {
    /// Has the `SIGSEGV` fault hook.
    Linux,
    Other,
}

impl TargetOperatingSystem {
    pub fn supports_fault_hook(self) -> bool {
        self == Self::Linux
    }
}

impl FromStr for TargetOperatingSystem {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "other" => Ok(Self::Other),
            _ => Err("unsupported operating system"),
        }
    }
}

impl fmt::Display for TargetOperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Linux => "linux",
            Self::Other => "other",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_keeps_underscore_arch() {
        let target: Target = "x86_64-linux".parse().unwrap();
        assert_eq!(target, Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux));
        assert_eq!(target.to_string(), "x86_64-linux");
    }

    #[test]
    fn test_parse_target_rejects_garbage() {
        assert!("x86_64".parse::<Target>().is_err());
        assert!("sparc-linux".parse::<Target>().is_err());
        assert!("aarch64-plan9".parse::<Target>().is_err());
    }

    #[test]
    fn test_fault_hook_only_on_linux() {
        assert!(TargetOperatingSystem::Linux.supports_fault_hook());
        assert!(!TargetOperatingSystem::Other.supports_fault_hook());
    }
}
