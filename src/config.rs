//! Compilation options.

use std::fmt;
use std::str::FromStr;

use snipjit_platform::cpu_count;

use crate::env;

/// Whether a fully static subgraph gets a shape-specialized kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecializationPolicy {
    /// Static kernel when every input dimension is known, dynamic otherwise.
    #[default]
    Auto,
    /// Always emit a kernel that accepts shapes per call.
    ForceDynamic,
}

/// How inputs stored in a non-planar layout are handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepackingPolicy {
    /// Pick per shape configuration (see `RuntimeConfigurator`).
    #[default]
    Auto,
    /// Never repack; the kernel reads operands with their own strides.
    Disabled,
    /// Repack every flagged operand fully before dispatch.
    Separate,
    /// Each worker repacks the slice it is about to consume.
    InParallel,
}

impl FromStr for RepackingPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "none" | "disabled" => Ok(Self::Disabled),
            "separate" => Ok(Self::Separate),
            "in_parallel" | "inparallel" => Ok(Self::InParallel),
            _ => Err("Unknown repacking policy"),
        }
    }
}

impl fmt::Display for RepackingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Disabled => "none",
            Self::Separate => "separate",
            Self::InParallel => "in_parallel",
        };
        write!(f, "{}", s)
    }
}

/// Options for [`compile`](crate::compile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Kernel name, used in logs and fault reports.
    pub name: String,
    pub specialization: SpecializationPolicy,
    pub repacking: RepackingPolicy,
    /// Lane count override; defaults to the target's vector width.
    pub vector_lanes: Option<usize>,
    /// Thread count the static configuration is tuned for.
    pub threads_hint: Option<usize>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            name: "subgraph".to_string(),
            specialization: SpecializationPolicy::Auto,
            repacking: env::repacking_policy().unwrap_or_default(),
            vector_lanes: None,
            threads_hint: env::thread_count(),
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.specialization = SpecializationPolicy::ForceDynamic;
        self
    }

    pub fn with_repacking(mut self, policy: RepackingPolicy) -> Self {
        self.repacking = policy;
        self
    }

    pub fn with_vector_lanes(mut self, lanes: usize) -> Self {
        self.vector_lanes = Some(lanes);
        self
    }

    pub fn with_threads_hint(mut self, threads: usize) -> Self {
        self.threads_hint = Some(threads.max(1));
        self
    }

    pub fn effective_threads(&self) -> usize {
        self.threads_hint.unwrap_or_else(cpu_count).max(1)
    }
}
