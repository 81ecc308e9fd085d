//! Host system detection functions.

/// Architecture this crate was compiled for, in [`crate::TargetArchitecture`]
/// spelling. Unsupported architectures report `"unknown"`.
pub fn detect_host_architecture_only() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "unknown"
    }
}

/// `"linux"` or `"other"`.
pub fn detect_host_os() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else {
        "other"
    }
}

/// Number of hardware threads available to this process.
///
/// Used as the default worker count when no explicit thread count is
/// configured. Never returns zero.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
