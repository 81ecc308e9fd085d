//! Environment overrides, read once per process.

use std::env;
use std::sync::OnceLock;

use crate::config::RepackingPolicy;

static SNIPJIT_THREADS: OnceLock<Option<usize>> = OnceLock::new();
static SNIPJIT_REPACKING: OnceLock<Option<RepackingPolicy>> = OnceLock::new();
static SNIPJIT_SEGFAULT_DETECTOR: OnceLock<bool> = OnceLock::new();
static SNIPJIT_DUMP_LIS: OnceLock<bool> = OnceLock::new();
static SNIPJIT_SPECIALIZATION_CACHE: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_positive(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

fn read_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

/// `SNIPJIT_THREADS`: worker count for executor contexts built from the environment.
pub fn thread_count() -> Option<usize> {
    *SNIPJIT_THREADS.get_or_init(|| env::var("SNIPJIT_THREADS").ok().and_then(|v| parse_positive(&v)))
}

/// `SNIPJIT_REPACKING`: `auto`, `none`, `separate` or `in_parallel`.
pub fn repacking_policy() -> Option<RepackingPolicy> {
    *SNIPJIT_REPACKING.get_or_init(|| {
        env::var("SNIPJIT_REPACKING")
            .ok()
            .and_then(|v| v.trim().parse::<RepackingPolicy>().ok())
    })
}

/// `SNIPJIT_SEGFAULT_DETECTOR`: arm the fault hook (debug builds on Linux only).
pub fn segfault_detector_enabled() -> bool {
    *SNIPJIT_SEGFAULT_DETECTOR.get_or_init(|| read_flag("SNIPJIT_SEGFAULT_DETECTOR"))
}

/// `SNIPJIT_DUMP_LIS`: log the sequence after the pass pipeline.
pub fn dump_lis() -> bool {
    *SNIPJIT_DUMP_LIS.get_or_init(|| read_flag("SNIPJIT_DUMP_LIS"))
}

/// `SNIPJIT_SPECIALIZATION_CACHE`: per-executor count of remembered dynamic shapes.
pub fn specialization_cache_capacity() -> Option<usize> {
    *SNIPJIT_SPECIALIZATION_CACHE.get_or_init(|| {
        env::var("SNIPJIT_SPECIALIZATION_CACHE")
            .ok()
            .and_then(|v| parse_positive(&v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool(" On "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("maybe"));
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        assert_eq!(parse_positive("4"), Some(4));
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("-2"), None);
    }
}
