//! Linear-scan allocation over one register class.

use std::collections::HashMap;

use snipjit_lir::{PhysicalReg, ValueId};

use super::liveness::LiveInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanLocation {
    Reg(PhysicalReg),
    Spill(usize),
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub locations: HashMap<ValueId, ScanLocation>,
    /// Spilled values, in the order they were spilled.
    pub spilled: Vec<ValueId>,
}

/// Poletto-Sarkar linear scan. Intervals must be sorted by start.
///
/// When the pool runs dry and spilling is allowed, the interval ending last
/// is spilled: either an active one (whose register is handed over) or the
/// incoming one. Without spilling the first value that does not fit is
/// returned as the error.
pub fn linear_scan(
    intervals: &[&LiveInterval],
    pool: &[PhysicalReg],
    allow_spill: bool,
) -> Result<ScanResult, ValueId> {
    let mut result = ScanResult::default();
    let mut free: Vec<PhysicalReg> = pool.iter().rev().copied().collect();
    let mut active: Vec<(usize, ValueId, PhysicalReg)> = Vec::new();

    for interval in intervals {
        active.retain(|&(end, _, reg)| {
            if end <= interval.start {
                free.push(reg);
                false
            } else {
                true
            }
        });
        // Hand out the lowest free register first.
        free.sort_unstable_by(|a, b| b.cmp(a));

        if let Some(reg) = free.pop() {
            result.locations.insert(interval.value, ScanLocation::Reg(reg));
            active.push((interval.end, interval.value, reg));
            continue;
        }
        if !allow_spill {
            return Err(interval.value);
        }

        let victim = active
            .iter()
            .enumerate()
            .max_by_key(|(_, (end, value, _))| (*end, *value))
            .map(|(i, entry)| (i, *entry));
        match victim {
            Some((index, (end, value, reg))) if end > interval.end => {
                active.remove(index);
                let slot = result.spilled.len();
                result.locations.insert(value, ScanLocation::Spill(slot));
                result.spilled.push(value);
                result.locations.insert(interval.value, ScanLocation::Reg(reg));
                active.push((interval.end, interval.value, reg));
            }
            _ => {
                let slot = result.spilled.len();
                result.locations.insert(interval.value, ScanLocation::Spill(slot));
                result.spilled.push(interval.value);
            }
        }
    }
    Ok(result)
}
