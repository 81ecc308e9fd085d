//! Register allocation over the GPR and vector classes.
//!
//! The GPR file is partitioned up front: the target's reserved registers are
//! never handed out, then come the kernel's argument registers, one pinned
//! data pointer per port, and what is left forms the pool loop counters are
//! scanned into. Vector values get the whole vector file; under pressure
//! they spill to slots and three vector registers are held back as scratch
//! for reloads.

mod linear_scan;
mod liveness;

use std::collections::HashMap;
use std::fmt;

use snipjit_lir::{LinearIr, PhysicalReg, RegisterClass, ValueId, ValueKind};
use snipjit_platform::TargetCapabilities;
use tracing::{debug, warn};

pub use linear_scan::{linear_scan, ScanLocation, ScanResult};
pub use liveness::{compute_intervals, LiveInterval};

use crate::emitter::KernelKind;
use crate::error::RegAllocError;

/// Vector registers set aside for reloading spilled operands.
pub const SPILL_SCRATCH_REGS: usize = 3;

/// Largest GPR file the kernel machine provides.
pub const MAX_GPRS: usize = 32;

/// Where a value lives while the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Gpr(PhysicalReg),
    Vec(PhysicalReg),
    Spill(usize),
    Memory { port: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Gpr(r) | Location::Vec(r) => write!(f, "{}", r),
            Location::Spill(slot) => write!(f, "[spill {}]", slot),
            Location::Memory { port } => write!(f, "port{}", port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterAssignment {
    locations: HashMap<ValueId, Location>,
    /// Registers receiving the call arguments, in argument order.
    pub arg_regs: Vec<PhysicalReg>,
    /// Pinned data pointers, indexed by port.
    pub data_ptr_regs: Vec<PhysicalReg>,
    /// Registers left to loop counters.
    pub aux_pool: Vec<PhysicalReg>,
    /// Reload scratch; empty when nothing spilled.
    pub scratch_vec_regs: Vec<PhysicalReg>,
    pub spill_slots: usize,
}

impl RegisterAssignment {
    pub fn location(&self, value: ValueId) -> Option<Location> {
        self.locations.get(&value).copied()
    }

    pub fn data_ptr(&self, port: usize) -> Option<PhysicalReg> {
        self.data_ptr_regs.get(port).copied()
    }

    pub fn spilled(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.locations
            .iter()
            .filter(|(_, loc)| matches!(loc, Location::Spill(_)))
            .map(|(v, _)| *v)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

fn vec_location(loc: ScanLocation) -> Location {
    match loc {
        ScanLocation::Reg(r) => Location::Vec(r),
        ScanLocation::Spill(slot) => Location::Spill(slot),
    }
}

/// Assign a location to every value of `lir`.
pub fn allocate(
    lir: &LinearIr,
    caps: &TargetCapabilities,
    kind: KernelKind,
) -> Result<RegisterAssignment, RegAllocError> {
    let ports = lir.ports().len();
    let args = kind.arg_count();
    let first = caps.reserved_gprs;
    let available = caps.available_gprs().min(MAX_GPRS.saturating_sub(first));
    if args + ports > available {
        return Err(RegAllocError::TooManyDataPointers {
            ports,
            args,
            available,
        });
    }

    let gpr = |offset: usize| PhysicalReg::gpr((first + offset) as u8);
    let arg_regs: Vec<PhysicalReg> = (0..args).map(gpr).collect();
    let data_ptr_regs: Vec<PhysicalReg> = (args..args + ports).map(gpr).collect();
    let aux_pool: Vec<PhysicalReg> = (args + ports..available).map(gpr).collect();

    let intervals = compute_intervals(lir);
    let mut locations = HashMap::new();

    let gpr_intervals: Vec<&LiveInterval> = intervals
        .iter()
        .filter(|iv| iv.class == RegisterClass::Gpr)
        .collect();
    let counters = linear_scan(&gpr_intervals, &aux_pool, false).map_err(|value| {
        RegAllocError::BudgetExceeded {
            value,
            class: RegisterClass::Gpr,
            available: aux_pool.len(),
        }
    })?;
    for (value, loc) in counters.locations {
        if let ScanLocation::Reg(r) = loc {
            locations.insert(value, Location::Gpr(r));
        }
    }

    let vec_intervals: Vec<&LiveInterval> = intervals
        .iter()
        .filter(|iv| iv.class == RegisterClass::Vec)
        .collect();
    let vec_file = caps.num_vec_regs.min(snipjit_platform::MAX_VEC_REGS);
    let full: Vec<PhysicalReg> = (0..vec_file).map(|i| PhysicalReg::vec(i as u8)).collect();
    let mut scan = linear_scan(&vec_intervals, &full, false);
    let mut scratch_vec_regs = Vec::new();
    if scan.is_err() {
        let Some(pool_size) = vec_file.checked_sub(SPILL_SCRATCH_REGS).filter(|n| *n > 0) else {
            let value = scan.err().unwrap_or(ValueId(0));
            return Err(RegAllocError::BudgetExceeded {
                value,
                class: RegisterClass::Vec,
                available: vec_file,
            });
        };
        scratch_vec_regs = full[pool_size..].to_vec();
        scan = linear_scan(&vec_intervals, &full[..pool_size], true);
    }
    let vectors = scan.map_err(|value| RegAllocError::BudgetExceeded {
        value,
        class: RegisterClass::Vec,
        available: vec_file,
    })?;
    let spill_slots = vectors.spilled.len();
    if spill_slots > 0 {
        warn!(
            spilled = spill_slots,
            vec_regs = vec_file,
            "vector pressure exceeds register file, spilling"
        );
    }
    for (value, loc) in vectors.locations {
        locations.insert(value, vec_location(loc));
    }

    for value in lir.values() {
        if let ValueKind::Memory { port } = value.kind {
            locations.insert(value.id, Location::Memory { port });
        }
    }

    debug!(
        ports,
        counters = gpr_intervals.len(),
        vectors = vec_intervals.len(),
        spill_slots,
        "register allocation done"
    );

    Ok(RegisterAssignment {
        locations,
        arg_regs,
        data_ptr_regs,
        aux_pool,
        scratch_vec_regs,
        spill_slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_util::{emit, param};
    use crate::passes::{InsertLoops, Pass, PassContext};
    use snipjit_lir::{BinaryOp, LoopKind, OpKind, PortKind, Precision};
    use snipjit_platform::{IsaTier, Target, TargetArchitecture, TargetOperatingSystem};

    fn avx2() -> TargetCapabilities {
        let target = Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux);
        TargetCapabilities::for_isa(target, IsaTier::Avx2)
    }

    /// Loads `n` values inside one loop and sums them afterwards, so all
    /// `n` loads are live at once.
    fn wide(n: usize) -> LinearIr {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        lir.add_port(PortKind::Output, Precision::F32);
        let l = lir.add_loop(0, 4, LoopKind::Vector);
        let loads: Vec<ValueId> = (0..n)
            .filter_map(|_| emit(&mut lir, OpKind::Load { count: 4 }, vec![a], &[ValueKind::Vec], &[l]))
            .collect();
        let mut acc = loads[0];
        for &v in &loads[1..] {
            acc = emit(&mut lir, OpKind::Binary(BinaryOp::Add), vec![acc, v], &[ValueKind::Vec], &[l]).unwrap();
        }
        InsertLoops.run(&mut lir, &PassContext::new(4)).unwrap();
        lir
    }

    #[test]
    fn test_partition_of_gpr_file() {
        let lir = wide(2);
        let caps = avx2();
        let ra = allocate(&lir, &caps, KernelKind::Static).unwrap();
        let first = caps.reserved_gprs as u8;
        assert_eq!(ra.arg_regs, vec![PhysicalReg::gpr(first), PhysicalReg::gpr(first + 1)]);
        assert_eq!(ra.data_ptr(0), Some(PhysicalReg::gpr(first + 2)));
        assert_eq!(ra.data_ptr(1), Some(PhysicalReg::gpr(first + 3)));
        assert!(!ra.aux_pool.contains(&PhysicalReg::gpr(first + 3)));
        assert_eq!(ra.spill_slots, 0);
        assert!(ra.scratch_vec_regs.is_empty());
    }

    #[test]
    fn test_dynamic_kernel_takes_one_argument() {
        let lir = wide(2);
        let caps = avx2();
        let ra = allocate(&lir, &caps, KernelKind::Dynamic).unwrap();
        assert_eq!(ra.arg_regs.len(), 1);
        assert_eq!(ra.data_ptr(0), Some(PhysicalReg::gpr(caps.reserved_gprs as u8 + 1)));
    }

    #[test]
    fn test_spills_reserve_scratch() {
        let lir = wide(8);
        let caps = avx2().with_register_budget(16, 6);
        let ra = allocate(&lir, &caps, KernelKind::Dynamic).unwrap();
        assert!(ra.spill_slots > 0);
        assert_eq!(ra.scratch_vec_regs.len(), SPILL_SCRATCH_REGS);
        for loc in lir.values().iter().filter_map(|v| ra.location(v.id)) {
            if let Location::Vec(r) = loc {
                assert!(!ra.scratch_vec_regs.contains(&r));
            }
        }
    }

    #[test]
    fn test_tiny_vector_file_fails() {
        let lir = wide(4);
        let caps = avx2().with_register_budget(16, 2);
        let err = allocate(&lir, &caps, KernelKind::Dynamic).unwrap_err();
        assert!(matches!(
            err,
            RegAllocError::BudgetExceeded {
                class: RegisterClass::Vec,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_too_many_ports() {
        let lir = wide(2);
        let caps = avx2().with_register_budget(5, 16);
        let err = allocate(&lir, &caps, KernelKind::Static).unwrap_err();
        assert!(matches!(err, RegAllocError::TooManyDataPointers { ports: 2, args: 2, .. }));
    }
}
