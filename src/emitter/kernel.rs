//! The emitted kernel: a linear program over a fixed register machine.

use std::fmt;

use snipjit_lir::{BinaryOp, PhysicalReg, Precision, UnaryOp};

/// Size of one spill slot: a full vector register.
pub const SPILL_SLOT_BYTES: usize = snipjit_platform::MAX_VECTOR_LANES * 4;

/// Entry-point flavour of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// Shape-specialized: loop trip counts, strides and data offsets are
    /// baked in; the caller passes the unit's domain index tuple.
    Static,
    /// Shape-agnostic: everything shape-dependent is read from the call
    /// arguments, the caller offsets the data pointers per unit.
    Dynamic,
}

impl KernelKind {
    /// Registers the entry point receives its arguments in.
    pub fn arg_count(self) -> usize {
        match self {
            KernelKind::Static => 2,
            KernelKind::Dynamic => 1,
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelKind::Static => write!(f, "static"),
            KernelKind::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Where a data pointer comes from in the call arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrSource {
    Input(usize),
    Output(usize),
    /// Offset into the per-thread scratch region.
    Buffer(usize),
}

/// Trip count of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    Static(usize),
    /// Read from the loop arguments slot.
    Runtime(usize),
}

/// Byte adjustments applied to a loop's pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtrStep {
    Static(Vec<i64>),
    /// Read from the loop arguments slot.
    Runtime(usize),
}

/// Element stride of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stride {
    Static(i64),
    /// Read from the per-port inner strides of the call.
    Runtime(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    LoadDataPtr {
        dst: PhysicalReg,
        source: PtrSource,
    },
    /// `ptr += sum(index[d] * offsets[d])`, static entry only.
    ApplyDataOffsets {
        ptr: PhysicalReg,
        offsets: Vec<i64>,
    },
    /// Set the counter to the trip count; jump to `exit` when below one step.
    LoopBegin {
        counter: PhysicalReg,
        work: Work,
        increment: usize,
        exit: usize,
    },
    /// Count down, advance `ptrs`, branch back to `body` while a full step
    /// remains.
    LoopEnd {
        counter: PhysicalReg,
        increment: usize,
        body: usize,
        ptrs: Vec<PhysicalReg>,
        step: PtrStep,
    },
    /// Rewind `ptrs` after the last loop of a dimension.
    LoopFinalize {
        ptrs: Vec<PhysicalReg>,
        offsets: PtrStep,
    },
    Load {
        dst: PhysicalReg,
        ptr: PhysicalReg,
        count: usize,
        stride: Stride,
    },
    Store {
        src: PhysicalReg,
        ptr: PhysicalReg,
        count: usize,
        stride: Stride,
    },
    Splat {
        dst: PhysicalReg,
        bits: u32,
    },
    Unary {
        op: UnaryOp,
        precision: Precision,
        dst: PhysicalReg,
        src: PhysicalReg,
    },
    Binary {
        op: BinaryOp,
        precision: Precision,
        dst: PhysicalReg,
        lhs: PhysicalReg,
        rhs: PhysicalReg,
    },
    Spill {
        slot: usize,
        src: PhysicalReg,
    },
    Reload {
        dst: PhysicalReg,
        slot: usize,
    },
    /// Call the auxiliary matmul kernel bound to `site`.
    Gemm {
        site: usize,
        a: PhysicalReg,
        b: PhysicalReg,
        c: PhysicalReg,
    },
    Ret,
}

fn write_regs(f: &mut fmt::Formatter<'_>, regs: &[PhysicalReg]) -> fmt::Result {
    write!(f, "[")?;
    for (i, r) in regs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", r)?;
    }
    write!(f, "]")
}

impl fmt::Display for PtrSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtrSource::Input(i) => write!(f, "src{}", i),
            PtrSource::Output(i) => write!(f, "dst{}", i),
            PtrSource::Buffer(i) => write!(f, "scratch+buf{}", i),
        }
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Static(n) => write!(f, "{}", n),
            Work::Runtime(slot) => write!(f, "loop_args[{}].work", slot),
        }
    }
}

impl fmt::Display for PtrStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtrStep::Static(steps) => write!(f, "{:?}", steps),
            PtrStep::Runtime(slot) => write!(f, "loop_args[{}]", slot),
        }
    }
}

impl fmt::Display for Stride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stride::Static(s) => write!(f, "{}", s),
            Stride::Runtime(port) => write!(f, "strides[{}]", port),
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::LoadDataPtr { dst, source } => write!(f, "ldptr {}, {}", dst, source),
            Inst::ApplyDataOffsets { ptr, offsets } => write!(f, "offset {}, idx . {:?}", ptr, offsets),
            Inst::LoopBegin {
                counter,
                work,
                increment,
                exit,
            } => write!(f, "loop {}, {}, step {} (exit @{})", counter, work, increment, exit),
            Inst::LoopEnd {
                counter,
                increment,
                body,
                ptrs,
                step,
            } => {
                write!(f, "endloop {}, step {}, @{} ", counter, increment, body)?;
                write_regs(f, ptrs)?;
                write!(f, " += {}", step)
            }
            Inst::LoopFinalize { ptrs, offsets } => {
                write!(f, "finalize ")?;
                write_regs(f, ptrs)?;
                match offsets {
                    PtrStep::Runtime(slot) => write!(f, " += loop_args[{}].final", slot),
                    other => write!(f, " += {}", other),
                }
            }
            Inst::Load {
                dst,
                ptr,
                count,
                stride,
            } => write!(f, "load<{}> {}, [{}], stride {}", count, dst, ptr, stride),
            Inst::Store {
                src,
                ptr,
                count,
                stride,
            } => write!(f, "store<{}> [{}], {}, stride {}", count, ptr, src, stride),
            Inst::Splat { dst, bits } => write!(f, "splat {}, 0x{:08x}", dst, bits),
            Inst::Unary {
                op,
                precision,
                dst,
                src,
            } => write!(f, "{}.{} {}, {}", op.name(), precision, dst, src),
            Inst::Binary {
                op,
                precision,
                dst,
                lhs,
                rhs,
            } => write!(f, "{}.{} {}, {}, {}", op.name(), precision, dst, lhs, rhs),
            Inst::Spill { slot, src } => write!(f, "spill [{}], {}", slot, src),
            Inst::Reload { dst, slot } => write!(f, "reload {}, [{}]", dst, slot),
            Inst::Gemm { site, a, b, c } => write!(f, "gemm#{} {}, {}, {}", site, c, a, b),
            Inst::Ret => write!(f, "ret"),
        }
    }
}

/// A compiled kernel.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub kind: KernelKind,
    pub lanes: usize,
    pub code: Vec<Inst>,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_buffers: usize,
    /// Spill slots occupy the head of the per-thread scratch region,
    /// [`SPILL_SLOT_BYTES`] each.
    pub spill_slots: usize,
}

impl Kernel {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn num_ports(&self) -> usize {
        self.num_inputs + self.num_outputs + self.num_buffers
    }

    /// Bytes of per-thread scratch the spill area takes.
    pub fn spill_bytes(&self) -> usize {
        self.spill_slots * SPILL_SLOT_BYTES
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "kernel {} ({}, {} lanes, {} ports, {} spill slots)",
            self.name,
            self.kind,
            self.lanes,
            self.num_ports(),
            self.spill_slots
        )?;
        for (pc, inst) in self.code.iter().enumerate() {
            writeln!(f, "{:4}: {}", pc, inst)?;
        }
        Ok(())
    }
}
