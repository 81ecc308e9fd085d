//! Register machine the kernels run on.
//!
//! The machine mirrors the shape of a native kernel: a GPR file holding the
//! loop counters and pinned data pointers, a vector file of
//! `MAX_VECTOR_LANES` 32-bit lanes, and spill slots at the head of the
//! per-thread scratch region. Running a kernel allocates nothing.

use std::ptr;

use snipjit_lir::{BinaryOp, LoopArgs, PhysicalReg, Precision, UnaryOp};
use snipjit_platform::{MAX_VECTOR_LANES, MAX_VEC_REGS};

use super::kernel::{Inst, Kernel, PtrSource, PtrStep, Stride, Work, SPILL_SLOT_BYTES};
use crate::error::RuntimeError;
use crate::regalloc::MAX_GPRS;
use crate::runtime::KernelExecutorTable;

const ELEM_BYTES: isize = 4;

/// Per-call arguments of a kernel.
pub struct CallArgs<'a> {
    pub src_ptrs: &'a [*const u8],
    pub dst_ptrs: &'a [*mut u8],
    /// Per-thread region: spill slots, then buffers.
    pub scratch: *mut u8,
    /// Buffer offsets within `scratch`.
    pub buffer_offsets: &'a [usize],
    /// Read by dynamic kernels only.
    pub loop_args: &'a [LoopArgs],
    /// Per-port inner strides in elements, read by dynamic kernels only.
    pub inner_strides: &'a [i64],
    pub executors: &'a KernelExecutorTable,
}

struct Machine {
    gpr: [usize; MAX_GPRS],
    vec: [[u32; MAX_VECTOR_LANES]; MAX_VEC_REGS],
}

impl Machine {
    fn new() -> Self {
        Self {
            gpr: [0; MAX_GPRS],
            vec: [[0; MAX_VECTOR_LANES]; MAX_VEC_REGS],
        }
    }

    fn gpr(&mut self, reg: PhysicalReg) -> &mut usize {
        &mut self.gpr[reg.index as usize]
    }

    fn vec(&self, reg: PhysicalReg) -> &[u32; MAX_VECTOR_LANES] {
        &self.vec[reg.index as usize]
    }

    fn vec_mut(&mut self, reg: PhysicalReg) -> &mut [u32; MAX_VECTOR_LANES] {
        &mut self.vec[reg.index as usize]
    }

    fn advance(&mut self, ptrs: &[PhysicalReg], steps: &[i64]) {
        for (ptr, step) in ptrs.iter().zip(steps) {
            let value = self.gpr(*ptr);
            *value = value.wrapping_add_signed(*step as isize);
        }
    }
}

fn loop_args<'a>(args: &'a CallArgs<'_>, slot: usize) -> Result<&'a LoopArgs, RuntimeError> {
    args.loop_args.get(slot).ok_or(RuntimeError::MissingArgument {
        what: "loop arguments slot",
        index: slot,
    })
}

fn stride_of(args: &CallArgs<'_>, stride: Stride) -> Result<isize, RuntimeError> {
    match stride {
        Stride::Static(s) => Ok(s as isize),
        Stride::Runtime(port) => args
            .inner_strides
            .get(port)
            .map(|s| *s as isize)
            .ok_or(RuntimeError::MissingArgument {
                what: "stride for port",
                index: port,
            }),
    }
}

fn unary(op: UnaryOp, precision: Precision, x: u32) -> u32 {
    match precision {
        Precision::I32 => {
            let x = x as i32;
            let r = match op {
                UnaryOp::Relu => x.max(0),
                UnaryOp::Neg => x.wrapping_neg(),
                UnaryOp::Abs => x.wrapping_abs(),
                UnaryOp::Sqrt => (x as f32).sqrt() as i32,
                UnaryOp::Exp => (x as f32).exp() as i32,
            };
            r as u32
        }
        _ => {
            let x = f32::from_bits(x);
            let r = match op {
                UnaryOp::Relu => x.max(0.0),
                UnaryOp::Neg => -x,
                UnaryOp::Abs => x.abs(),
                UnaryOp::Sqrt => x.sqrt(),
                UnaryOp::Exp => x.exp(),
            };
            r.to_bits()
        }
    }
}

fn binary(op: BinaryOp, precision: Precision, a: u32, b: u32) -> u32 {
    match precision {
        Precision::I32 => {
            let (a, b) = (a as i32, b as i32);
            let r = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a.checked_div(b).unwrap_or(0),
                BinaryOp::Max => a.max(b),
                BinaryOp::Min => a.min(b),
            };
            r as u32
        }
        _ => {
            let (a, b) = (f32::from_bits(a), f32::from_bits(b));
            let r = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Max => a.max(b),
                BinaryOp::Min => a.min(b),
            };
            r.to_bits()
        }
    }
}

impl Kernel {
    /// Run the kernel once.
    ///
    /// `indexes` is the parallel-domain index tuple of the unit; dynamic
    /// kernels ignore it since their pointers arrive already offset.
    ///
    /// # Safety
    ///
    /// Every pointer in `args` must be valid for all reads and writes the
    /// kernel performs under the configuration `args` was derived from, and
    /// `scratch` must not be shared with another running call.
    pub unsafe fn call(&self, args: &CallArgs<'_>, indexes: &[usize]) -> Result<(), RuntimeError> {
        let mut m = Machine::new();
        let lanes = self.lanes.min(MAX_VECTOR_LANES);
        let mut pc = 0;
        while let Some(inst) = self.code.get(pc) {
            pc += 1;
            match inst {
                Inst::LoadDataPtr { dst, source } => {
                    let address = match *source {
                        PtrSource::Input(i) => args.src_ptrs.get(i).map(|p| *p as usize).ok_or(
                            RuntimeError::MissingArgument {
                                what: "source pointer",
                                index: i,
                            },
                        )?,
                        PtrSource::Output(i) => args.dst_ptrs.get(i).map(|p| *p as usize).ok_or(
                            RuntimeError::MissingArgument {
                                what: "destination pointer",
                                index: i,
                            },
                        )?,
                        PtrSource::Buffer(i) => {
                            let offset = args.buffer_offsets.get(i).ok_or(RuntimeError::MissingArgument {
                                what: "buffer offset",
                                index: i,
                            })?;
                            args.scratch as usize + offset
                        }
                    };
                    *m.gpr(*dst) = address;
                }
                Inst::ApplyDataOffsets { ptr, offsets } => {
                    let delta: i64 = offsets
                        .iter()
                        .enumerate()
                        .map(|(d, off)| indexes.get(d).copied().unwrap_or(0) as i64 * off)
                        .sum();
                    let value = m.gpr(*ptr);
                    *value = value.wrapping_add_signed(delta as isize);
                }
                Inst::LoopBegin {
                    counter,
                    work,
                    increment,
                    exit,
                } => {
                    let work = match *work {
                        Work::Static(n) => n,
                        Work::Runtime(slot) => loop_args(args, slot)?.work_amount,
                    };
                    *m.gpr(*counter) = work;
                    if work < *increment {
                        pc = *exit;
                    }
                }
                Inst::LoopEnd {
                    counter,
                    increment,
                    body,
                    ptrs,
                    step,
                } => {
                    match step {
                        PtrStep::Static(steps) => m.advance(ptrs, steps),
                        PtrStep::Runtime(slot) => m.advance(ptrs, &loop_args(args, *slot)?.ptr_increments),
                    }
                    let remaining = m.gpr(*counter);
                    *remaining = remaining.saturating_sub(*increment);
                    if *remaining >= *increment {
                        pc = *body;
                    }
                }
                Inst::LoopFinalize { ptrs, offsets } => match offsets {
                    PtrStep::Static(offsets) => m.advance(ptrs, offsets),
                    PtrStep::Runtime(slot) => m.advance(ptrs, &loop_args(args, *slot)?.finalization_offsets),
                },
                Inst::Load {
                    dst,
                    ptr,
                    count,
                    stride,
                } => {
                    let step = stride_of(args, *stride)? * ELEM_BYTES;
                    let base = *m.gpr(*ptr) as *const u8;
                    let out = m.vec_mut(*dst);
                    for (lane, slot) in out.iter_mut().enumerate().take((*count).min(MAX_VECTOR_LANES)) {
                        *slot = ptr::read_unaligned(base.offset(lane as isize * step) as *const u32);
                    }
                }
                Inst::Store {
                    src,
                    ptr,
                    count,
                    stride,
                } => {
                    let step = stride_of(args, *stride)? * ELEM_BYTES;
                    let base = *m.gpr(*ptr) as *mut u8;
                    let values = m.vec(*src);
                    for (lane, value) in values.iter().enumerate().take((*count).min(MAX_VECTOR_LANES)) {
                        ptr::write_unaligned(base.offset(lane as isize * step) as *mut u32, *value);
                    }
                }
                Inst::Splat { dst, bits } => {
                    *m.vec_mut(*dst) = [*bits; MAX_VECTOR_LANES];
                }
                Inst::Unary {
                    op,
                    precision,
                    dst,
                    src,
                } => {
                    let x = *m.vec(*src);
                    let out = m.vec_mut(*dst);
                    for lane in 0..lanes {
                        out[lane] = unary(*op, *precision, x[lane]);
                    }
                }
                Inst::Binary {
                    op,
                    precision,
                    dst,
                    lhs,
                    rhs,
                } => {
                    let (a, b) = (*m.vec(*lhs), *m.vec(*rhs));
                    let out = m.vec_mut(*dst);
                    for lane in 0..lanes {
                        out[lane] = binary(*op, *precision, a[lane], b[lane]);
                    }
                }
                Inst::Spill { slot, src } => {
                    let values = *m.vec(*src);
                    let at = args.scratch.add(slot * SPILL_SLOT_BYTES);
                    ptr::copy_nonoverlapping(values.as_ptr() as *const u8, at, SPILL_SLOT_BYTES);
                }
                Inst::Reload { dst, slot } => {
                    let at = args.scratch.add(slot * SPILL_SLOT_BYTES);
                    let out = m.vec_mut(*dst);
                    ptr::copy_nonoverlapping(at as *const u8, out.as_mut_ptr() as *mut u8, SPILL_SLOT_BYTES);
                }
                Inst::Gemm { site, a, b, c } => {
                    let gemm = args
                        .executors
                        .gemm(*site)
                        .ok_or(RuntimeError::MissingExecutor { site: *site })?;
                    let (a, b, c) = (*m.gpr(*a), *m.gpr(*b), *m.gpr(*c));
                    gemm.run(a as *const u8, b as *const u8, c as *mut u8);
                }
                Inst::Ret => return Ok(()),
            }
        }
        Ok(())
    }
}
