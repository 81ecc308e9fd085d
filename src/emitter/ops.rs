//! Per-operation emit functions.

use std::collections::HashMap;

use snipjit_lir::{Expression, LinearIr, LoopArgs, LoopId, OpKind, PhysicalReg, ValueId};

use super::kernel::{Inst, PtrStep, Stride, Work};
use crate::error::EmitError;
use crate::regalloc::{Location, RegisterAssignment};

/// Shape-dependent values baked into a static kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticArgs {
    /// Per loop slot (placed loops in order of their begin markers).
    pub loop_args: Vec<LoopArgs>,
    /// Per port, in elements.
    pub inner_strides: Vec<i64>,
    /// Per port, bytes per parallel-domain dimension.
    pub data_offsets: Vec<Vec<i64>>,
}

/// State threaded through the emit functions.
pub struct EmitContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) lir: &'a LinearIr,
    pub(crate) ra: &'a RegisterAssignment,
    pub(crate) baked: Option<&'a StaticArgs>,
    pub(crate) code: Vec<Inst>,
    loop_slots: HashMap<LoopId, usize>,
    open_loops: Vec<(LoopId, usize)>,
}

impl<'a> EmitContext<'a> {
    pub fn new(
        name: &'a str,
        lir: &'a LinearIr,
        ra: &'a RegisterAssignment,
        baked: Option<&'a StaticArgs>,
    ) -> Self {
        let loop_slots = lir
            .placed_loops()
            .into_iter()
            .enumerate()
            .map(|(slot, id)| (id, slot))
            .collect();
        Self {
            name,
            lir,
            ra,
            baked,
            code: Vec::new(),
            loop_slots,
            open_loops: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, inst: Inst) {
        self.code.push(inst);
    }

    pub(crate) fn unclosed_loop(&self) -> Option<LoopId> {
        self.open_loops.last().map(|(id, _)| *id)
    }

    fn location(&self, value: ValueId) -> Result<Location, EmitError> {
        self.ra.location(value).ok_or(EmitError::MissingLocation { value })
    }

    fn counter(&self, value: Option<ValueId>) -> Result<PhysicalReg, EmitError> {
        let value = value.unwrap_or(ValueId(u32::MAX));
        match self.location(value)? {
            Location::Gpr(r) => Ok(r),
            _ => Err(EmitError::MissingLocation { value }),
        }
    }

    /// Port and pinned pointer register of a memory value.
    fn pointer(&self, value: Option<ValueId>) -> Result<(usize, PhysicalReg), EmitError> {
        let value = value.unwrap_or(ValueId(u32::MAX));
        match self.location(value)? {
            Location::Memory { port } => self
                .ra
                .data_ptr(port)
                .map(|reg| (port, reg))
                .ok_or(EmitError::MissingLocation { value }),
            _ => Err(EmitError::MissingLocation { value }),
        }
    }

    fn scratch(&self, index: usize, value: ValueId) -> Result<PhysicalReg, EmitError> {
        self.ra
            .scratch_vec_regs
            .get(index)
            .copied()
            .ok_or(EmitError::MissingLocation { value })
    }

    /// Register holding `value` for reading, reloading it into scratch
    /// register `scratch` when it was spilled.
    fn read_vec(&mut self, value: ValueId, scratch: usize) -> Result<PhysicalReg, EmitError> {
        match self.location(value)? {
            Location::Vec(r) => Ok(r),
            Location::Spill(slot) => {
                let dst = self.scratch(scratch, value)?;
                self.push(Inst::Reload { dst, slot });
                Ok(dst)
            }
            _ => Err(EmitError::MissingLocation { value }),
        }
    }

    /// Register to compute `value` into, plus the slot to spill it to.
    fn write_vec(&self, value: Option<ValueId>) -> Result<(PhysicalReg, Option<usize>), EmitError> {
        let value = value.unwrap_or(ValueId(u32::MAX));
        match self.location(value)? {
            Location::Vec(r) => Ok((r, None)),
            Location::Spill(slot) => Ok((self.scratch(2, value)?, Some(slot))),
            _ => Err(EmitError::MissingLocation { value }),
        }
    }

    fn spill_after(&mut self, src: PhysicalReg, slot: Option<usize>) {
        if let Some(slot) = slot {
            self.push(Inst::Spill { slot, src });
        }
    }

    fn stride(&self, port: usize) -> Result<Stride, EmitError> {
        match self.baked {
            Some(args) => args
                .inner_strides
                .get(port)
                .map(|s| Stride::Static(*s))
                .ok_or_else(|| self.missing_static()),
            None => Ok(Stride::Runtime(port)),
        }
    }

    fn baked_loop(&self, slot: usize) -> Result<Option<&'a LoopArgs>, EmitError> {
        match self.baked {
            Some(args) => args.loop_args.get(slot).map(Some).ok_or_else(|| self.missing_static()),
            None => Ok(None),
        }
    }

    fn missing_static(&self) -> EmitError {
        EmitError::MissingStaticConfig {
            kernel: self.name.to_string(),
        }
    }

    fn slot(&self, loop_id: LoopId) -> Result<usize, EmitError> {
        self.loop_slots
            .get(&loop_id)
            .copied()
            .ok_or_else(|| EmitError::UnmatchedLoop {
                loop_id: loop_id.to_string(),
            })
    }
}

pub fn emit_nop(_ctx: &mut EmitContext<'_>, _expr: &Expression) -> Result<(), EmitError> {
    Ok(())
}

pub fn emit_loop_begin(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::LoopBegin { loop_id } = expr.op else {
        return Ok(());
    };
    let slot = ctx.slot(loop_id)?;
    let increment = ctx.lir.loop_info(loop_id).map_or(1, |info| info.increment);
    let counter = ctx.counter(expr.output())?;
    let work = match ctx.baked_loop(slot)? {
        Some(args) => Work::Static(args.work_amount),
        None => Work::Runtime(slot),
    };
    ctx.open_loops.push((loop_id, ctx.code.len()));
    ctx.push(Inst::LoopBegin {
        counter,
        work,
        increment,
        // Patched when the loop end is emitted.
        exit: 0,
    });
    Ok(())
}

pub fn emit_loop_end(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::LoopEnd { loop_id } = expr.op else {
        return Ok(());
    };
    let unmatched = || EmitError::UnmatchedLoop {
        loop_id: loop_id.to_string(),
    };
    let (open_id, begin_pc) = ctx.open_loops.pop().ok_or_else(unmatched)?;
    if open_id != loop_id {
        return Err(unmatched());
    }
    let slot = ctx.slot(loop_id)?;
    let Some(info) = ctx.lir.loop_info(loop_id) else {
        return Err(unmatched());
    };
    let (increment, is_last) = (info.increment, info.is_last_in_dim);
    let counter = ctx.counter(expr.inputs.first().copied())?;
    let ptrs: Vec<PhysicalReg> = ctx
        .lir
        .loop_ports(loop_id)
        .into_iter()
        .filter_map(|port| ctx.ra.data_ptr(port))
        .collect();

    let baked = ctx.baked_loop(slot)?;
    let step = match baked {
        Some(args) => PtrStep::Static(args.ptr_increments.clone()),
        None => PtrStep::Runtime(slot),
    };
    ctx.push(Inst::LoopEnd {
        counter,
        increment,
        body: begin_pc + 1,
        ptrs: ptrs.clone(),
        step,
    });

    let exit = ctx.code.len();
    match baked {
        Some(args) if args.finalization_offsets.iter().any(|o| *o != 0) => ctx.push(Inst::LoopFinalize {
            ptrs,
            offsets: PtrStep::Static(args.finalization_offsets.clone()),
        }),
        None if is_last => ctx.push(Inst::LoopFinalize {
            ptrs,
            offsets: PtrStep::Runtime(slot),
        }),
        _ => {}
    }
    if let Some(Inst::LoopBegin { exit: target, .. }) = ctx.code.get_mut(begin_pc) {
        *target = exit;
    }
    Ok(())
}

pub fn emit_load(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Load { count } = expr.op else {
        return Ok(());
    };
    let (port, ptr) = ctx.pointer(expr.inputs.first().copied())?;
    let stride = ctx.stride(port)?;
    let (dst, spill) = ctx.write_vec(expr.output())?;
    ctx.push(Inst::Load {
        dst,
        ptr,
        count,
        stride,
    });
    ctx.spill_after(dst, spill);
    Ok(())
}

pub fn emit_store(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Store { count } = expr.op else {
        return Ok(());
    };
    let value = expr.inputs.first().copied().unwrap_or(ValueId(u32::MAX));
    let src = ctx.read_vec(value, 0)?;
    let (port, ptr) = ctx.pointer(expr.output())?;
    let stride = ctx.stride(port)?;
    ctx.push(Inst::Store {
        src,
        ptr,
        count,
        stride,
    });
    Ok(())
}

pub fn emit_scalar(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Scalar { bits } = expr.op else {
        return Ok(());
    };
    let (dst, spill) = ctx.write_vec(expr.output())?;
    ctx.push(Inst::Splat { dst, bits });
    ctx.spill_after(dst, spill);
    Ok(())
}

pub fn emit_unary(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Unary(op) = expr.op else {
        return Ok(());
    };
    let value = expr.inputs.first().copied().unwrap_or(ValueId(u32::MAX));
    let src = ctx.read_vec(value, 0)?;
    let (dst, spill) = ctx.write_vec(expr.output())?;
    ctx.push(Inst::Unary {
        op,
        precision: expr.precision,
        dst,
        src,
    });
    ctx.spill_after(dst, spill);
    Ok(())
}

pub fn emit_binary(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Binary(op) = expr.op else {
        return Ok(());
    };
    let [lhs, rhs] = [0, 1].map(|i| expr.inputs.get(i).copied().unwrap_or(ValueId(u32::MAX)));
    let lhs = ctx.read_vec(lhs, 0)?;
    let rhs = ctx.read_vec(rhs, 1)?;
    let (dst, spill) = ctx.write_vec(expr.output())?;
    ctx.push(Inst::Binary {
        op,
        precision: expr.precision,
        dst,
        lhs,
        rhs,
    });
    ctx.spill_after(dst, spill);
    Ok(())
}

pub fn emit_gemm(ctx: &mut EmitContext<'_>, expr: &Expression) -> Result<(), EmitError> {
    let OpKind::Gemm { site } = expr.op else {
        return Ok(());
    };
    let (_, a) = ctx.pointer(expr.inputs.first().copied())?;
    let (_, b) = ctx.pointer(expr.inputs.get(1).copied())?;
    let (_, c) = ctx.pointer(expr.inputs.get(2).copied())?;
    ctx.push(Inst::Gemm { site, a, b, c });
    Ok(())
}
