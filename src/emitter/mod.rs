//! Code generation: turn an allocated linear IR into a [`Kernel`].
//!
//! Every expression dispatches through the [`EmitterTable`]. The table is
//! checked against the whole sequence before emission starts, so a kernel
//! is either emitted completely or not at all.
//!
//! The entry sequence loads one pinned data pointer per port; the static
//! entry point then applies the per-port data offsets of the unit's index
//! tuple. Loops are emitted exactly as they appear in the sequence.

mod entry;
mod kernel;
mod ops;
mod vm;

use snipjit_lir::{LinearIr, PortKind};
use tracing::debug;

pub use entry::{EmitFn, EmitterEntry, EmitterTable, OpKey};
pub use kernel::{Inst, Kernel, KernelKind, PtrSource, PtrStep, Stride, Work, SPILL_SLOT_BYTES};
pub use ops::{EmitContext, StaticArgs};
pub use vm::CallArgs;

use crate::error::EmitError;
use crate::regalloc::RegisterAssignment;

/// Emit the kernel for `lir`. Static kernels need `baked` arguments.
pub fn emit(
    name: &str,
    lir: &LinearIr,
    ra: &RegisterAssignment,
    kind: KernelKind,
    lanes: usize,
    baked: Option<&StaticArgs>,
    table: &EmitterTable,
) -> Result<Kernel, EmitError> {
    table.check_support(lir)?;
    let baked = match kind {
        KernelKind::Static => Some(baked.ok_or_else(|| EmitError::MissingStaticConfig {
            kernel: name.to_string(),
        })?),
        KernelKind::Dynamic => None,
    };

    let mut ctx = EmitContext::new(name, lir, ra, baked);
    let mut counts = [0usize; 3];
    for (port, info) in lir.ports().iter().enumerate() {
        let (kind_index, make): (usize, fn(usize) -> PtrSource) = match info.kind {
            PortKind::Input => (0, PtrSource::Input),
            PortKind::Output => (1, PtrSource::Output),
            PortKind::Buffer => (2, PtrSource::Buffer),
        };
        let dst = ra.data_ptr(port).ok_or(EmitError::MissingDataPointer { port })?;
        ctx.push(Inst::LoadDataPtr {
            dst,
            source: make(counts[kind_index]),
        });
        counts[kind_index] += 1;
    }
    if let Some(args) = baked {
        for port in 0..lir.ports().len() {
            let offsets = args.data_offsets.get(port).cloned().unwrap_or_default();
            if let (true, Some(ptr)) = (offsets.iter().any(|o| *o != 0), ra.data_ptr(port)) {
                ctx.push(Inst::ApplyDataOffsets { ptr, offsets });
            }
        }
    }

    for expr in lir.iter() {
        let entry = table.entry_for(expr)?;
        (entry.emit)(&mut ctx, expr)?;
    }
    if let Some(open) = ctx.unclosed_loop() {
        return Err(EmitError::UnmatchedLoop {
            loop_id: open.to_string(),
        });
    }
    ctx.push(Inst::Ret);

    let kernel = Kernel {
        name: name.to_string(),
        kind,
        lanes,
        code: ctx.code,
        num_inputs: counts[0],
        num_outputs: counts[1],
        num_buffers: counts[2],
        spill_slots: ra.spill_slots,
    };
    debug!(kernel = %kernel.name, kind = %kind, insts = kernel.len(), "kernel emitted");
    Ok(kernel)
}
