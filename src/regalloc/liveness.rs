//! Live intervals over linear positions.

use std::collections::HashMap;

use snipjit_lir::{LinearIr, LoopId, RegisterClass, ValueId, ValueKind};

/// Live range of one register value, `[start, end]` in sequence positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInterval {
    pub value: ValueId,
    pub class: RegisterClass,
    pub start: usize,
    pub end: usize,
    pub uses: Vec<usize>,
}

impl LiveInterval {
    /// Two intervals interfere unless one ends where or before the other
    /// starts: an expression reads its inputs before writing its output, so
    /// a register freed by its last use can hold that expression's result.
    pub fn interferes(&self, other: &LiveInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Intervals of every register value, sorted by start.
///
/// A value defined outside a loop and used inside it stays live until the
/// loop's end: the body runs again after the last textual use.
pub fn compute_intervals(lir: &LinearIr) -> Vec<LiveInterval> {
    let nesting = lir.loop_nesting();
    let mut bounds: HashMap<LoopId, (usize, usize)> = HashMap::new();
    for loop_id in lir.placed_loops() {
        if let Some(b) = lir.loop_bounds(loop_id) {
            bounds.insert(loop_id, b);
        }
    }

    let mut uses: HashMap<ValueId, Vec<usize>> = HashMap::new();
    for (position, expr) in lir.iter().enumerate() {
        for &input in &expr.inputs {
            uses.entry(input).or_default().push(position);
        }
    }

    let mut intervals = Vec::new();
    for (position, expr) in lir.iter().enumerate() {
        for &output in &expr.outputs {
            let class = match lir.value_kind(output) {
                Some(ValueKind::Gpr) => RegisterClass::Gpr,
                Some(ValueKind::Vec) => RegisterClass::Vec,
                _ => continue,
            };
            let value_uses = uses.remove(&output).unwrap_or_default();
            let mut end = value_uses.iter().copied().max().unwrap_or(position);
            for &u in &value_uses {
                for loop_id in &nesting[u] {
                    if let Some(&(begin, loop_end)) = bounds.get(loop_id) {
                        if position < begin {
                            end = end.max(loop_end);
                        }
                    }
                }
            }
            intervals.push(LiveInterval {
                value: output,
                class,
                start: position,
                end,
                uses: value_uses,
            });
        }
    }
    intervals.sort_by_key(|iv| (iv.start, iv.value));
    intervals
}
