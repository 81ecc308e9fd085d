//! The ordered expression list and its value/loop/port tables.

use std::collections::HashSet;
use std::fmt;

use crate::error::LirError;
use crate::expression::{ExprId, Expression, OpKind, Value, ValueId, ValueKind};
use crate::loops::{LoopId, LoopInfo, LoopKind};
use crate::types::Precision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Input,
    Output,
    Buffer,
}

/// A data pointer slot of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub kind: PortKind,
    pub precision: Precision,
    /// Shape-equivalence class assigned by the shape path analysis. Ports
    /// sharing a class are guaranteed to have identical shapes at run time.
    pub shape_path: Option<usize>,
}

/// Lowered Instruction Sequence.
#[derive(Debug, Clone, Default)]
pub struct LinearIr {
    exprs: Vec<Expression>,
    values: Vec<Value>,
    loops: Vec<LoopInfo>,
    ports: Vec<PortInfo>,
    next_expr: u32,
}

impl LinearIr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data pointer slot. Callers add inputs, then outputs, then buffers.
    pub fn add_port(&mut self, kind: PortKind, precision: Precision) -> usize {
        self.ports.push(PortInfo {
            kind,
            precision,
            shape_path: None,
        });
        self.ports.len() - 1
    }

    pub fn ports(&self) -> &[PortInfo] {
        &self.ports
    }

    pub fn port_mut(&mut self, port: usize) -> Option<&mut PortInfo> {
        self.ports.get_mut(port)
    }

    pub fn count_ports(&self, kind: PortKind) -> usize {
        self.ports.iter().filter(|p| p.kind == kind).count()
    }

    /// Build an expression with fresh output values without placing it.
    pub fn create(
        &mut self,
        op: OpKind,
        inputs: Vec<ValueId>,
        output_kinds: &[ValueKind],
        precision: Precision,
    ) -> Expression {
        let id = ExprId(self.next_expr);
        self.next_expr += 1;
        let outputs = output_kinds
            .iter()
            .map(|&kind| {
                let vid = ValueId(self.values.len() as u32);
                self.values.push(Value {
                    id: vid,
                    kind,
                    producer: id,
                });
                vid
            })
            .collect();
        Expression {
            id,
            op,
            inputs,
            outputs,
            loop_ids: Vec::new(),
            precision,
        }
    }

    /// Create and append an expression, returning its id.
    pub fn append(
        &mut self,
        op: OpKind,
        inputs: Vec<ValueId>,
        output_kinds: &[ValueKind],
        precision: Precision,
    ) -> ExprId {
        let expr = self.create(op, inputs, output_kinds, precision);
        let id = expr.id;
        self.exprs.push(expr);
        id
    }

    pub fn push(&mut self, expr: Expression) {
        self.exprs.push(expr);
    }

    pub fn insert(&mut self, position: usize, expr: Expression) {
        self.exprs.insert(position, expr);
    }

    pub fn remove(&mut self, position: usize) -> Expression {
        self.exprs.remove(position)
    }

    /// Splice the expression at `from` so it ends up at index `to` of the
    /// resulting sequence.
    pub fn move_expr(&mut self, from: usize, to: usize) {
        let expr = self.exprs.remove(from);
        self.exprs.insert(to, expr);
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn expressions(&self) -> &[Expression] {
        &self.exprs
    }

    pub fn get(&self, position: usize) -> Option<&Expression> {
        self.exprs.get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut Expression> {
        self.exprs.get_mut(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.exprs.iter()
    }

    /// Detach the whole sequence, e.g. to rebuild it in one pass.
    pub fn take_expressions(&mut self) -> Vec<Expression> {
        std::mem::take(&mut self.exprs)
    }

    pub fn set_expressions(&mut self, exprs: Vec<Expression>) {
        self.exprs = exprs;
    }

    /// Keep only expressions for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&Expression) -> bool) {
        self.exprs.retain(keep);
    }

    pub fn position_of(&self, id: ExprId) -> Option<usize> {
        self.exprs.iter().position(|e| e.id == id)
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.index())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value_kind(&self, id: ValueId) -> Option<ValueKind> {
        self.value(id).map(|v| v.kind)
    }

    /// Current position of the expression producing `value`.
    pub fn producer_position(&self, value: ValueId) -> Option<usize> {
        let producer = self.value(value)?.producer;
        self.position_of(producer)
    }

    /// Positions of every expression reading `value`, in order.
    pub fn consumer_positions(&self, value: ValueId) -> Vec<usize> {
        self.exprs
            .iter()
            .enumerate()
            .filter(|(_, e)| e.inputs.contains(&value))
            .map(|(i, _)| i)
            .collect()
    }

    /// Rewrite every use of `old` into a use of `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) {
        for expr in &mut self.exprs {
            for input in &mut expr.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    pub fn add_loop(&mut self, dim: usize, increment: usize, kind: LoopKind) -> LoopId {
        let id = LoopId(self.loops.len() as u32);
        self.loops.push(LoopInfo::new(id, dim, increment, kind));
        id
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    pub fn loop_info(&self, id: LoopId) -> Option<&LoopInfo> {
        self.loops.get(id.index())
    }

    pub fn loop_info_mut(&mut self, id: LoopId) -> Option<&mut LoopInfo> {
        self.loops.get_mut(id.index())
    }

    /// Positions of the `LoopBegin` and `LoopEnd` markers of `id`.
    pub fn loop_bounds(&self, id: LoopId) -> Option<(usize, usize)> {
        let begin = self
            .exprs
            .iter()
            .position(|e| e.op == OpKind::LoopBegin { loop_id: id })?;
        let end = self
            .exprs
            .iter()
            .position(|e| e.op == OpKind::LoopEnd { loop_id: id })?;
        Some((begin, end))
    }

    /// Loops currently placed in the sequence, in order of their begin markers.
    pub fn placed_loops(&self) -> Vec<LoopId> {
        self.exprs
            .iter()
            .filter_map(|e| match e.op {
                OpKind::LoopBegin { loop_id } => Some(loop_id),
                _ => None,
            })
            .collect()
    }

    /// For every position, the loops positionally enclosing it, outermost
    /// first. Markers are not inside the loop they delimit.
    pub fn loop_nesting(&self) -> Vec<Vec<LoopId>> {
        let mut stack: Vec<LoopId> = Vec::new();
        let mut nesting = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            match expr.op {
                OpKind::LoopBegin { loop_id } => {
                    nesting.push(stack.clone());
                    stack.push(loop_id);
                }
                OpKind::LoopEnd { loop_id } => {
                    if let Some(pos) = stack.iter().rposition(|&l| l == loop_id) {
                        stack.truncate(pos);
                    }
                    nesting.push(stack.clone());
                }
                _ => nesting.push(stack.clone()),
            }
        }
        nesting
    }

    /// Data ports read or written inside loop `id`, including nested loops.
    pub fn loop_ports(&self, id: LoopId) -> Vec<usize> {
        let Some((begin, end)) = self.loop_bounds(id) else {
            return Vec::new();
        };
        let mut ports: Vec<usize> = Vec::new();
        for expr in &self.exprs[begin + 1..end] {
            let accessed = match expr.op {
                OpKind::Load { .. } => expr.inputs.first(),
                OpKind::Store { .. } => expr.outputs.first(),
                _ => None,
            };
            if let Some(port) = accessed.and_then(|&v| self.value_kind(v)).and_then(|k| k.port()) {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports.sort_unstable();
        ports
    }

    /// Check structural invariants: loop markers matched and properly
    /// nested, every input defined by an earlier expression, ports in range.
    pub fn validate(&self) -> Result<(), LirError> {
        let mut stack: Vec<LoopId> = Vec::new();
        let mut begun: HashSet<LoopId> = HashSet::new();
        let mut defined: HashSet<ValueId> = HashSet::new();
        let placed: HashSet<ExprId> = self.exprs.iter().map(|e| e.id).collect();

        for (position, expr) in self.exprs.iter().enumerate() {
            for &input in &expr.inputs {
                let Some(value) = self.value(input) else {
                    return Err(LirError::DanglingValue {
                        expr: expr.id,
                        value: input,
                    });
                };
                if !placed.contains(&value.producer) {
                    return Err(LirError::DanglingValue {
                        expr: expr.id,
                        value: input,
                    });
                }
                if !defined.contains(&input) {
                    return Err(LirError::UseBeforeDefinition {
                        expr: expr.id,
                        value: input,
                    });
                }
            }

            match expr.op {
                OpKind::LoopBegin { loop_id } => {
                    if self.loop_info(loop_id).is_none() {
                        return Err(LirError::UnknownLoop { loop_id });
                    }
                    if !begun.insert(loop_id) {
                        return Err(LirError::DuplicateLoopBegin { loop_id });
                    }
                    stack.push(loop_id);
                }
                OpKind::LoopEnd { loop_id } => match stack.last() {
                    Some(&top) if top == loop_id => {
                        stack.pop();
                    }
                    Some(&top) if stack.contains(&loop_id) => {
                        return Err(LirError::OverlappingLoops {
                            expected: top,
                            found: loop_id,
                        });
                    }
                    _ => return Err(LirError::UnmatchedLoopEnd { loop_id, position }),
                },
                _ => {}
            }

            for &output in &expr.outputs {
                if let Some(ValueKind::Memory { port }) = self.value_kind(output) {
                    if port >= self.ports.len() {
                        return Err(LirError::UnknownPort { port });
                    }
                }
                defined.insert(output);
            }
        }

        match stack.pop() {
            Some(loop_id) => Err(LirError::UnclosedLoop { loop_id }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for LinearIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nesting = self.loop_nesting();
        for (position, expr) in self.exprs.iter().enumerate() {
            let depth = nesting.get(position).map_or(0, |n| n.len());
            writeln!(f, "{:4}: {}{}", position, "  ".repeat(depth), expr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::BinaryOp;

    fn param(lir: &mut LinearIr, index: usize) -> ValueId {
        let port = lir.add_port(PortKind::Input, Precision::F32);
        let id = lir.append(
            OpKind::Parameter { index },
            vec![],
            &[ValueKind::Memory { port }],
            Precision::F32,
        );
        lir.get(lir.position_of(id).unwrap()).unwrap().outputs[0]
    }

    fn append_value(lir: &mut LinearIr, op: OpKind, inputs: Vec<ValueId>, kind: ValueKind) -> ValueId {
        let id = lir.append(op, inputs, &[kind], Precision::F32);
        lir.get(lir.position_of(id).unwrap()).unwrap().outputs[0]
    }

    #[test]
    fn test_validate_accepts_simple_loop() {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        let l = lir.add_loop(0, 8, LoopKind::Vector);
        let counter = append_value(&mut lir, OpKind::LoopBegin { loop_id: l }, vec![], ValueKind::Gpr);
        let x = append_value(&mut lir, OpKind::Load { count: 8 }, vec![a], ValueKind::Vec);
        append_value(&mut lir, OpKind::Binary(BinaryOp::Add), vec![x, x], ValueKind::Vec);
        lir.append(OpKind::LoopEnd { loop_id: l }, vec![counter], &[], Precision::F32);

        assert_eq!(lir.validate(), Ok(()));
        assert_eq!(lir.loop_bounds(l), Some((1, 4)));
        assert_eq!(lir.loop_ports(l), vec![0]);
        let nesting = lir.loop_nesting();
        assert!(nesting[1].is_empty());
        assert_eq!(nesting[2], vec![l]);
        assert_eq!(nesting.len(), 5);
        assert!(nesting[4].is_empty());
    }

    #[test]
    fn test_validate_rejects_unclosed_loop() {
        let mut lir = LinearIr::new();
        let l = lir.add_loop(0, 1, LoopKind::Outer);
        lir.append(OpKind::LoopBegin { loop_id: l }, vec![], &[ValueKind::Gpr], Precision::F32);
        assert_eq!(lir.validate(), Err(LirError::UnclosedLoop { loop_id: l }));
    }

    #[test]
    fn test_validate_rejects_overlapping_loops() {
        let mut lir = LinearIr::new();
        let outer = lir.add_loop(1, 1, LoopKind::Outer);
        let inner = lir.add_loop(0, 1, LoopKind::Tail);
        let c0 = append_value(&mut lir, OpKind::LoopBegin { loop_id: outer }, vec![], ValueKind::Gpr);
        let c1 = append_value(&mut lir, OpKind::LoopBegin { loop_id: inner }, vec![], ValueKind::Gpr);
        lir.append(OpKind::LoopEnd { loop_id: outer }, vec![c0], &[], Precision::F32);
        lir.append(OpKind::LoopEnd { loop_id: inner }, vec![c1], &[], Precision::F32);
        assert_eq!(
            lir.validate(),
            Err(LirError::OverlappingLoops {
                expected: inner,
                found: outer
            })
        );
    }

    #[test]
    fn test_validate_rejects_use_before_definition() {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        let x = append_value(&mut lir, OpKind::Load { count: 1 }, vec![a], ValueKind::Vec);
        // Move the load in front of its parameter.
        lir.move_expr(1, 0);
        let load = lir.get(0).unwrap().id;
        assert_eq!(
            lir.validate(),
            Err(LirError::UseBeforeDefinition { expr: load, value: a })
        );
        let _ = x;
    }

    #[test]
    fn test_validate_rejects_dangling_value() {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        append_value(&mut lir, OpKind::Load { count: 1 }, vec![a], ValueKind::Vec);
        lir.remove(0);
        let load = lir.get(0).unwrap().id;
        assert_eq!(
            lir.validate(),
            Err(LirError::DanglingValue { expr: load, value: a })
        );
    }

    #[test]
    fn test_display_indents_loop_bodies() {
        let mut lir = LinearIr::new();
        let a = param(&mut lir, 0);
        let l = lir.add_loop(0, 4, LoopKind::Vector);
        let counter = append_value(&mut lir, OpKind::LoopBegin { loop_id: l }, vec![], ValueKind::Gpr);
        append_value(&mut lir, OpKind::Load { count: 4 }, vec![a], ValueKind::Vec);
        lir.append(OpKind::LoopEnd { loop_id: l }, vec![counter], &[], Precision::F32);
        let text = lir.to_string();
        assert!(text.contains(":   %2 = Load<4> %0"));
        assert!(text.contains("LoopEnd L0 %1"));
    }
}
