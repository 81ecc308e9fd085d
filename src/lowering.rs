//! Lowering of a [`Subgraph`] into a linear IR.
//!
//! The produced sequence is:
//!
//! 1. one `Parameter` per input;
//! 2. one `Buffer` + `Gemm` pair per reachable matmul;
//! 3. the element-wise region, every expression annotated with the loop
//!    pair `[outer, inner]`: loads, compute, and for each output a `Store`
//!    immediately followed by its `Result`.
//!
//! The `Result` markers carry no loop annotation but are placed where their
//! store is, so after loop insertion they sit inside the loop body. The
//! loop-escape repair pass moves them out.

use std::collections::{HashMap, HashSet};

use snipjit_lir::{
    BufferScope, ExprId, LinearIr, LoopId, LoopKind, OpKind, PortKind, Precision, ValueId,
    ValueKind,
};
use tracing::debug;

use crate::error::CompileError;
use crate::subgraph::{Node, NodeId, Subgraph};

/// A matmul lowered to a `Gemm` call writing a per-thread buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemmSite {
    pub node: NodeId,
    pub a_input: usize,
    pub b_input: usize,
    pub buffer_port: usize,
}

#[derive(Debug, Clone)]
pub struct Lowered {
    pub lir: LinearIr,
    pub gemm_sites: Vec<GemmSite>,
}

fn output_of(lir: &LinearIr, id: ExprId) -> Result<ValueId, CompileError> {
    lir.position_of(id)
        .and_then(|pos| lir.get(pos))
        .and_then(|e| e.output())
        .ok_or_else(|| CompileError::Unsupported(format!("expression {} has no output", id)))
}

fn reachable_nodes(subgraph: &Subgraph) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeId> = subgraph.outputs().to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match subgraph.node(id) {
            Some(Node::Unary { x, .. }) => stack.push(*x),
            Some(Node::Binary { lhs, rhs, .. }) => {
                stack.push(*lhs);
                stack.push(*rhs);
            }
            Some(Node::MatMul { a, b }) => {
                stack.push(*a);
                stack.push(*b);
            }
            _ => {}
        }
    }
    seen
}

fn input_index(subgraph: &Subgraph, id: NodeId) -> Result<usize, CompileError> {
    match subgraph.node(id) {
        Some(Node::Input { index }) => Ok(*index),
        _ => Err(CompileError::Unsupported(format!(
            "matmul operand {} must be a subgraph input",
            id
        ))),
    }
}

/// Emits the annotated element-wise region.
struct RegionBuilder<'a> {
    subgraph: &'a Subgraph,
    lir: &'a mut LinearIr,
    loop_ids: Vec<LoopId>,
    lanes: usize,
    input_mem: &'a [ValueId],
    gemm_mem: &'a HashMap<NodeId, ValueId>,
    values: HashMap<NodeId, ValueId>,
}

impl RegionBuilder<'_> {
    fn emit(
        &mut self,
        op: OpKind,
        inputs: Vec<ValueId>,
        kind: ValueKind,
        precision: Precision,
    ) -> Result<ValueId, CompileError> {
        let mut expr = self.lir.create(op, inputs, &[kind], precision);
        expr.loop_ids = self.loop_ids.clone();
        let value = expr
            .output()
            .ok_or_else(|| CompileError::Unsupported(format!("{} produced no value", op)))?;
        self.lir.push(expr);
        Ok(value)
    }

    fn value_of(&mut self, id: NodeId) -> Result<ValueId, CompileError> {
        if let Some(&v) = self.values.get(&id) {
            return Ok(v);
        }
        let precision = self.subgraph.precision_of(id)?;
        let node = self
            .subgraph
            .node(id)
            .cloned()
            .ok_or_else(|| CompileError::Unsupported(format!("missing node {}", id)))?;
        let value = match node {
            Node::Input { index } => self.emit(
                OpKind::Load { count: self.lanes },
                vec![self.input_mem[index]],
                ValueKind::Vec,
                precision,
            )?,
            Node::MatMul { .. } => {
                let mem = *self
                    .gemm_mem
                    .get(&id)
                    .ok_or_else(|| CompileError::Unsupported(format!("matmul {} not lowered", id)))?;
                self.emit(OpKind::Load { count: self.lanes }, vec![mem], ValueKind::Vec, precision)?
            }
            Node::Scalar { bits, .. } => {
                self.emit(OpKind::Scalar { bits }, vec![], ValueKind::Vec, precision)?
            }
            Node::Unary { op, x } => {
                let x = self.value_of(x)?;
                self.emit(OpKind::Unary(op), vec![x], ValueKind::Vec, precision)?
            }
            Node::Binary { op, lhs, rhs } => {
                let l = self.value_of(lhs)?;
                let r = self.value_of(rhs)?;
                self.emit(OpKind::Binary(op), vec![l, r], ValueKind::Vec, precision)?
            }
        };
        self.values.insert(id, value);
        Ok(value)
    }
}

/// Lower `subgraph` with vector loops stepping by `lanes`.
pub fn lower(subgraph: &Subgraph, lanes: usize) -> Result<Lowered, CompileError> {
    subgraph.check()?;
    let mut lir = LinearIr::new();
    let reachable = reachable_nodes(subgraph);

    let mut input_mem = Vec::with_capacity(subgraph.inputs().len());
    for (index, decl) in subgraph.inputs().iter().enumerate() {
        let port = lir.add_port(PortKind::Input, decl.precision);
        let id = lir.append(
            OpKind::Parameter { index },
            vec![],
            &[ValueKind::Memory { port }],
            decl.precision,
        );
        input_mem.push(output_of(&lir, id)?);
    }

    let mut output_ports = Vec::with_capacity(subgraph.outputs().len());
    for node in subgraph.outputs() {
        let precision = subgraph.precision_of(*node)?;
        output_ports.push((lir.add_port(PortKind::Output, precision), precision));
    }

    let mut gemm_mem = HashMap::new();
    let mut gemm_sites = Vec::new();
    for (i, node) in subgraph.nodes().iter().enumerate() {
        let Node::MatMul { a, b } = node else {
            continue;
        };
        let id = NodeId(i);
        if !reachable.contains(&id) {
            continue;
        }
        let precision = subgraph.precision_of(id)?;
        let a_input = input_index(subgraph, *a)?;
        let b_input = input_index(subgraph, *b)?;
        let site = gemm_sites.len();
        let port = lir.add_port(PortKind::Buffer, precision);
        let buffer = lir.append(
            OpKind::Buffer {
                id: site,
                scope: BufferScope::PerThread,
            },
            vec![],
            &[ValueKind::Memory { port }],
            precision,
        );
        let buffer = output_of(&lir, buffer)?;
        let gemm = lir.append(
            OpKind::Gemm { site },
            vec![input_mem[a_input], input_mem[b_input], buffer],
            &[ValueKind::Memory { port }],
            precision,
        );
        gemm_mem.insert(id, output_of(&lir, gemm)?);
        gemm_sites.push(GemmSite {
            node: id,
            a_input,
            b_input,
            buffer_port: port,
        });
    }

    let outer = lir.add_loop(1, 1, LoopKind::Outer);
    let inner = lir.add_loop(0, lanes, LoopKind::Vector);
    let mut region = RegionBuilder {
        subgraph,
        lir: &mut lir,
        loop_ids: vec![outer, inner],
        lanes,
        input_mem: &input_mem,
        gemm_mem: &gemm_mem,
        values: HashMap::new(),
    };
    for (index, node) in subgraph.outputs().iter().enumerate() {
        let value = region.value_of(*node)?;
        let (port, precision) = output_ports[index];
        let stored = region.emit(
            OpKind::Store { count: lanes },
            vec![value],
            ValueKind::Memory { port },
            precision,
        )?;
        region
            .lir
            .append(OpKind::Result { index }, vec![stored], &[], precision);
    }

    debug!(
        expressions = lir.len(),
        ports = lir.ports().len(),
        gemms = gemm_sites.len(),
        "lowered subgraph"
    );
    Ok(Lowered { lir, gemm_sites })
}
