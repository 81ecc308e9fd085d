//! Subgraph descriptions handed over by the model-graph layer.
//!
//! A [`Subgraph`] is an ordered list of nodes built through a small builder
//! API; every node only refers to nodes created before it, so the node order
//! is already topological. Shapes are declared per input with
//! [`Dim::Static`] or [`Dim::Dynamic`] extents and inferred for every other
//! node with numpy broadcasting.

use std::fmt;

use snipjit_lir::{BinaryOp, Precision, UnaryOp};

use crate::error::CompileError;

/// Highest tensor rank a subgraph may use.
pub const MAX_RANK: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

/// Memory layout of an input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// Row-major in logical dimension order.
    #[default]
    Planar,
    /// Row-major with the last two dimensions swapped: a logical `[.., M, N]`
    /// tensor is stored as `[.., N, M]`.
    TransposedLast2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDecl {
    pub dims: Vec<Dim>,
    pub precision: Precision,
    pub layout: Layout,
}

impl InputDecl {
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|d| match d {
                Dim::Static(n) => Some(*n),
                Dim::Dynamic => None,
            })
            .collect()
    }

    /// Whether `shape` can be bound to this declaration.
    pub fn accepts(&self, shape: &[usize]) -> bool {
        shape.len() == self.dims.len()
            && self.dims.iter().zip(shape).all(|(d, &n)| match d {
                Dim::Static(s) => *s == n,
                Dim::Dynamic => true,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Input { index: usize },
    /// Constant broadcast to any shape. Stored as its raw 32-bit pattern.
    Scalar { bits: u32, precision: Precision },
    Unary { op: UnaryOp, x: NodeId },
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    MatMul { a: NodeId, b: NodeId },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    nodes: Vec<Node>,
    inputs: Vec<InputDecl>,
    input_nodes: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl Subgraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Declare a planar input.
    pub fn input(&mut self, dims: &[Dim], precision: Precision) -> NodeId {
        self.input_with_layout(dims, precision, Layout::Planar)
    }

    pub fn input_with_layout(&mut self, dims: &[Dim], precision: Precision, layout: Layout) -> NodeId {
        let index = self.inputs.len();
        self.inputs.push(InputDecl {
            dims: dims.to_vec(),
            precision,
            layout,
        });
        let id = self.push(Node::Input { index });
        self.input_nodes.push(id);
        id
    }

    pub fn scalar_f32(&mut self, value: f32) -> NodeId {
        self.push(Node::Scalar {
            bits: value.to_bits(),
            precision: Precision::F32,
        })
    }

    pub fn scalar_i32(&mut self, value: i32) -> NodeId {
        self.push(Node::Scalar {
            bits: value as u32,
            precision: Precision::I32,
        })
    }

    pub fn unary(&mut self, op: UnaryOp, x: NodeId) -> NodeId {
        self.push(Node::Unary { op, x })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn relu(&mut self, x: NodeId) -> NodeId {
        self.unary(UnaryOp::Relu, x)
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Node::MatMul { a, b })
    }

    /// Mark `node` as the next subgraph output.
    pub fn output(&mut self, node: NodeId) -> usize {
        self.outputs.push(node);
        self.outputs.len() - 1
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    pub fn input_node(&self, index: usize) -> Option<NodeId> {
        self.input_nodes.get(index).copied()
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Every input dimension is known ahead of time.
    pub fn is_static(&self) -> bool {
        self.inputs.iter().all(|i| i.static_shape().is_some())
    }

    pub fn static_input_shapes(&self) -> Option<Vec<Vec<usize>>> {
        self.inputs.iter().map(|i| i.static_shape()).collect()
    }

    /// Structural checks that do not depend on shapes: node references,
    /// ranks, precision agreement and matmul operand kinds.
    pub fn check(&self) -> Result<(), CompileError> {
        if self.outputs.is_empty() {
            return Err(CompileError::Unsupported("subgraph without outputs".into()));
        }
        for (i, decl) in self.inputs.iter().enumerate() {
            if decl.dims.is_empty() || decl.dims.len() > MAX_RANK {
                return Err(CompileError::Unsupported(format!(
                    "input {} has rank {}, supported ranks are 1..={}",
                    i,
                    decl.dims.len(),
                    MAX_RANK
                )));
            }
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let operands: Vec<NodeId> = match node {
                Node::Input { .. } | Node::Scalar { .. } => vec![],
                Node::Unary { x, .. } => vec![*x],
                Node::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
                Node::MatMul { a, b } => vec![*a, *b],
            };
            if let Some(bad) = operands.iter().find(|o| o.0 >= i) {
                return Err(CompileError::Unsupported(format!(
                    "node n{} refers to later node {}",
                    i, bad
                )));
            }
            if let Node::MatMul { a, b } = node {
                for operand in [a, b] {
                    if !matches!(self.nodes[operand.0], Node::Input { .. }) {
                        return Err(CompileError::Unsupported(format!(
                            "matmul n{} operand {} must be a subgraph input",
                            i, operand
                        )));
                    }
                }
            }
            self.precision_of(NodeId(i))?;
        }
        for output in &self.outputs {
            if output.0 >= self.nodes.len() {
                return Err(CompileError::Unsupported(format!("output refers to missing node {}", output)));
            }
            if matches!(self.nodes[output.0], Node::Scalar { .. }) {
                return Err(CompileError::Unsupported(format!("output {} is a bare scalar", output)));
            }
        }
        Ok(())
    }

    /// Element precision of a node; operands of binary ops must agree.
    pub fn precision_of(&self, id: NodeId) -> Result<Precision, CompileError> {
        let node = self
            .node(id)
            .ok_or_else(|| CompileError::Unsupported(format!("missing node {}", id)))?;
        match node {
            Node::Input { index } => Ok(self.inputs[*index].precision),
            Node::Scalar { precision, .. } => Ok(*precision),
            Node::Unary { x, .. } => self.precision_of(*x),
            Node::Binary { lhs, rhs, op } => {
                let l = self.precision_of(*lhs)?;
                let r = self.precision_of(*rhs)?;
                if l != r {
                    return Err(CompileError::Precision(format!(
                        "{} node {} mixes {} and {}",
                        op.name(),
                        id,
                        l,
                        r
                    )));
                }
                Ok(l)
            }
            Node::MatMul { a, b } => {
                let l = self.precision_of(*a)?;
                let r = self.precision_of(*b)?;
                if l != r {
                    return Err(CompileError::Precision(format!(
                        "matmul node {} mixes {} and {}",
                        id, l, r
                    )));
                }
                Ok(l)
            }
        }
    }

    /// Shapes of every node for concrete input shapes.
    pub fn infer_shapes(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, String> {
        if input_shapes.len() != self.inputs.len() {
            return Err(format!(
                "expected {} input shapes, got {}",
                self.inputs.len(),
                input_shapes.len()
            ));
        }
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            let shape = match node {
                Node::Input { index } => {
                    let shape = &input_shapes[*index];
                    if !self.inputs[*index].accepts(shape) {
                        return Err(format!(
                            "input {} shape {:?} does not match declaration {:?}",
                            index, shape, self.inputs[*index].dims
                        ));
                    }
                    shape.clone()
                }
                Node::Scalar { .. } => Vec::new(),
                Node::Unary { x, .. } => shapes[x.0].clone(),
                Node::Binary { lhs, rhs, .. } => broadcast_shapes(&shapes[lhs.0], &shapes[rhs.0])
                    .ok_or_else(|| {
                        format!(
                            "node n{}: cannot broadcast {:?} with {:?}",
                            i, shapes[lhs.0], shapes[rhs.0]
                        )
                    })?,
                Node::MatMul { a, b } => matmul_shape(&shapes[a.0], &shapes[b.0])
                    .ok_or_else(|| {
                        format!(
                            "node n{}: cannot multiply {:?} by {:?}",
                            i, shapes[a.0], shapes[b.0]
                        )
                    })?,
            };
            shapes.push(shape);
        }
        Ok(shapes)
    }

    /// Output shapes for concrete input shapes.
    pub fn output_shapes(&self, input_shapes: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, String> {
        let shapes = self.infer_shapes(input_shapes)?;
        Ok(self.outputs.iter().map(|o| shapes[o.0].clone()).collect())
    }
}

/// Numpy broadcasting of two shapes, right-aligned.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![1; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// `[.., M, K] x [.., K, N] -> [.., M, N]` with broadcast batch dims.
pub fn matmul_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
    let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != k2 {
        return None;
    }
    let mut out = broadcast_shapes(&a[..a.len() - 2], &b[..b.len() - 2])?;
    out.push(m);
    out.push(n);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3, 8], &[8]), Some(vec![2, 3, 8]));
        assert_eq!(broadcast_shapes(&[2, 1, 8], &[3, 1]), Some(vec![2, 3, 8]));
        assert_eq!(broadcast_shapes(&[], &[4]), Some(vec![4]));
        assert_eq!(broadcast_shapes(&[2, 3], &[4, 3]), None);
    }

    #[test]
    fn test_matmul_shape() {
        assert_eq!(matmul_shape(&[2, 4, 5], &[5, 3]), Some(vec![2, 4, 3]));
        assert_eq!(matmul_shape(&[4, 5], &[6, 3]), None);
        assert_eq!(matmul_shape(&[5], &[5, 3]), None);
    }

    #[test]
    fn test_infer_relu_add() {
        let mut sg = Subgraph::new();
        let a = sg.input(&[Dim::Dynamic, Dim::Static(3), Dim::Static(8)], Precision::F32);
        let b = sg.input(&[Dim::Static(8)], Precision::F32);
        let sum = sg.add(a, b);
        let out = sg.relu(sum);
        sg.output(out);
        assert!(!sg.is_static());
        assert_eq!(sg.check(), Ok(()));

        let shapes = sg.output_shapes(&[vec![4, 3, 8], vec![8]]).unwrap();
        assert_eq!(shapes, vec![vec![4, 3, 8]]);
        assert!(sg.output_shapes(&[vec![4, 2, 8], vec![8]]).is_err());
    }

    #[test]
    fn test_check_rejects_computed_matmul_operand() {
        let mut sg = Subgraph::new();
        let a = sg.input(&[Dim::Static(2), Dim::Static(2)], Precision::F32);
        let r = sg.relu(a);
        let mm = sg.matmul(r, a);
        sg.output(mm);
        let err = sg.check().unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(msg) if msg.contains("must be a subgraph input")));
    }

    #[test]
    fn test_check_rejects_mixed_precision() {
        let mut sg = Subgraph::new();
        let a = sg.input(&[Dim::Static(4)], Precision::F32);
        let b = sg.input(&[Dim::Static(4)], Precision::I32);
        let s = sg.add(a, b);
        sg.output(s);
        assert!(matches!(sg.check(), Err(CompileError::Precision(_))));
    }
}
