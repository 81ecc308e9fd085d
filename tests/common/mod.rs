//! Shared helpers: a scalar reference evaluator and input generators.
#![allow(dead_code)]

use std::sync::Arc;

use snipjit::subgraph::Node;
use snipjit::{
    compile, BinaryOp, CompileOptions, ExecContext, IsaTier, Layout, Subgraph, SubgraphExecutor, Target,
    TargetArchitecture, TargetCapabilities, TargetOperatingSystem, Tensor, UnaryOp,
};

pub fn avx2() -> TargetCapabilities {
    TargetCapabilities::for_isa(
        Target::new(TargetArchitecture::X86_64, TargetOperatingSystem::Linux),
        IsaTier::Avx2,
    )
}

/// A logical row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Dense {
    pub fn new(shape: &[usize], data: Vec<f32>) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Deterministic values in [-1, 1).
    pub fn random(shape: &[usize], seed: u64) -> Self {
        let len = shape.iter().product();
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let data = (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect();
        Self::new(shape, data)
    }

    fn at(&self, index: &[usize]) -> f32 {
        // Right-aligned broadcast read.
        let offset = index.len() - self.shape.len();
        let mut linear = 0;
        for (d, &extent) in self.shape.iter().enumerate() {
            let i = if extent == 1 { 0 } else { index[offset + d] };
            linear = linear * extent + i;
        }
        self.data[linear]
    }

    /// Values in the storage order of `layout`.
    pub fn storage(&self, layout: Layout) -> Vec<f32> {
        match layout {
            Layout::Planar => self.data.clone(),
            Layout::TransposedLast2 => {
                let rank = self.shape.len();
                let (m, n) = (self.shape[rank - 2], self.shape[rank - 1]);
                let batch = self.data.len() / (m * n);
                let mut out = vec![0.0; self.data.len()];
                for b in 0..batch {
                    for i in 0..m {
                        for j in 0..n {
                            out[b * m * n + j * m + i] = self.data[b * m * n + i * n + j];
                        }
                    }
                }
                out
            }
        }
    }

    pub fn tensor(&self, layout: Layout) -> Tensor {
        Tensor::from_f32_with_layout(&self.shape, layout, &self.storage(layout)).unwrap()
    }
}

fn broadcast(a: &[usize], b: &[usize]) -> Vec<usize> {
    let rank = a.len().max(b.len());
    let pad = |s: &[usize]| {
        let mut p = vec![1; rank - s.len()];
        p.extend_from_slice(s);
        p
    };
    pad(a).iter().zip(pad(b)).map(|(&x, y)| x.max(y)).collect()
}

fn indices(shape: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = shape.iter().product();
    (0..total)
        .map(|mut linear| {
            let mut index = vec![0; shape.len()];
            for d in (0..shape.len()).rev() {
                index[d] = linear % shape[d];
                linear /= shape[d];
            }
            index
        })
        .collect()
}

fn unary(op: UnaryOp, x: f32) -> f32 {
    match op {
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Exp => x.exp(),
    }
}

fn binary(op: BinaryOp, a: f32, b: f32) -> f32 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Max => a.max(b),
        BinaryOp::Min => a.min(b),
    }
}

fn matmul(a: &Dense, b: &Dense) -> Dense {
    let (ra, rb) = (a.shape.len(), b.shape.len());
    let (m, k, n) = (a.shape[ra - 2], a.shape[ra - 1], b.shape[rb - 1]);
    let batch = broadcast(&a.shape[..ra - 2], &b.shape[..rb - 2]);
    let mut shape = batch.clone();
    shape.extend([m, n]);
    let mut data = Vec::with_capacity(shape.iter().product());
    for index in indices(&shape) {
        let (i, j) = (index[index.len() - 2], index[index.len() - 1]);
        let mut acc = 0.0f32;
        for p in 0..k {
            let mut ai = index.clone();
            let last = ai.len() - 1;
            ai[last - 1] = i;
            ai[last] = p;
            let mut bi = index.clone();
            bi[last - 1] = p;
            bi[last] = j;
            acc += a.at(&ai) * b.at(&bi);
        }
        data.push(acc);
    }
    Dense { shape, data }
}

/// Evaluate `graph` node by node on logical inputs.
pub fn evaluate(graph: &Subgraph, inputs: &[Dense]) -> Vec<Dense> {
    let mut values: Vec<Option<Dense>> = Vec::with_capacity(graph.nodes().len());
    for node in graph.nodes() {
        let value = match node {
            Node::Input { index } => Some(inputs[*index].clone()),
            Node::Scalar { bits, .. } => Some(Dense::new(&[1], vec![f32::from_bits(*bits)])),
            Node::Unary { op, x } => {
                let x = values[x.0].as_ref().unwrap();
                Some(Dense::new(&x.shape, x.data.iter().map(|&v| unary(*op, v)).collect()))
            }
            Node::Binary { op, lhs, rhs } => {
                let (l, r) = (values[lhs.0].as_ref().unwrap(), values[rhs.0].as_ref().unwrap());
                let shape = broadcast(&l.shape, &r.shape);
                let data = indices(&shape)
                    .iter()
                    .map(|index| binary(*op, l.at(index), r.at(index)))
                    .collect();
                Some(Dense { shape, data })
            }
            Node::MatMul { a, b } => Some(matmul(values[a.0].as_ref().unwrap(), values[b.0].as_ref().unwrap())),
        };
        values.push(value);
    }
    graph
        .outputs()
        .iter()
        .map(|o| values[o.0].clone().unwrap())
        .collect()
}

pub fn executor(graph: &Subgraph, options: &CompileOptions, threads: usize) -> SubgraphExecutor {
    let compiled = compile(graph, &avx2(), options).unwrap();
    SubgraphExecutor::new(Arc::new(compiled), ExecContext::new(threads).unwrap())
}

/// Run `executor` on `inputs` stored with the graph's declared layouts.
pub fn run(executor: &mut SubgraphExecutor, graph: &Subgraph, inputs: &[Dense]) -> Vec<Dense> {
    let expected = evaluate(graph, inputs);
    let tensors: Vec<Tensor> = inputs
        .iter()
        .zip(graph.inputs())
        .map(|(d, decl)| d.tensor(decl.layout))
        .collect();
    let mut outputs: Vec<Tensor> = expected
        .iter()
        .map(|d| Tensor::zeros(&d.shape, snipjit::Precision::F32))
        .collect();
    executor.execute(&tensors, &mut outputs).unwrap();
    outputs
        .iter()
        .map(|t| Dense::new(t.shape(), t.to_f32_vec()))
        .collect()
}

pub fn assert_close(actual: &Dense, expected: &Dense, tolerance: f32) {
    assert_eq!(actual.shape, expected.shape);
    for (i, (a, e)) in actual.data.iter().zip(&expected.data).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {}: got {}, expected {}",
            i,
            a,
            e
        );
    }
}

/// Run and compare every output against the reference.
pub fn check(executor: &mut SubgraphExecutor, graph: &Subgraph, inputs: &[Dense]) {
    let expected = evaluate(graph, inputs);
    let actual = run(executor, graph, inputs);
    for (a, e) in actual.iter().zip(&expected) {
        assert_close(a, e, 1e-5);
    }
}
