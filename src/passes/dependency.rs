//! Dependency graph of a linear IR and its acyclicity check.
//!
//! Edges:
//!
//! - data: producer -> consumer;
//! - membership: `LoopBegin(L)` -> every expression inside `L` -> `LoopEnd(L)`;
//! - completion: for consumers that need finished data (`Result`, `Gemm`),
//!   `LoopEnd(L)` -> consumer for every loop `L` enclosing the producer.
//!
//! A consumer of completed data placed inside the loop computing it both
//! precedes and follows that loop's end, which is the cycle loop-escape
//! repair exists to remove.

use std::collections::{BTreeSet, HashMap, VecDeque};

use snipjit_lir::{ExprId, LinearIr, LoopId, OpKind};

use super::{Pass, PassCategory, PassContext};
use crate::error::PassError;

pub struct DependencyGraph {
    exprs: Vec<(ExprId, &'static str)>,
    successors: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn build(lir: &LinearIr) -> Self {
        let n = lir.len();
        let nesting = lir.loop_nesting();
        let mut begins: HashMap<LoopId, usize> = HashMap::new();
        let mut ends: HashMap<LoopId, usize> = HashMap::new();
        for (position, expr) in lir.iter().enumerate() {
            match expr.op {
                OpKind::LoopBegin { loop_id } => {
                    begins.insert(loop_id, position);
                }
                OpKind::LoopEnd { loop_id } => {
                    ends.insert(loop_id, position);
                }
                _ => {}
            }
        }

        let mut successors = vec![BTreeSet::new(); n];
        let mut edge = |from: usize, to: usize| {
            if from != to {
                successors[from].insert(to);
            }
        };

        for (position, expr) in lir.iter().enumerate() {
            for &input in &expr.inputs {
                let Some(producer) = lir.producer_position(input) else {
                    continue;
                };
                edge(producer, position);
                if expr.op.consumes_completed() {
                    for loop_id in &nesting[producer] {
                        if let Some(&end) = ends.get(loop_id) {
                            edge(end, position);
                        }
                    }
                }
            }
            for loop_id in &nesting[position] {
                if let Some(&begin) = begins.get(loop_id) {
                    edge(begin, position);
                }
                if let Some(&end) = ends.get(loop_id) {
                    edge(position, end);
                }
            }
        }

        Self {
            exprs: lir.iter().map(|e| (e.id, e.op.name())).collect(),
            successors,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(|s| s.len()).sum()
    }

    /// Kahn's algorithm. Returns the first expression, in sequence order,
    /// that cannot be scheduled.
    pub fn first_blocked(&self) -> Option<usize> {
        let n = self.successors.len();
        let mut indegree = vec![0usize; n];
        for succ in &self.successors {
            for &to in succ {
                indegree[to] += 1;
            }
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut scheduled = 0;
        while let Some(node) = ready.pop_front() {
            scheduled += 1;
            for &to in &self.successors[node] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.push_back(to);
                }
            }
        }
        if scheduled == n {
            None
        } else {
            (0..n).find(|&i| indegree[i] > 0)
        }
    }

    pub fn is_acyclic(&self) -> bool {
        self.first_blocked().is_none()
    }
}

/// Fail with [`PassError::CyclicDependency`] if the graph has a cycle.
pub fn check_acyclic(lir: &LinearIr) -> Result<(), PassError> {
    let graph = DependencyGraph::build(lir);
    match graph.first_blocked() {
        None => Ok(()),
        Some(position) => {
            let (expr, op) = graph.exprs[position];
            Err(PassError::CyclicDependency { expr, op })
        }
    }
}

/// Pipeline step running [`check_acyclic`].
#[derive(Default)]
pub struct VerifyAcyclic;

impl Pass for VerifyAcyclic {
    fn name(&self) -> &'static str {
        "verify_acyclic"
    }

    fn description(&self) -> &'static str {
        "Reject sequences whose dependency graph has a cycle"
    }

    fn category(&self) -> PassCategory {
        PassCategory::Verification
    }

    fn run(&mut self, lir: &mut LinearIr, _ctx: &PassContext) -> Result<bool, PassError> {
        check_acyclic(lir)?;
        Ok(false)
    }
}
