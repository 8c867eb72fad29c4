//! Run-time execution graph
//!
//! Builds the node set for one run, rewrites chain-mode dependencies,
//! re-checks acyclicity, and answers the scheduler's readiness queries
//! against live node state.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use dagforge_common::error::{Error, Result};
use dagforge_core::dag::{Dag, DagType};
use dagforge_core::status::NodeStatus;

use crate::node::{Node, SkipCause};

/// Scheduling decision for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency is still pending.
    Wait,
    /// All dependencies released; the node may start.
    Run,
    /// The node will never run in this pass and inherits a skip.
    Skip(SkipCause),
    /// A dependency failed or aborted without releasing its successors;
    /// the node stays NotStarted.
    Blocked,
}

/// The node set and dependency structure of one run
pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build the graph for a validated DAG. Chain-typed DAGs get their
    /// missing dependencies synthesized from declaration order.
    pub fn build(dag: &Dag) -> Result<Self> {
        let mut nodes = Vec::with_capacity(dag.steps.len());
        let mut by_name = HashMap::with_capacity(dag.steps.len());
        for (idx, step) in dag.steps.iter().enumerate() {
            by_name.insert(step.name.clone(), idx);
            nodes.push(Arc::new(Node::new(step.clone())));
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); dag.steps.len()];
        for (idx, step) in dag.steps.iter().enumerate() {
            let mut declared = Vec::new();
            for reference in &step.depends {
                let name = dag.resolve_reference(reference).ok_or_else(|| {
                    Error::Validation(format!(
                        "step {:?}: depends reference {reference:?} does not resolve",
                        step.name
                    ))
                })?;
                let dep_idx = by_name[name];
                if !declared.contains(&dep_idx) {
                    declared.push(dep_idx);
                }
            }
            if declared.is_empty() && dag.dag_type == DagType::Chain && idx > 0 {
                declared.push(idx - 1);
            }
            deps[idx] = declared;
        }

        let graph = {
            let mut g: DiGraph<usize, ()> = DiGraph::new();
            let indices: Vec<_> = (0..nodes.len()).map(|i| g.add_node(i)).collect();
            for (idx, node_deps) in deps.iter().enumerate() {
                for &dep in node_deps {
                    g.add_edge(indices[dep], indices[idx], ());
                }
            }
            g
        };
        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(
                "dependency graph contains a cycle".to_string(),
            ));
        }

        Ok(Self {
            nodes,
            by_name,
            deps,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> &Arc<Node> {
        &self.nodes[idx]
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn deps_of(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    /// Exit-code input for a router node: the highest exit code among its
    /// dependencies.
    #[must_use]
    pub fn router_exit_code(&self, idx: usize) -> i32 {
        self.deps[idx]
            .iter()
            .map(|&dep| self.nodes[dep].exit_code())
            .max()
            .unwrap_or(0)
    }

    /// Evaluate whether a not-yet-started node can run.
    ///
    /// Release rules per dependency: success releases; failure releases
    /// only when the dependency's continue-on matched; a precondition
    /// skip releases only when the dependency continues on skip; a
    /// router-driven skip propagates unless some other dependency
    /// succeeded; aborts never release.
    #[must_use]
    pub fn readiness(&self, idx: usize) -> Readiness {
        let mut any_success = false;
        let mut any_propagated_skip = false;

        for &dep_idx in &self.deps[idx] {
            let dep = &self.nodes[dep_idx];
            let status = dep.status();
            if !status.is_terminal() {
                if dep.is_blocked() {
                    return Readiness::Blocked;
                }
                return Readiness::Wait;
            }
            match status {
                NodeStatus::Succeeded | NodeStatus::PartiallySucceeded => {
                    if let Some(targets) = dep.router_targets() {
                        if !targets.iter().any(|t| t == self.nodes[idx].name()) {
                            return Readiness::Skip(SkipCause::RouterUnselected);
                        }
                    }
                    any_success = true;
                }
                NodeStatus::Failed => {
                    if dep.continue_matched() != Some(true) {
                        return Readiness::Blocked;
                    }
                    any_success = true;
                }
                NodeStatus::Skipped => match dep.skip_cause() {
                    Some(SkipCause::RouterUnselected | SkipCause::Cascade) => {
                        any_propagated_skip = true;
                    }
                    _ => {
                        if dep.step().continue_on.skipped {
                            any_success = true;
                        } else {
                            return Readiness::Blocked;
                        }
                    }
                },
                NodeStatus::Aborted | NodeStatus::Rejected => return Readiness::Blocked,
                _ => return Readiness::Wait,
            }
        }

        if any_propagated_skip && !any_success {
            return Readiness::Skip(SkipCause::Cascade);
        }
        Readiness::Run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::step::{Command, Step};

    fn step(name: &str, depends: &[&str]) -> Step {
        let mut step = Step::named(name);
        step.commands = vec![Command::shell_string("true")];
        step.depends = depends.iter().map(ToString::to_string).collect();
        step
    }

    fn dag_of(dag_type: DagType, steps: Vec<Step>) -> Dag {
        Dag {
            name: "graph-test".to_string(),
            dag_type,
            steps,
            ..Dag::default()
        }
    }

    #[test]
    fn graph_mode_keeps_declared_deps() {
        let dag = dag_of(
            DagType::Graph,
            vec![step("a", &[]), step("b", &["a"]), step("c", &[])],
        );
        let graph = ExecutionGraph::build(&dag).unwrap();
        assert_eq!(graph.deps_of(0), &[] as &[usize]);
        assert_eq!(graph.deps_of(1), &[0]);
        assert_eq!(graph.deps_of(2), &[] as &[usize]);
    }

    #[test]
    fn chain_mode_synthesizes_missing_deps() {
        let dag = dag_of(
            DagType::Chain,
            vec![step("a", &[]), step("b", &[]), step("c", &["a"])],
        );
        let graph = ExecutionGraph::build(&dag).unwrap();
        assert_eq!(graph.deps_of(0), &[] as &[usize]);
        assert_eq!(graph.deps_of(1), &[0]);
        // Explicit depends suppress the synthesized edge.
        assert_eq!(graph.deps_of(2), &[0]);
    }

    #[test]
    fn roots_are_immediately_ready() {
        let dag = dag_of(DagType::Graph, vec![step("a", &[]), step("b", &["a"])]);
        let graph = ExecutionGraph::build(&dag).unwrap();
        assert_eq!(graph.readiness(0), Readiness::Run);
        assert_eq!(graph.readiness(1), Readiness::Wait);
    }

    #[test]
    fn precondition_skip_without_continue_blocks() {
        let dag = dag_of(DagType::Graph, vec![step("a", &[]), step("b", &["a"])]);
        let graph = ExecutionGraph::build(&dag).unwrap();
        graph.node(0).mark_skipped(SkipCause::Precondition);
        assert_eq!(graph.readiness(1), Readiness::Blocked);
    }

    #[test]
    fn precondition_skip_with_continue_releases() {
        let mut a = step("a", &[]);
        a.continue_on.skipped = true;
        let dag = dag_of(DagType::Graph, vec![a, step("b", &["a"])]);
        let graph = ExecutionGraph::build(&dag).unwrap();
        graph.node(0).mark_skipped(SkipCause::Precondition);
        assert_eq!(graph.readiness(1), Readiness::Run);
    }

    #[test]
    fn cascade_skip_propagates_without_success() {
        let dag = dag_of(DagType::Graph, vec![step("a", &[]), step("b", &["a"])]);
        let graph = ExecutionGraph::build(&dag).unwrap();
        graph.node(0).mark_skipped(SkipCause::RouterUnselected);
        assert_eq!(graph.readiness(1), Readiness::Skip(SkipCause::Cascade));
    }
}
