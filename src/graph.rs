//! The task dependency graph and its deterministic traversal.
//!
//! Nodes are registration indices, edges point from a dependency to the
//! tasks that depend on it. The graph is built once from the frozen
//! registry when a run starts. Cycle detection is a three-color depth-first
//! walk that reports the offending path; the schedule itself comes from
//! Kahn's algorithm with the ready set ordered by registration index, so the
//! topological order is total and reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};

use crate::error::ConfigError;
use crate::registry::Registry;

pub(crate) struct TaskGraph {
    graph: Graph<usize, ()>,
    nodes: Vec<NodeIndex>,
    /// Resolved dependencies per task, declaration order, duplicates
    /// collapsed keeping the first occurrence.
    deps: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Resolves every dependency reference and wires the edges. Fails with
    /// `UndefinedTask` if any reference does not name a registered task.
    pub fn build(registry: &Registry) -> Result<Self, ConfigError> {
        let mut graph = Graph::new();
        let nodes: Vec<NodeIndex> = (0..registry.len()).map(|i| graph.add_node(i)).collect();

        let mut deps = Vec::with_capacity(registry.len());
        for (index, task) in registry.iter().enumerate() {
            let mut resolved = Vec::with_capacity(task.deps.len());
            let mut seen = HashSet::new();
            for dep in &task.deps {
                let dep = registry.resolve(dep)?;
                if seen.insert(dep) {
                    graph.add_edge(nodes[dep], nodes[index], ());
                    resolved.push(dep);
                }
            }
            deps.push(resolved);
        }

        Ok(Self { graph, nodes, deps })
    }

    /// Declared dependencies of a task, in declaration order.
    pub fn immediate_dependencies(&self, task: usize) -> &[usize] {
        &self.deps[task]
    }

    /// Every task reachable from `roots` through dependency edges,
    /// including the roots themselves.
    pub fn reachable(&self, roots: &[usize]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(task) = stack.pop() {
            if seen.insert(task) {
                stack.extend(self.deps[task].iter().copied());
            }
        }
        seen
    }

    /// Dependency-first order of the subgraph reachable from `roots`.
    ///
    /// Ties break by registration index. Fails with `CyclicDependency`
    /// carrying the cycle path when the reachable subgraph is not acyclic.
    pub fn topological_order(
        &self,
        registry: &Registry,
        roots: &[usize],
    ) -> Result<Vec<usize>, ConfigError> {
        self.check_cycles(registry, roots)?;

        let members = self.reachable(roots);

        let mut remaining: HashMap<usize, usize> = members
            .iter()
            .map(|&task| (task, self.deps[task].len()))
            .collect();

        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&task, _)| task)
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(task) = ready.pop_first() {
            order.push(task);
            for dependent in self.graph.neighbors_directed(self.nodes[task], Direction::Outgoing) {
                let dependent = self.graph[dependent];
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        debug_assert_eq!(order.len(), members.len());
        Ok(order)
    }

    /// Three-color depth-first walk over the subgraph reachable from
    /// `roots`. Hitting a node that is still on the stack closes a cycle;
    /// the reported path is the stack suffix starting at that node.
    fn check_cycles(&self, registry: &Registry, roots: &[usize]) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; registry.len()];
        let mut path = Vec::new();

        // Iterative DFS; a frame is (task, next dependency index).
        for &root in roots {
            if color[root] != Color::White {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            color[root] = Color::Gray;
            path.push(root);

            while let Some(&mut (task, next)) = stack.last_mut() {
                if let Some(&dep) = self.deps[task].get(next) {
                    stack.last_mut().unwrap().1 += 1;
                    match color[dep] {
                        Color::White => {
                            color[dep] = Color::Gray;
                            path.push(dep);
                            stack.push((dep, 0));
                        }
                        Color::Gray => {
                            let start = path.iter().position(|&t| t == dep).unwrap();
                            let cycle = path[start..]
                                .iter()
                                .map(|&t| registry.get(t).name.clone())
                                .collect();
                            return Err(ConfigError::CyclicDependency(cycle));
                        }
                        Color::Black => {}
                    }
                } else {
                    color[task] = Color::Black;
                    path.pop();
                    stack.pop();
                }
            }
        }

        Ok(())
    }
}
