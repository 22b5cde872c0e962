//! Directed acyclic graph of named nodes

use std::collections::{HashMap, VecDeque};

use pipeinfer_core::{Error, Result};

/// Node and edge bookkeeping for a pipeline.
///
/// Nodes are identified by their insertion index. Edges keep insertion
/// order, which fixes the order upstream outputs are merged in. Every
/// edge is checked for cycles before it is added, so the graph is acyclic
/// at all times.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    names: Vec<String>,
    index: HashMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
}

impl Dag {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Add a node; names must be unique
    pub fn add_node(&mut self, name: &str) -> Result<usize> {
        if self.index.contains_key(name) {
            return Err(Error::setup(format!("duplicate operator name `{name}`")));
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        self.upstream.push(Vec::new());
        self.downstream.push(Vec::new());
        Ok(id)
    }

    /// Index of a named node
    pub fn id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Name of a node
    pub fn name(&self, id: usize) -> &str {
        &self.names[id]
    }

    /// Add the edge `from -> to`, refusing duplicates and cycles
    pub fn add_edge(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.len() || to >= self.len() {
            return Err(Error::setup(format!("edge {from} -> {to} refers to a missing node")));
        }
        if self.downstream[from].contains(&to) {
            return Err(Error::setup(format!(
                "edge `{}` -> `{}` already exists",
                self.names[from], self.names[to]
            )));
        }
        if from == to || self.reaches(to, from) {
            return Err(Error::setup(format!(
                "edge `{}` -> `{}` would create a cycle",
                self.names[from], self.names[to]
            )));
        }
        self.downstream[from].push(to);
        self.upstream[to].push(from);
        Ok(())
    }

    /// Whether a path leads from `from` to `to`
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.len()];
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.extend(self.downstream[node].iter().copied());
        }
        false
    }

    /// Upstream nodes of `id`, in edge insertion order
    pub fn upstream(&self, id: usize) -> &[usize] {
        &self.upstream[id]
    }

    /// Downstream nodes of `id`, in edge insertion order
    pub fn downstream(&self, id: usize) -> &[usize] {
        &self.downstream[id]
    }

    /// Nodes without upstream edges
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len()).filter(|&id| self.upstream[id].is_empty()).collect()
    }

    /// Nodes without downstream edges
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.len()).filter(|&id| self.downstream[id].is_empty()).collect()
    }

    /// Kahn's algorithm; ties broken by insertion order
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&id| in_degree[id] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &self.downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.len() {
            return Err(Error::setup("pipeline graph contains a cycle"));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Dag {
        let mut dag = Dag::new();
        for name in ["a", "b", "c", "d"] {
            dag.add_node(name).unwrap();
        }
        dag.add_edge(0, 1).unwrap();
        dag.add_edge(0, 2).unwrap();
        dag.add_edge(1, 3).unwrap();
        dag.add_edge(2, 3).unwrap();
        dag
    }

    #[test]
    fn test_topological_order() {
        let dag = diamond();
        assert_eq!(dag.topological_order().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(dag.roots(), vec![0]);
        assert_eq!(dag.leaves(), vec![3]);
        assert_eq!(dag.upstream(3), &[1, 2]);
    }

    #[test]
    fn test_cycle_rejected_at_insertion() {
        let mut dag = diamond();
        let err = dag.add_edge(3, 0).unwrap_err();
        assert!(matches!(err, Error::OperatorSetup(msg) if msg.contains("cycle")));
        assert!(dag.downstream(3).is_empty());
        assert!(dag.add_edge(2, 2).is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut dag = diamond();
        assert!(dag.add_node("b").is_err());
        assert!(dag.add_edge(0, 1).is_err());
    }

    #[test]
    fn test_reachability() {
        let dag = diamond();
        assert!(dag.reaches(0, 3));
        assert!(!dag.reaches(1, 2));
        assert!(!dag.reaches(3, 0));
    }
}
