//! Flow graph representation and analysis.

use cascade_core::declare::{Concurrency, NodeKind};
use cascade_core::error::{CascadeError, Result};
use cascade_core::types::QualifiedName;
use std::collections::VecDeque;

/// Index of a node in the flow graph.
pub type NodeIndex = usize;

/// A directed edge: the producer broadcasts into one input port of the
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// The producing node.
    pub from: NodeIndex,
    /// The consuming node.
    pub to: NodeIndex,
    /// The input port on the consumer fed by this edge.
    pub port: usize,
}

/// Structural information about one node.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The node's qualified name.
    pub name: QualifiedName,
    /// The node kind.
    pub kind: NodeKind,
    /// The node's concurrency policy.
    pub concurrency: Concurrency,
}

/// The wired flow graph: nodes plus port-addressed edges.
#[derive(Debug, Default)]
pub struct FlowGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl FlowGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its index.
    pub fn add_node(&mut self, node: GraphNode) -> NodeIndex {
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Add an edge.
    pub fn add_edge(&mut self, edge: Edge) {
        let idx = self.edges.len();
        self.outgoing[edge.from].push(idx);
        self.incoming[edge.to].push(idx);
        self.edges.push(edge);
    }

    /// Get a node by index.
    #[must_use]
    pub fn node(&self, index: NodeIndex) -> &GraphNode {
        &self.nodes[index]
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes with their indices.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &GraphNode)> {
        self.nodes.iter().enumerate()
    }

    /// Outgoing edges of a node.
    pub fn outgoing_edges(&self, node: NodeIndex) -> impl Iterator<Item = &Edge> {
        self.outgoing[node].iter().map(|&i| &self.edges[i])
    }

    /// Incoming edges of a node.
    pub fn incoming_edges(&self, node: NodeIndex) -> impl Iterator<Item = &Edge> {
        self.incoming[node].iter().map(|&i| &self.edges[i])
    }

    /// Number of input ports on a node (one per distinct upstream producer).
    #[must_use]
    pub fn port_count(&self, node: NodeIndex) -> usize {
        self.incoming_edges(node)
            .map(|e| e.port + 1)
            .max()
            .unwrap_or(0)
    }

    /// Perform topological sort using Kahn's algorithm.
    ///
    /// The order is deterministic for a given graph: ready nodes are visited
    /// in index order.
    ///
    /// # Errors
    /// Returns [`CascadeError::CycleDetected`] if the graph is not a DAG; the
    /// error lists the members of one strongly connected component.
    pub fn topological_sort(&self) -> Result<Vec<NodeIndex>> {
        let mut in_degree = vec![0_usize; self.nodes.len()];
        for edge in &self.edges {
            in_degree[edge.to] += 1;
        }

        let mut queue: VecDeque<NodeIndex> = (0..self.nodes.len())
            .filter(|&n| in_degree[n] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for edge in self.outgoing_edges(node) {
                in_degree[edge.to] -= 1;
                if in_degree[edge.to] == 0 {
                    queue.push_back(edge.to);
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let mut names: Vec<String> = self
                .cyclic_component()
                .into_iter()
                .map(|n| self.nodes[n].name.to_string())
                .collect();
            names.sort();
            return Err(CascadeError::CycleDetected { nodes: names });
        }
        Ok(sorted)
    }

    /// Find one non-singleton strongly connected component, if any.
    ///
    /// Iterative Tarjan; self-loops count as cyclic.
    #[must_use]
    pub fn cyclic_component(&self) -> Vec<NodeIndex> {
        let n = self.nodes.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![0_usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut next_index = 0_usize;

        // Explicit DFS frames: (node, iterator position over outgoing edges).
        enum Frame {
            Enter(NodeIndex),
            Resume(NodeIndex, usize),
        }

        for start in 0..n {
            if index[start] != usize::MAX {
                continue;
            }
            let mut frames = vec![Frame::Enter(start)];
            while let Some(frame) = frames.pop() {
                let (node, edge_pos) = match frame {
                    Frame::Enter(node) => {
                        index[node] = next_index;
                        lowlink[node] = next_index;
                        next_index += 1;
                        stack.push(node);
                        on_stack[node] = true;
                        (node, 0)
                    }
                    Frame::Resume(node, pos) => {
                        let child = self.edges[self.outgoing[node][pos - 1]].to;
                        lowlink[node] = lowlink[node].min(lowlink[child]);
                        (node, pos)
                    }
                };

                let mut advanced = false;
                for pos in edge_pos..self.outgoing[node].len() {
                    let child = self.edges[self.outgoing[node][pos]].to;
                    if index[child] == usize::MAX {
                        frames.push(Frame::Resume(node, pos + 1));
                        frames.push(Frame::Enter(child));
                        advanced = true;
                        break;
                    }
                    if on_stack[child] {
                        lowlink[node] = lowlink[node].min(index[child]);
                    }
                }
                if advanced {
                    continue;
                }

                if lowlink[node] == index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    let self_loop = component.len() == 1
                        && self.outgoing_edges(component[0]).any(|e| e.to == component[0]);
                    if component.len() > 1 || self_loop {
                        component.sort_unstable();
                        return component;
                    }
                }
            }
        }
        Vec::new()
    }

    /// Validate the graph structure: every edge in range, no cycles.
    ///
    /// # Errors
    /// Returns [`CascadeError::CycleDetected`] or
    /// [`CascadeError::InternalInvariant`].
    pub fn validate(&self) -> Result<()> {
        for edge in &self.edges {
            if edge.from >= self.nodes.len() || edge.to >= self.nodes.len() {
                return Err(CascadeError::InternalInvariant {
                    cause: format!("edge {}->{} references a missing node", edge.from, edge.to),
                });
            }
        }
        self.topological_sort()?;
        Ok(())
    }
}
