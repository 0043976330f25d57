//! Directed computation graph derived from an executed trace.
//!
//! Nodes live in an arena addressed by [`NodeId`] handles that are never
//! reused. Edges are stored twice, as handle sets on both endpoints, and
//! every mutation goes through [`Graph`] so the two sides stay in sync.
//! The dense `index` of a node is separate from its handle: it is rewritten
//! by [`Graph::renumber`] and is what the partitioner sees.

use std::{collections::BTreeSet, fmt};

use itertools::Itertools;
use serde::{ser::Serializer, Deserialize, Serialize};

use crate::profile::LayerProfile;

pub mod builder;
pub mod dot;
pub mod trace;

/// Stable arena handle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Input,
    ParameterOrBuffer,
    ProfiledLayer,
    RawOp,
}

impl NodeKind {
    pub fn short_name(&self) -> &'static str {
        match self {
            NodeKind::Input => "IN",
            NodeKind::ParameterOrBuffer => "BUFF_PARAM",
            NodeKind::ProfiledLayer => "LAYER",
            NodeKind::RawOp => "OP",
        }
    }
}

/// Raw cost attached to a node before the solver's scaling policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum NodeWeight {
    /// Number of elements of an input, parameter or buffer.
    Elements(u64),
    /// Measured timing of a profiled layer.
    Timing(LayerProfile),
    Unmeasured,
}

impl fmt::Display for NodeWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeWeight::Elements(n) => write!(f, "{}", n),
            NodeWeight::Timing(p) => write!(f, "fwd {:.3}ms bwd {:.3}ms", p.forward_ms, p.backward_ms),
            NodeWeight::Unmeasured => write!(f, "0"),
        }
    }
}

pub type Shape = Vec<u64>;

/// Edge-set updates on a single node.
///
/// Single-handle and bulk variants are separate operations; the bulk ones
/// default to folding over the single ones.
pub trait Adjacency {
    fn add_in_edge(&mut self, node: NodeId);
    fn add_out_edge(&mut self, node: NodeId);
    fn remove_in_edge(&mut self, node: NodeId);
    fn remove_out_edge(&mut self, node: NodeId);

    fn add_in_edges<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        nodes.into_iter().for_each(|n| self.add_in_edge(n));
    }
    fn add_out_edges<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        nodes.into_iter().for_each(|n| self.add_out_edge(n));
    }
    fn remove_in_edges<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        nodes.into_iter().for_each(|n| self.remove_in_edge(n));
    }
    fn remove_out_edges<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        nodes.into_iter().for_each(|n| self.remove_out_edge(n));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: NodeId,
    index: usize,
    pub scope: String,
    pub kind: NodeKind,
    pub weight: NodeWeight,
    pub output_shape: Vec<Shape>,
    in_edges: BTreeSet<NodeId>,
    out_edges: BTreeSet<NodeId>,
    partition: Option<usize>,
}

impl Node {
    fn new(
        id: NodeId,
        index: usize,
        scope: String,
        kind: NodeKind,
        output_shape: Vec<Shape>,
        weight: NodeWeight,
    ) -> Self {
        Node {
            id,
            index,
            scope,
            kind,
            weight,
            output_shape,
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
            partition: None,
        }
    }

    /// Bookkeeping node for an extra output slot of `primary`. Shares the
    /// primary's descriptive attributes but none of its edges.
    fn secondary_of(primary: &Node, id: NodeId, index: usize) -> Self {
        Node::new(
            id,
            index,
            primary.scope.clone(),
            primary.kind,
            primary.output_shape.clone(),
            primary.weight,
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_edges(&self) -> &BTreeSet<NodeId> {
        &self.in_edges
    }

    pub fn out_edges(&self) -> &BTreeSet<NodeId> {
        &self.out_edges
    }

    /// Assigned partition; `None` until post-processing runs.
    pub fn partition(&self) -> Option<usize> {
        self.partition
    }

    pub(crate) fn set_partition(&mut self, partition: usize) {
        self.partition = Some(partition);
    }
}

impl Adjacency for Node {
    fn add_in_edge(&mut self, node: NodeId) {
        self.in_edges.insert(node);
    }
    fn add_out_edge(&mut self, node: NodeId) {
        self.out_edges.insert(node);
    }
    fn remove_in_edge(&mut self, node: NodeId) {
        self.in_edges.remove(&node);
    }
    fn remove_out_edge(&mut self, node: NodeId) {
        self.out_edges.remove(&node);
    }
}

/// Owns every node of the computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    slots: Vec<Option<Node>>,
    order: Vec<NodeId>,
    outputs: BTreeSet<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node to the canonical sequence. Its index is its position.
    pub fn add_node(
        &mut self,
        scope: impl ToString,
        kind: NodeKind,
        output_shape: Vec<Shape>,
        weight: NodeWeight,
    ) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        let node = Node::new(id, self.order.len(), scope.to_string(), kind, output_shape, weight);
        self.slots.push(Some(node));
        self.order.push(id);
        id
    }

    /// Appends the bookkeeping node for output `slot` of `primary` and wires
    /// the single edge `primary -> secondary`.
    ///
    /// Slot `s` must land at `primary.index() + s`, so secondaries are added
    /// in slot order right after their primary. Returns `None` when the
    /// primary is gone or the slot would land anywhere else.
    pub fn add_secondary(&mut self, primary: NodeId, slot: usize) -> Option<NodeId> {
        let index = self.order.len();
        let id = NodeId(self.slots.len() as u32);
        let node = {
            let primary = self.node(primary)?;
            if slot == 0 || primary.index + slot != index {
                return None;
            }
            Node::secondary_of(primary, id, index)
        };
        self.slots.push(Some(node));
        self.order.push(id);
        self.connect(primary, id);
        Some(id)
    }

    /// Adds the edge `from -> to` on both endpoints.
    pub fn connect(&mut self, from: NodeId, to: NodeId) {
        if let Some(n) = self.slot_mut(from) {
            n.add_out_edge(to);
        }
        if let Some(n) = self.slot_mut(to) {
            n.add_in_edge(from);
        }
    }

    pub fn disconnect(&mut self, from: NodeId, to: NodeId) {
        if let Some(n) = self.slot_mut(from) {
            n.remove_out_edge(to);
        }
        if let Some(n) = self.slot_mut(to) {
            n.remove_in_edge(from);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slot_mut(id)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Node at position `index` of the canonical sequence.
    pub fn node_at(&self, index: usize) -> Option<&Node> {
        self.order.get(index).and_then(|&id| self.node(id))
    }

    /// Nodes in canonical order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().filter_map(|&id| self.node(id))
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn mark_output(&mut self, id: NodeId) {
        self.outputs.insert(id);
    }

    /// Nodes holding the trace's final results.
    pub fn outputs(&self) -> &BTreeSet<NodeId> {
        &self.outputs
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    /// Per node, the sorted indices of its neighbours. Out-edges only when
    /// `directed`, otherwise the union of in- and out-edges.
    pub fn adjacency_list(&self, directed: bool) -> Vec<Vec<usize>> {
        self.nodes()
            .map(|node| {
                let neighbours: Vec<NodeId> = if directed {
                    node.out_edges.iter().copied().collect()
                } else {
                    node.out_edges.union(&node.in_edges).copied().collect()
                };
                neighbours
                    .into_iter()
                    .filter_map(|id| self.node(id))
                    .map(|n| n.index)
                    .sorted()
                    .collect()
            })
            .collect()
    }

    /// Raw node weights in index order.
    pub fn weights(&self) -> Vec<NodeWeight> {
        self.nodes().map(|n| n.weight).collect()
    }

    /// Rewrites every index to the node's position in the canonical
    /// sequence and returns that sequence.
    pub fn renumber(&mut self) -> Vec<NodeId> {
        let order = self.order.clone();
        for (index, &id) in order.iter().enumerate() {
            if let Some(node) = self.slot_mut(id) {
                node.index = index;
            }
        }
        order
    }

    /// True when indices are exactly `0..len` in canonical order.
    pub fn is_normalized(&self) -> bool {
        self.nodes().enumerate().all(|(i, n)| n.index == i)
    }

    /// True when every edge is recorded on both endpoints and points at a
    /// live node.
    pub fn is_consistent(&self) -> bool {
        self.nodes().all(|node| {
            node.out_edges
                .iter()
                .all(|&o| self.node(o).is_some_and(|n| n.in_edges.contains(&node.id)))
                && node
                    .in_edges
                    .iter()
                    .all(|&i| self.node(i).is_some_and(|n| n.out_edges.contains(&node.id)))
        })
    }

    /// Removes `id`, bridging every in-neighbour to every out-neighbour so
    /// reachability through the node is preserved.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.slots.get_mut(id.0 as usize)?.take()?;
        for &pred in &node.in_edges {
            if let Some(p) = self.slot_mut(pred) {
                p.remove_out_edge(id);
                p.add_out_edges(node.out_edges.iter().copied());
            }
        }
        for &succ in &node.out_edges {
            if let Some(s) = self.slot_mut(succ) {
                s.remove_in_edge(id);
                s.add_in_edges(node.in_edges.iter().copied());
            }
        }
        self.order.retain(|&other| other != id);
        self.outputs.remove(&id);
        Some(node)
    }

    /// Removes nodes matching `pred` until none match, splicing each one out
    /// with [`Graph::remove_node`]. Returns how many were removed.
    pub fn remove_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&Graph, &Node) -> bool,
    {
        let mut removed = 0;
        loop {
            let doomed: Vec<NodeId> = {
                let graph: &Graph = self;
                graph
                    .nodes()
                    .filter(|node| pred(graph, node))
                    .map(|node| node.id)
                    .collect()
            };
            if doomed.is_empty() {
                return removed;
            }
            for id in doomed {
                if self.remove_node(id).is_some() {
                    removed += 1;
                }
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} in scope {} of kind {}",
            self.index,
            self.scope,
            self.kind.short_name()
        )
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index_of = |ids: &BTreeSet<NodeId>| {
            ids.iter()
                .filter_map(|&id| self.node(id))
                .map(|n| n.index)
                .sorted()
                .join(", ")
        };
        for node in self.nodes() {
            writeln!(
                f,
                "{} flows to {{{}}} gathers {{{}}}",
                node,
                index_of(&node.out_edges),
                index_of(&node.in_edges)
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct NodeRecord<'a> {
    index: usize,
    scope: &'a str,
    kind: NodeKind,
    weight: NodeWeight,
    output_shape: &'a [Shape],
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    partition: Option<usize>,
    is_output: bool,
}

/// Serialized as the node list in index order, with edges given as indices.
impl Serialize for Graph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let indices = |ids: &BTreeSet<NodeId>| -> Vec<usize> {
            ids.iter()
                .filter_map(|&id| self.node(id))
                .map(|n| n.index)
                .sorted()
                .collect()
        };
        serializer.collect_seq(self.nodes().map(|node| NodeRecord {
            index: node.index,
            scope: &node.scope,
            kind: node.kind,
            weight: node.weight,
            output_shape: &node.output_shape,
            inputs: indices(&node.in_edges),
            outputs: indices(&node.out_edges),
            partition: node.partition,
            is_output: self.is_output(node.id),
        }))
    }
}
