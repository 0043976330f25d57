//! Maps a validated partitioning back onto the graph and orders the
//! resulting device stages.

use std::collections::BTreeSet;

use petgraph::{algo::toposort, graph::NodeIndex, Directed, Graph as PetGraph};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    graph::{Graph, NodeKind, NodeWeight},
    partition::{Partitioning, WeightPolicy},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub partition: usize,
    pub nodes: usize,
    pub solver_weight: u64,
    /// Static memory of the profiled layers placed on this stage.
    pub memory_bytes: u64,
    /// Element count of the parameters and buffers placed on this stage.
    pub parameter_elements: u64,
}

/// Execution order of the partitions derived from the node-level DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSchedule {
    /// Partitions in an order where every producer runs before its consumers.
    pub order: Vec<usize>,
    /// Distinct `(producer, consumer)` partition pairs.
    pub edges: Vec<(usize, usize)>,
    pub stages: Vec<StageSummary>,
}

/// Writes `partitioning` onto `graph` and derives the stage order.
///
/// The graph must still carry the indices the solver saw.
pub fn post_process(
    graph: &mut Graph,
    partitioning: &Partitioning,
    policy: &WeightPolicy,
) -> Result<DeviceSchedule> {
    if !graph.is_normalized() {
        return Err(Error::inconsistent(
            "graph indices changed between partitioning and post-processing",
        ));
    }
    if partitioning.parts.len() != graph.len() {
        return Err(Error::inconsistent(format!(
            "{} part ids for {} nodes",
            partitioning.parts.len(),
            graph.len()
        )));
    }
    if let Some(&part) = partitioning.parts.iter().find(|&&p| p >= partitioning.n_parts) {
        return Err(Error::inconsistent(format!(
            "part {} outside [0, {})",
            part, partitioning.n_parts
        )));
    }

    for (id, &part) in graph.ids().to_vec().into_iter().zip(&partitioning.parts) {
        if let Some(node) = graph.node_mut(id) {
            node.set_partition(part);
        }
    }

    let edges = induced_edges(graph, partitioning)?;
    let order = stage_order(partitioning.n_parts, &edges)?;
    let stages = summarize(graph, partitioning.n_parts, policy);
    tracing::debug!("stage order {:?} over {} cross-stage edges", order, edges.len());

    Ok(DeviceSchedule {
        order,
        edges,
        stages,
    })
}

fn induced_edges(graph: &Graph, partitioning: &Partitioning) -> Result<Vec<(usize, usize)>> {
    let mut edges = BTreeSet::new();
    for node in graph.nodes() {
        let from = partitioning.parts[node.index()];
        for &succ in node.out_edges() {
            let to = graph
                .node(succ)
                .map(|n| partitioning.parts[n.index()])
                .ok_or_else(|| Error::inconsistent(format!("edge to removed node {}", succ)))?;
            if from != to {
                edges.insert((from, to));
            }
        }
    }
    Ok(edges.into_iter().collect())
}

fn stage_order(n_parts: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>> {
    let mut stages = PetGraph::<usize, (), Directed>::with_capacity(n_parts, edges.len());
    for part in 0..n_parts {
        stages.add_node(part);
    }
    stages.extend_with_edges(
        edges
            .iter()
            .map(|&(from, to)| (NodeIndex::new(from), NodeIndex::new(to))),
    );
    let sorted = toposort(&stages, None).map_err(|cycle| {
        Error::inconsistent(format!(
            "partition {} lies on a cycle of the induced partition graph",
            stages[cycle.node_id()]
        ))
    })?;
    Ok(sorted.into_iter().map(|ix| stages[ix]).collect())
}

fn summarize(graph: &Graph, n_parts: usize, policy: &WeightPolicy) -> Vec<StageSummary> {
    let mut stages: Vec<StageSummary> = (0..n_parts)
        .map(|partition| StageSummary {
            partition,
            ..Default::default()
        })
        .collect();
    let mut counted_layers = BTreeSet::new();
    for node in graph.nodes() {
        let Some(part) = node.partition() else {
            continue;
        };
        let Some(stage) = stages.get_mut(part) else {
            continue;
        };
        stage.nodes += 1;
        match (node.kind, &node.weight) {
            (NodeKind::ProfiledLayer, NodeWeight::Timing(profile)) => {
                let weight = policy.weight(&node.weight);
                stage.solver_weight = stage.solver_weight.saturating_add(weight);
                // a layer traced as several ops still holds its parameters once per stage
                if counted_layers.insert((stage.partition, node.scope.as_str())) {
                    stage.memory_bytes = stage.memory_bytes.saturating_add(profile.memory_bytes);
                }
            }
            (NodeKind::ParameterOrBuffer, NodeWeight::Elements(n)) => {
                stage.parameter_elements = stage.parameter_elements.saturating_add(*n);
            }
            _ => {}
        }
    }
    stages
}
