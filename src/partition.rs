//! Adapter between the graph and a k-way graph partitioning solver.
//!
//! The graph is flattened into an undirected, index-aligned adjacency list
//! and an integer weight vector. Whatever the solver returns is validated
//! before anything downstream sees it.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    graph::{Graph, NodeKind, NodeWeight},
    solver::GraphPartitioner,
};

/// Converts raw node costs into solver integers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightPolicy {
    /// Multiplier applied to the mean forward/backward time in milliseconds.
    pub time_scale: f64,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        WeightPolicy { time_scale: 100.0 }
    }
}

impl WeightPolicy {
    /// `round(time_scale * (forward + backward) / 2)` for timed layers, 0 for
    /// everything else.
    pub fn weight(&self, weight: &NodeWeight) -> u64 {
        match weight {
            NodeWeight::Timing(profile) => (self.time_scale * profile.mean_ms()).round().max(0.0) as u64,
            NodeWeight::Elements(_) | NodeWeight::Unmeasured => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Number of target devices.
    pub devices: usize,
    /// Ask the solver for partitions that induce connected subgraphs.
    pub contiguous: bool,
    pub weights: WeightPolicy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            devices: 1,
            contiguous: true,
            weights: WeightPolicy::default(),
        }
    }
}

impl PartitionConfig {
    pub fn new(devices: usize) -> Self {
        PartitionConfig {
            devices,
            ..Default::default()
        }
    }
}

/// Everything the solver is given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionRequest {
    pub adjacency: Vec<Vec<usize>>,
    pub weights: Vec<u64>,
    pub n_parts: usize,
    pub contiguous: bool,
}

impl PartitionRequest {
    pub fn from_graph(graph: &Graph, config: &PartitionConfig) -> Result<Self> {
        if config.devices == 0 {
            return Err(Error::Config {
                reason: "cannot partition onto zero devices".to_string(),
            });
        }
        if !graph.is_normalized() {
            return Err(Error::partitioning("graph indices are not normalized"));
        }
        let adjacency = graph.adjacency_list(false);
        let weights: Vec<u64> = graph
            .nodes()
            .map(|node| match node.kind {
                NodeKind::ProfiledLayer => config.weights.weight(&node.weight),
                _ => 0,
            })
            .collect();
        debug_assert_eq!(adjacency.len(), weights.len());
        Ok(PartitionRequest {
            adjacency,
            weights,
            n_parts: config.devices,
            contiguous: config.contiguous,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Solver answer: the achieved part count and one part id per node index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioning {
    pub n_parts: usize,
    pub parts: Vec<usize>,
}

impl Partitioning {
    pub fn validate(&self, request: &PartitionRequest) -> Result<()> {
        if self.parts.len() != request.len() {
            return Err(Error::partitioning(format!(
                "{} part ids for {} nodes",
                self.parts.len(),
                request.len()
            )));
        }
        if self.n_parts > request.n_parts {
            return Err(Error::partitioning(format!(
                "{} parts achieved but only {} requested",
                self.n_parts, request.n_parts
            )));
        }
        if self.n_parts == 0 && !request.is_empty() {
            return Err(Error::partitioning("no parts for a non-empty graph"));
        }
        if let Some((index, part)) = self
            .parts
            .iter()
            .enumerate()
            .find(|(_, part)| **part >= self.n_parts)
        {
            return Err(Error::partitioning(format!(
                "node {} assigned to part {} outside [0, {})",
                index, part, self.n_parts
            )));
        }
        Ok(())
    }

    /// Total solver weight per part, saturating at `u64::MAX`.
    pub fn loads(&self, weights: &[u64]) -> Vec<u64> {
        let mut loads = vec![0u64; self.n_parts];
        for (&part, &w) in self.parts.iter().zip(weights) {
            loads[part] = loads[part].saturating_add(w);
        }
        loads
    }
}

/// Runs `partitioner` on `graph` and validates the answer.
pub fn partition_graph(
    graph: &Graph,
    config: &PartitionConfig,
    partitioner: &dyn GraphPartitioner,
) -> Result<Partitioning> {
    let request = PartitionRequest::from_graph(graph, config)?;
    let partitioning = partitioner.part_graph(&request).map_err(|e| match e {
        Error::Partitioning { .. } => e,
        other => Error::partitioning(other),
    })?;
    partitioning.validate(&request)?;
    tracing::info!(
        "partitioned {} nodes into {} of {} requested parts, loads {:?}",
        request.len(),
        partitioning.n_parts,
        request.n_parts,
        partitioning.loads(&request.weights)
    );
    Ok(partitioning)
}
