//! End-to-end partitioning of one trace.
//!
//! Build, optimize, solve and post-process run in sequence on a graph owned
//! by this call. Any failure aborts the run; nothing is retried.

use serde::Serialize;

use crate::{
    config::RunConfig,
    error::Result,
    graph::{builder::build_graph, trace::Trace, Graph},
    optimize::{optimize, OptimizeReport},
    partition::partition_graph,
    schedule::{post_process, DeviceSchedule},
    solver::GraphPartitioner,
};

#[derive(Debug, Clone, Serialize)]
pub struct PartitionedModel {
    pub graph: Graph,
    pub n_parts: usize,
    pub parts: Vec<usize>,
    pub schedule: DeviceSchedule,
    pub report: OptimizeReport,
}

pub fn partition_model(
    trace: &Trace,
    config: &RunConfig,
    partitioner: &dyn GraphPartitioner,
) -> Result<PartitionedModel> {
    let mut graph = build_graph(trace, &config.build)?;
    tracing::info!(
        "built graph with {} nodes from {} trace ops",
        graph.len(),
        trace.ops.len()
    );
    let report = optimize(&mut graph, &config.optimize);
    let partitioning = partition_graph(&graph, &config.partition, partitioner)?;
    let schedule = post_process(&mut graph, &partitioning, &config.partition.weights)?;
    Ok(PartitionedModel {
        graph,
        n_parts: partitioning.n_parts,
        parts: partitioning.parts,
        schedule,
        report,
    })
}
