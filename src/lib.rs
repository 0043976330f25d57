//! Partitions a traced neural network graph across accelerator devices.

pub mod config;
pub mod error;
pub mod graph;
pub mod optimize;
pub mod partition;
pub mod pipeline;
pub mod profile;
pub mod schedule;
pub mod solver;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use graph::{
    builder::{build_graph, BuildConfig},
    trace::Trace,
    Graph, Node, NodeKind, NodeWeight,
};
pub use pipeline::{partition_model, PartitionedModel};
pub use solver::{GraphPartitioner, SequentialPartitioner};
