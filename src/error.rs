//! Error types for the partitioning pipeline.
//!
//! Every failure mode is a matchable variant; nothing in the crate swallows
//! an error or retries.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A trace input is missing its declared shape, or a parameter/buffer
    /// input has no scope name to go with it.
    #[error("shape resolution failed for trace input {input}: {reason}")]
    ShapeResolution { input: usize, reason: String },

    /// A trace op refers to a value that no earlier input or op produced.
    /// Indicates a misbehaving trace producer.
    #[error("dangling reference to trace value {value}: {reason}")]
    DanglingReference { value: usize, reason: String },

    /// The solver failed or returned an assignment that does not fit the graph.
    #[error("partitioning failed: {reason}")]
    Partitioning { reason: String },

    /// Post-processing found an assignment that cannot be scheduled.
    #[error("inconsistent partition: {reason}")]
    InconsistentPartition { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("malformed trace: {0}")]
    TraceFormat(#[from] serde_json::Error),

    #[error("malformed profile: {0}")]
    Profile(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn partitioning(reason: impl ToString) -> Self {
        Error::Partitioning {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn inconsistent(reason: impl ToString) -> Self {
        Error::InconsistentPartition {
            reason: reason.to_string(),
        }
    }
}
