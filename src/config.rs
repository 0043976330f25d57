//! Run configuration, read from a JSON file.

use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    graph::builder::BuildConfig,
    optimize::OptimizeConfig,
    partition::PartitionConfig,
};

/// Everything a pipeline run needs besides the trace itself. Every section
/// is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub build: BuildConfig,
    pub optimize: OptimizeConfig,
    pub partition: PartitionConfig,
}

impl RunConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: RunConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition.devices == 0 {
            return Err(Error::Config {
                reason: "partition.devices must be at least 1".to_string(),
            });
        }
        let scale = self.partition.weights.time_scale;
        if !scale.is_finite() || scale < 0.0 {
            return Err(Error::Config {
                reason: format!("partition.weights.time_scale must be a non-negative number, got {}", scale),
            });
        }
        if self.optimize.constant_marker.is_empty() {
            return Err(Error::Config {
                reason: "optimize.constant_marker must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
