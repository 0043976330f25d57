//! Per-layer cost measurements handed to the graph builder.
//!
//! Measuring is done by the host runtime; this module only carries the
//! settled numbers and reads them from the CSV files the profiler writes.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io::Read, path::Path};

use crate::error::{Error, Result};

/// Measured cost of one profiled layer. Times are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerProfile {
    pub forward_ms: f64,
    pub backward_ms: f64,
    /// Static size of the layer's parameters and buffers.
    #[serde(default)]
    pub memory_bytes: u64,
}

impl LayerProfile {
    pub fn new(forward_ms: f64, backward_ms: f64) -> Self {
        LayerProfile {
            forward_ms,
            backward_ms,
            memory_bytes: 0,
        }
    }

    pub fn with_memory(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    /// Mean of the forward and backward time.
    pub fn mean_ms(&self) -> f64 {
        (self.forward_ms + self.backward_ms) / 2.0
    }
}

#[derive(Deserialize, Debug)]
struct ProfileRow {
    scope: String,
    forward_ms: f64,
    backward_ms: f64,
    #[serde(default)]
    memory_bytes: Option<u64>,
}

/// Profiles keyed by profiled-layer scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileSet {
    layers: BTreeMap<String, LayerProfile>,
}

impl ProfileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a `scope,forward_ms,backward_ms[,memory_bytes]` CSV file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = csv::Reader::from_path(path)?;
        Self::from_csv(reader)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_csv(csv::Reader::from_reader(reader))
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut layers = BTreeMap::new();
        for row in reader.deserialize() {
            let row: ProfileRow = row?;
            let profile = LayerProfile::new(row.forward_ms, row.backward_ms)
                .with_memory(row.memory_bytes.unwrap_or(0));
            if layers.insert(row.scope.clone(), profile).is_some() {
                tracing::warn!("profile for {} listed twice, keeping the last row", row.scope);
            }
        }
        Ok(Self { layers })
    }

    /// Builds profiles from raw hook measurements.
    ///
    /// Backward hooks fire in reverse layer order, so the backward time of
    /// layer `i` is the gap between its completion stamp and the stamp of
    /// layer `i + 1`. The last layer has nothing after it and gets zero.
    pub fn from_timestamps(
        scopes: &[String],
        forward_ms: &[f64],
        backward_stamps_ms: &[f64],
        memory_bytes: &[u64],
    ) -> Result<Self> {
        let n = scopes.len();
        if forward_ms.len() != n || backward_stamps_ms.len() != n || memory_bytes.len() != n {
            return Err(Error::Config {
                reason: format!(
                    "profiler measurements misaligned: {} scopes, {} forward times, {} backward stamps, {} sizes",
                    n,
                    forward_ms.len(),
                    backward_stamps_ms.len(),
                    memory_bytes.len()
                ),
            });
        }
        let backward = backward_stamps_ms
            .windows(2)
            .map(|w| (w[0] - w[1]).max(0.0))
            .chain((n > 0).then_some(0.0));
        let layers = scopes
            .iter()
            .zip(forward_ms)
            .zip(backward)
            .zip(memory_bytes)
            .map(|(((scope, &fwd), bwd), &mem)| {
                (scope.clone(), LayerProfile::new(fwd, bwd).with_memory(mem))
            })
            .collect();
        Ok(Self { layers })
    }

    pub fn insert(&mut self, scope: impl ToString, profile: LayerProfile) {
        self.layers.insert(scope.to_string(), profile);
    }

    pub fn get(&self, scope: &str) -> Option<&LayerProfile> {
        self.layers.get(scope)
    }

    /// Overlays `other` on top of `self`; entries in `other` win.
    pub fn merge(&mut self, other: ProfileSet) {
        self.layers.extend(other.layers);
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerProfile)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl FromIterator<(String, LayerProfile)> for ProfileSet {
    fn from_iter<T: IntoIterator<Item = (String, LayerProfile)>>(iter: T) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}
