//! Turns an execution [`Trace`] into a [`Graph`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    graph::{
        trace::{Trace, TraceOp, ValueRef},
        Graph, NodeId, NodeKind, NodeWeight,
    },
    profile::ProfileSet,
};

/// Model metadata the tracer does not record by itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// How many leading trace inputs are real model inputs. The rest are
    /// parameters and buffers.
    pub num_inputs: usize,
    /// Scope names of parameters and buffers, in trace input order.
    pub parameter_scopes: Vec<String>,
    /// Scopes of the layers whose cost was measured.
    pub profiled_layers: Vec<String>,
    /// Measured costs, keyed by profiled-layer scope.
    pub overrides: ProfileSet,
}

impl BuildConfig {
    pub fn new(num_inputs: usize) -> Self {
        BuildConfig {
            num_inputs,
            ..Default::default()
        }
    }

    pub fn with_parameters<S: ToString>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.parameter_scopes = scopes.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_profiled_layers<S: ToString>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.profiled_layers = scopes.into_iter().map(|s| s.to_string()).collect();
        self
    }

    /// Uses `profiles` as the weight overrides and adds any scope they
    /// mention to the profiled layers.
    pub fn with_profiles(mut self, profiles: ProfileSet) -> Self {
        for scope in profiles.scopes() {
            if !self.profiled_layers.iter().any(|l| l == scope) {
                self.profiled_layers.push(scope.to_string());
            }
        }
        self.overrides.merge(profiles);
        self
    }
}

pub struct GraphBuilder<'a> {
    config: &'a BuildConfig,
    graph: Graph,
    values: BTreeMap<ValueRef, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        GraphBuilder {
            config,
            graph: Graph::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn build(mut self, trace: &Trace) -> Result<Graph> {
        self.add_io_nodes(trace)?;
        let io_nodes = self.graph.len();
        for (seq, op) in trace.ops.iter().enumerate() {
            self.add_op_node(seq, op)?;
        }
        for &value in &trace.outputs {
            let id = self.resolve(value, "graph output")?;
            self.graph.mark_output(id);
        }
        let overridden = self.apply_overrides();
        tracing::debug!(
            "built graph with {} io nodes, {} op nodes, {} weight overrides",
            io_nodes,
            self.graph.len() - io_nodes,
            overridden
        );
        Ok(self.graph)
    }

    fn add_io_nodes(&mut self, trace: &Trace) -> Result<()> {
        let num_inputs = self.config.num_inputs;
        if num_inputs > trace.inputs.len() {
            return Err(Error::Config {
                reason: format!(
                    "{} model inputs declared but the trace has only {} inputs",
                    num_inputs,
                    trace.inputs.len()
                ),
            });
        }
        let extra_names = self.config.parameter_scopes.len() as isize
            - (trace.inputs.len() - num_inputs) as isize;
        if extra_names > 0 {
            tracing::warn!("{} parameter scopes have no matching trace input", extra_names);
        }

        for (idx, input) in trace.inputs.iter().enumerate() {
            let sizes = input.sizes.clone().ok_or_else(|| Error::ShapeResolution {
                input: idx,
                reason: "no declared dimension sizes".to_string(),
            })?;
            let (kind, scope) = if idx < num_inputs {
                (NodeKind::Input, format!("input{}", idx))
            } else {
                let name = self
                    .config
                    .parameter_scopes
                    .get(idx - num_inputs)
                    .ok_or_else(|| Error::ShapeResolution {
                        input: idx,
                        reason: "no parameter or buffer scope for this input".to_string(),
                    })?;
                (NodeKind::ParameterOrBuffer, name.clone())
            };
            let elements = sizes
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| Error::ShapeResolution {
                    input: idx,
                    reason: format!("element count of {:?} overflows", sizes),
                })?;
            let id = self
                .graph
                .add_node(scope, kind, vec![sizes], NodeWeight::Elements(elements));
            self.values.insert(idx, id);
        }
        Ok(())
    }

    fn add_op_node(&mut self, seq: usize, op: &TraceOp) -> Result<()> {
        let operands = op
            .inputs
            .iter()
            .map(|&value| self.resolve(value, &op.kind))
            .collect::<Result<Vec<NodeId>>>()?;

        let (scope, kind) = match self.encasing_layer(&op.scope) {
            Some(layer) => (layer.to_string(), NodeKind::ProfiledLayer),
            None => (format!("{}/{}{}", op.scope, op.kind, seq), NodeKind::RawOp),
        };
        let primary = self
            .graph
            .add_node(scope, kind, vec![op.output_shape()], NodeWeight::Unmeasured);
        for operand in operands {
            self.graph.connect(operand, primary);
        }

        for (slot, &value) in op.outputs.iter().enumerate() {
            let id = if slot == 0 {
                primary
            } else {
                self.graph.add_secondary(primary, slot).ok_or_else(|| {
                    Error::inconsistent(format!("output slot {} of op {} is out of place", slot, seq))
                })?
            };
            if self.values.insert(value, id).is_some() {
                return Err(Error::DanglingReference {
                    value,
                    reason: format!("defined twice, again by op {} ({})", seq, op.kind),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, value: ValueRef, user: &str) -> Result<NodeId> {
        self.values
            .get(&value)
            .copied()
            .ok_or_else(|| Error::DanglingReference {
                value,
                reason: format!("referenced by {} before any producer", user),
            })
    }

    /// Longest profiled-layer scope that prefixes `scope`.
    fn encasing_layer(&self, scope: &str) -> Option<&'a str> {
        self.config
            .profiled_layers
            .iter()
            .filter(|layer| !layer.is_empty() && scope.starts_with(layer.as_str()))
            .max_by_key(|layer| layer.len())
            .map(String::as_str)
    }

    fn apply_overrides(&mut self) -> usize {
        let mut applied = 0;
        for id in self.graph.ids().to_vec() {
            let Some(node) = self.graph.node_mut(id) else {
                continue;
            };
            if node.kind != NodeKind::ProfiledLayer {
                continue;
            }
            if let Some(profile) = self.config.overrides.get(&node.scope) {
                node.weight = NodeWeight::Timing(*profile);
                applied += 1;
            }
        }
        applied
    }
}

/// Builds the graph for `trace` with the metadata in `config`.
pub fn build_graph(trace: &Trace, config: &BuildConfig) -> Result<Graph> {
    GraphBuilder::new(config).build(trace)
}
