//! Structural clean-up passes run on a freshly built graph.

use serde::{Deserialize, Serialize};

use crate::graph::Graph;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Substring of a node scope marking a constant-producing operator.
    pub constant_marker: String,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        OptimizeConfig {
            constant_marker: "::Constant".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub constants_removed: usize,
    pub dead_ends_removed: usize,
    /// Rounds run, counting the final one that changed nothing.
    pub rounds: usize,
}

impl OptimizeReport {
    pub fn removed(&self) -> usize {
        self.constants_removed + self.dead_ends_removed
    }
}

/// Splices out every node whose scope contains `marker`.
pub fn remove_constants(graph: &mut Graph, marker: &str) -> usize {
    graph.remove_where(|_, node| node.scope.contains(marker))
}

/// Removes nodes whose results are never consumed and are not graph outputs.
pub fn remove_dead_ends(graph: &mut Graph) -> usize {
    graph.remove_where(|g, node| node.out_edges().is_empty() && !g.is_output(node.id()))
}

/// Runs both passes to a joint fixed point, then renumbers.
pub fn optimize(graph: &mut Graph, config: &OptimizeConfig) -> OptimizeReport {
    let mut report = OptimizeReport::default();
    loop {
        report.rounds += 1;
        let constants = remove_constants(graph, &config.constant_marker);
        let dead_ends = remove_dead_ends(graph);
        report.constants_removed += constants;
        report.dead_ends_removed += dead_ends;
        if constants + dead_ends == 0 {
            break;
        }
    }
    graph.renumber();
    tracing::info!(
        "optimized graph to {} nodes: {} constants and {} dead ends removed in {} rounds",
        graph.len(),
        report.constants_removed,
        report.dead_ends_removed,
        report.rounds
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        builder::{build_graph, BuildConfig},
        trace::{Trace, TraceInput, TraceOp},
        NodeKind,
    };

    /// x -> relu -> (constant feeds) add -> out, plus an unused chunk slot
    /// and an op whose result nobody reads.
    fn trace() -> Trace {
        Trace {
            inputs: vec![TraceInput::new([4])],
            ops: vec![
                TraceOp::new("Net", "aten::relu", [0], [1]),
                TraceOp::new("Net", "prim::Constant", [1], [2]),
                TraceOp::new("Net", "aten::add", [2], [3]),
                TraceOp::new("Net", "aten::chunk", [3], [4, 5]),
                TraceOp::new("Net", "aten::sum", [0], [6]),
                TraceOp::new("Net", "aten::tanh", [4], [7]),
            ],
            outputs: vec![7],
        }
    }

    fn built() -> Graph {
        build_graph(&trace(), &BuildConfig::new(1)).unwrap()
    }

    #[test]
    fn test_constant_is_spliced_out() {
        let mut graph = built();
        let relu = graph.ids()[1];
        let add = graph.ids()[3];
        optimize(&mut graph, &OptimizeConfig::default());
        assert!(graph.nodes().all(|n| !n.scope.contains("::Constant")));
        assert!(graph.node(relu).unwrap().out_edges().contains(&add));
        assert!(graph.node(add).unwrap().in_edges().contains(&relu));
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_dead_ends_and_secondaries_removed() {
        let mut graph = built();
        assert_eq!(graph.len(), 8);
        let report = optimize(&mut graph, &OptimizeConfig::default());
        assert_eq!(report.constants_removed, 1);
        assert_eq!(report.dead_ends_removed, 2);
        let scopes: Vec<&str> = graph.nodes().map(|n| n.scope.as_str()).collect();
        assert_eq!(
            scopes,
            vec!["input0", "Net/aten::relu0", "Net/aten::add2", "Net/aten::chunk3", "Net/aten::tanh5"]
        );
        assert!(graph.is_normalized());
        assert_eq!(graph.adjacency_list(true), vec![vec![1], vec![2], vec![3], vec![4], vec![]]);
    }

    #[test]
    fn test_dead_end_removal_cascades() {
        let trace = Trace {
            inputs: vec![TraceInput::new([2]), TraceInput::new([2])],
            ops: vec![
                TraceOp::new("Net", "aten::neg", [1], [2]),
                TraceOp::new("Net", "aten::exp", [2], [3]),
                TraceOp::new("Net", "aten::relu", [0], [4]),
            ],
            outputs: vec![4],
        };
        let mut graph = build_graph(&trace, &BuildConfig::new(1).with_parameters(["Net/p"])).unwrap();
        let report = optimize(&mut graph, &OptimizeConfig::default());
        assert_eq!(report.dead_ends_removed, 3);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.node_at(0).unwrap().kind, NodeKind::Input);
    }

    #[test]
    fn test_outputs_survive_without_consumers() {
        let mut graph = built();
        optimize(&mut graph, &OptimizeConfig::default());
        let last = graph.node_at(graph.len() - 1).unwrap();
        assert!(last.out_edges().is_empty());
        assert!(graph.is_output(last.id()));
    }

    #[test]
    fn test_passes_are_idempotent() {
        let mut graph = built();
        optimize(&mut graph, &OptimizeConfig::default());
        let before = graph.to_string();
        assert_eq!(remove_constants(&mut graph, "::Constant"), 0);
        assert_eq!(remove_dead_ends(&mut graph), 0);
        let report = optimize(&mut graph, &OptimizeConfig::default());
        assert_eq!(report.removed(), 0);
        assert_eq!(report.rounds, 1);
        assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn test_custom_marker() {
        let mut graph = built();
        let config = OptimizeConfig {
            constant_marker: "aten::add".to_string(),
        };
        let report = optimize(&mut graph, &config);
        assert_eq!(report.constants_removed, 1);
        assert!(graph.nodes().any(|n| n.scope.contains("prim::Constant")));
    }
}
