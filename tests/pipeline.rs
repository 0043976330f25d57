//! End-to-end runs of the partitioning pipeline through the public API.

use modelsplit::{
    graph::{dot::DotOptions, NodeId},
    partition::{PartitionRequest, Partitioning, WeightPolicy},
    partition_model,
    profile::ProfileSet,
    schedule::post_process,
    BuildConfig, Error, Graph, NodeKind, NodeWeight, RunConfig, SequentialPartitioner, Trace,
};

/// conv -> relu -> (constant scale) mul -> fc1 -> relu -> fc2, with the conv
/// and linear parameters as extra trace inputs.
const TRACE: &str = r#"{
    "inputs": [
        {"sizes": [8, 3, 32, 32]},
        {"sizes": [16, 3, 3, 3]},
        {"sizes": [16]},
        {"sizes": [10, 16384]},
        {"sizes": [10, 10]}
    ],
    "ops": [
        {"inputs": [0, 1, 2], "outputs": [5], "scope": "Net/Conv2d[conv]", "kind": "aten::_convolution",
         "output_type": "Float(8, 16, 32, 32)"},
        {"inputs": [5], "outputs": [6], "scope": "Net/ReLU[act1]", "kind": "aten::relu",
         "output_type": "Float(8, 16, 32, 32)"},
        {"inputs": [], "outputs": [7], "scope": "Net", "kind": "prim::Constant"},
        {"inputs": [6, 7], "outputs": [8], "scope": "Net", "kind": "aten::mul",
         "output_type": "Float(8, 16, 32, 32)"},
        {"inputs": [8], "outputs": [9, 10], "scope": "Net", "kind": "aten::max",
         "output_type": "Float(8, 16384)"},
        {"inputs": [9, 3], "outputs": [11], "scope": "Net/Linear[fc1]", "kind": "aten::matmul",
         "output_type": "Float(8, 10)"},
        {"inputs": [11], "outputs": [12], "scope": "Net/ReLU[act2]", "kind": "aten::relu",
         "output_type": "Float(8, 10)"},
        {"inputs": [12, 4], "outputs": [13], "scope": "Net/Linear[fc2]", "kind": "aten::matmul",
         "output_type": "Float(8, 10)"}
    ],
    "outputs": [13]
}"#;

const CONFIG: &str = r#"{
    "build": {
        "num_inputs": 1,
        "parameter_scopes": [
            "Net/Conv2d[conv]/Parameter[weight]",
            "Net/Conv2d[conv]/Parameter[bias]",
            "Net/Linear[fc1]/Parameter[weight]",
            "Net/Linear[fc2]/Parameter[weight]"
        ]
    },
    "partition": {"devices": 2}
}"#;

const PROFILE: &str = "scope,forward_ms,backward_ms,memory_bytes
Net/Conv2d[conv],4.0,6.0,1792
Net/ReLU[act1],0.5,0.5,0
Net/Linear[fc1],3.0,5.0,655360
Net/ReLU[act2],0.1,0.1,0
Net/Linear[fc2],0.5,1.5,400
";

fn config() -> RunConfig {
    let mut config: RunConfig = serde_json::from_str(CONFIG).unwrap();
    let profiles = ProfileSet::from_reader(PROFILE.as_bytes()).unwrap();
    config.build = config.build.with_profiles(profiles);
    config.validate().unwrap();
    config
}

fn trace() -> Trace {
    Trace::from_reader(TRACE.as_bytes()).unwrap()
}

#[test]
fn test_full_pipeline() {
    let model = partition_model(&trace(), &config(), &SequentialPartitioner).unwrap();
    let graph = &model.graph;

    assert_eq!(model.report.constants_removed, 1);
    // the unused second output of aten::max
    assert_eq!(model.report.dead_ends_removed, 1);
    assert_eq!(graph.len(), 12);
    assert!(graph.is_normalized());
    assert!(graph.is_consistent());
    assert!(graph.nodes().all(|n| !n.scope.contains("::Constant")));

    // the constant's consumer is still fed by relu
    let mul = graph.nodes().find(|n| n.scope == "Net/aten::mul3").unwrap();
    let relu = graph.nodes().find(|n| n.scope == "Net/ReLU[act1]").unwrap();
    assert!(mul.in_edges().contains(&relu.id()));

    assert_eq!(model.parts.len(), graph.len());
    assert_eq!(model.n_parts, 2);
    assert!(model.parts.iter().all(|&p| p < model.n_parts));
    assert!(graph.nodes().all(|n| n.partition() == Some(model.parts[n.index()])));
    assert_eq!(model.schedule.order, vec![0, 1]);
    assert_eq!(model.schedule.edges, vec![(0, 1)]);

    let total: u64 = model.schedule.stages.iter().map(|s| s.solver_weight).sum();
    assert_eq!(total, 500 + 50 + 400 + 10 + 100);
    let memory: u64 = model.schedule.stages.iter().map(|s| s.memory_bytes).sum();
    assert_eq!(memory, 1792 + 655360 + 400);
}

#[test]
fn test_result_serializes_with_partitions() {
    let model = partition_model(&trace(), &config(), &SequentialPartitioner).unwrap();
    let json = serde_json::to_value(&model).unwrap();
    let nodes = json["graph"].as_array().unwrap();
    assert_eq!(nodes.len(), model.graph.len());
    assert!(nodes.iter().all(|n| n["partition"].is_u64()));
    assert_eq!(json["n_parts"], serde_json::json!(2));
    let dot = model.graph.to_dot(&DotOptions::default());
    assert!(dot.contains("fillcolor=grey"));
    assert!(dot.contains("fillcolor=green"));
}

#[test]
fn test_single_device_keeps_everything_together() {
    let mut config = config();
    config.partition.devices = 1;
    let model = partition_model(&trace(), &config, &SequentialPartitioner).unwrap();
    assert_eq!(model.n_parts, 1);
    assert!(model.schedule.edges.is_empty());
    assert_eq!(model.schedule.order, vec![0]);
}

#[test]
fn test_solver_garbage_aborts_the_run() {
    let garbage = |r: &PartitionRequest| -> modelsplit::Result<Partitioning> {
        Ok(Partitioning {
            n_parts: 2,
            parts: vec![0; r.len() + 1],
        })
    };
    assert!(matches!(
        partition_model(&trace(), &config(), &garbage),
        Err(Error::Partitioning { .. })
    ));
}

#[test]
fn test_non_contiguous_solver_answer_is_caught() {
    // alternate parts along the chain: 0 -> 1 -> 0 at the partition level
    let alternating = |r: &PartitionRequest| -> modelsplit::Result<Partitioning> {
        Ok(Partitioning {
            n_parts: 2,
            parts: (0..r.len()).map(|i| i % 2).collect(),
        })
    };
    assert!(matches!(
        partition_model(&trace(), &config(), &alternating),
        Err(Error::InconsistentPartition { .. })
    ));
}

#[test]
fn test_dangling_trace_is_fatal() {
    let mut trace = trace();
    trace.ops[5].inputs.push(77);
    assert!(matches!(
        partition_model(&trace, &config(), &SequentialPartitioner),
        Err(Error::DanglingReference { value: 77, .. })
    ));
}

#[test]
fn test_three_node_chain_induces_one_partition_edge() {
    let mut graph = Graph::new();
    let ids: Vec<NodeId> = ["A", "B", "C"]
        .iter()
        .map(|s| graph.add_node(*s, NodeKind::RawOp, vec![vec![1]], NodeWeight::Unmeasured))
        .collect();
    graph.connect(ids[0], ids[1]);
    graph.connect(ids[1], ids[2]);
    let partitioning = Partitioning {
        n_parts: 2,
        parts: vec![0, 1, 1],
    };
    let schedule = post_process(&mut graph, &partitioning, &WeightPolicy::default()).unwrap();
    assert_eq!(schedule.edges, vec![(0, 1)]);
    assert_eq!(schedule.order, vec![0, 1]);
}

#[test]
fn test_weight_override_only_touches_named_layer() {
    let mut config = BuildConfig::new(1).with_profiled_layers(["Net/Linear[fc1]", "Net/Linear[fc2]"]);
    config.parameter_scopes = vec![
        "Net/Conv2d[conv]/Parameter[weight]".into(),
        "Net/Conv2d[conv]/Parameter[bias]".into(),
        "Net/Linear[fc1]/Parameter[weight]".into(),
        "Net/Linear[fc2]/Parameter[weight]".into(),
    ];
    let plain = modelsplit::build_graph(&trace(), &config).unwrap();
    config
        .overrides
        .insert("Net/Linear[fc1]", modelsplit::profile::LayerProfile::new(1.0, 1.0));
    let overridden = modelsplit::build_graph(&trace(), &config).unwrap();
    let changed: Vec<&str> = plain
        .nodes()
        .zip(overridden.nodes())
        .filter(|(a, b)| a.weight != b.weight)
        .map(|(_, b)| b.scope.as_str())
        .collect();
    assert_eq!(changed, vec!["Net/Linear[fc1]"]);
}

#[test]
fn test_absurd_timings_still_partition() {
    let mut config = config();
    for layer in ["Net/Linear[fc1]", "Net/Linear[fc2]"] {
        config
            .build
            .overrides
            .insert(layer, modelsplit::profile::LayerProfile::new(1e300, 1e300));
    }
    for devices in [1, 2] {
        config.partition.devices = devices;
        let model = partition_model(&trace(), &config, &SequentialPartitioner).unwrap();
        let heaviest = model.schedule.stages.iter().map(|s| s.solver_weight).max();
        assert_eq!(heaviest, Some(u64::MAX));
        assert_eq!(model.parts.len(), model.graph.len());
    }
}
