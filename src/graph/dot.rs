//! Graphviz DOT rendering of a graph, coloured by partition.

use std::fmt;

use itertools::Itertools;

use crate::graph::{Graph, Node, NodeKind, NodeWeight};

const PARTITION_COLORS: [&str; 8] = [
    "grey", "green", "red", "yellow", "orange", "brown", "purple", "pink",
];
const UNASSIGNED_COLOR: &str = "white";

#[derive(Debug, Clone, Copy)]
pub struct DotOptions {
    pub show_parameters: bool,
    pub show_weights: bool,
}

impl Default for DotOptions {
    fn default() -> Self {
        DotOptions {
            show_parameters: false,
            show_weights: true,
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn label(node: &Node, options: &DotOptions) -> String {
    let mut label = escape(&node.scope);
    if options.show_weights && node.weight != NodeWeight::Unmeasured {
        label.push_str(&format!("\\n{}", node.weight));
    }
    let shapes = node
        .output_shape
        .iter()
        .map(|s| format!("({})", s.iter().join(", ")))
        .join(", ");
    label.push_str(&format!("\\noutput_shape [{}]", shapes));
    label
}

/// Writes `graph` as DOT source text into `out`.
pub fn write_dot<W: fmt::Write>(graph: &Graph, options: &DotOptions, out: &mut W) -> fmt::Result {
    let hidden = |node: &Node| node.kind == NodeKind::ParameterOrBuffer && !options.show_parameters;
    writeln!(out, "digraph {{")?;
    writeln!(out, "  graph [concentrate=true, rankdir=TB, bgcolor=\"#FFFFFF\", fontname=\"Times\"];")?;
    writeln!(
        out,
        "  node [shape=box, style=filled, fontsize=10, fontname=\"Times\", color=\"#000000\"];"
    )?;
    for node in graph.nodes().filter(|n| !hidden(n)) {
        let color = node
            .partition()
            .map_or(UNASSIGNED_COLOR, |p| PARTITION_COLORS[p % PARTITION_COLORS.len()]);
        writeln!(
            out,
            "  {} [label=\"{}\", fillcolor={}];",
            node.index(),
            label(node, options),
            color
        )?;
    }
    for node in graph.nodes().filter(|n| !hidden(n)) {
        for pred in node.in_edges().iter().filter_map(|&id| graph.node(id)) {
            if !hidden(pred) {
                writeln!(out, "  {} -> {};", pred.index(), node.index())?;
            }
        }
    }
    writeln!(out, "}}")
}

/// Renders `graph` as DOT source text.
pub fn to_dot(graph: &Graph, options: &DotOptions) -> String {
    let mut dot = String::new();
    write_dot(graph, options, &mut dot).expect("writing to a String cannot fail");
    dot
}

impl Graph {
    pub fn to_dot(&self, options: &DotOptions) -> String {
        to_dot(self, options)
    }
}
