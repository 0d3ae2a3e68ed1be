use crate::model::{ModelGraph, NodeKind};
use std::fmt::Write;

impl ModelGraph {
    /// Renders the graph to Graphviz dot: containment as clusters, links as
    /// undirected edges. Intended for debugging and test inspection.
    pub fn dot(&self) -> String {
        let mut out = String::from("graph {\n");
        self.dot_node(self.root(), 1, &mut out);
        for (id, _) in self.nodes() {
            for neighbor in self.linked(id) {
                if id < neighbor {
                    let _ = writeln!(
                        out,
                        "  \"{}\" -- \"{}\"",
                        self.full_name(id).escape_debug(),
                        self.full_name(neighbor).escape_debug()
                    );
                }
            }
        }
        out.push_str("}\n");
        out
    }

    fn dot_node(&self, id: crate::model::NodeId, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let data = self.node(id);
        let full = self.full_name(id);
        match &data.kind {
            NodeKind::Composite(_) => {
                let _ = writeln!(out, "{indent}subgraph \"cluster_{}\" {{", full.escape_debug());
                let _ = writeln!(out, "{indent}  label = \"{}\"", data.name.to_string().escape_debug());
                for &child in self.children(id) {
                    self.dot_node(child, depth + 1, out);
                }
                let _ = writeln!(out, "{indent}}}");
            }
            kind => {
                let shape = match kind {
                    NodeKind::Atomic => "box",
                    NodeKind::Port(_) => "circle",
                    NodeKind::Relation { .. } => "diamond",
                    _ => "plaintext",
                };
                let _ = writeln!(
                    out,
                    "{indent}\"{}\" [shape = {shape}, label = \"{}\"]",
                    full.escape_debug(),
                    data.name.to_string().escape_debug()
                );
                for &child in self.children(id) {
                    self.dot_node(child, depth + 1, out);
                }
            }
        }
    }
}

/// Collects dot renderings of a graph as it evolves, separated by `---`.
pub struct DotCollector {
    dot: String,
}

impl DotCollector {
    pub fn new() -> Self {
        DotCollector { dot: String::new() }
    }

    pub fn collect(&mut self, graph: &ModelGraph) {
        if !self.dot.is_empty() {
            self.dot.push_str("\n---\n");
        }
        self.dot.push_str(&graph.dot());
    }

    pub fn finalize(&self) -> String {
        self.dot.clone()
    }
}

impl Default for DotCollector {
    fn default() -> Self {
        DotCollector::new()
    }
}
