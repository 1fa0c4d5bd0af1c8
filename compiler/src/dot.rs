// dot.rs — Graphviz DOT output for partitioned dataflow graphs
//
// Transforms a Graph into DOT format suitable for rendering with `dot`.
// Clock domains and subsystems become clusters, nodes are filled with their
// partition's colour, and arcs touching a Channel are drawn bold red.
//
// Preconditions: none (invalid graphs render as far as they can).
// Postconditions: returns a DOT string; equal graphs give equal strings.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::graph::{ArcSink, Graph, IoDirection, Node, NodeKind};
use crate::id::{NodeId, PartitionId};

const PALETTE: [&str; 6] = [
    "#cfe2f3", "#d9ead3", "#fff2cc", "#f4cccc", "#d9d2e9", "#fce5cd",
];
const IO_COLOUR: &str = "#eeeeee";

/// Emit the graph as a Graphviz DOT string.
pub fn emit_dot(graph: &Graph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph ptc {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    let mut visited = BTreeSet::new();
    for node in graph.nodes().filter(|n| n.parent.is_none()) {
        write_node(&mut buf, graph, node, "    ", &mut visited);
    }
    // Nodes whose parent is missing still get drawn.
    for node in graph.nodes() {
        if !visited.contains(&node.id) {
            write_node(&mut buf, graph, node, "    ", &mut visited);
        }
    }

    for arc in graph.arcs() {
        let ArcSink::Port(dst) = arc.dst else {
            continue;
        };
        let mut attrs = Vec::new();
        if let Some(ty) = &arc.ty {
            attrs.push(format!("label=\"{ty}\""));
        }
        let via_channel = [arc.src.node, dst.node]
            .iter()
            .any(|&n| graph.node(n).is_some_and(|n| n.kind.is_channel()));
        if via_channel {
            attrs.push("style=bold".into());
            attrs.push("color=red".into());
        }
        let attrs = if attrs.is_empty() {
            String::new()
        } else {
            format!(" [{}]", attrs.join(", "))
        };
        writeln!(buf, "    n{} -> n{}{};", arc.src.node.0, dst.node.0, attrs).unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn write_node(
    buf: &mut String,
    graph: &Graph,
    node: &Node,
    indent: &str,
    visited: &mut BTreeSet<NodeId>,
) {
    if !visited.insert(node.id) {
        return;
    }
    let name = escape(&node.name);
    let (title, style, colour) = match &node.kind {
        NodeKind::ClockDomain { rate, .. } => (format!("domain: {name} ({rate})"), "rounded", "blue"),
        NodeKind::Subsystem { .. } => (format!("subsystem: {name}"), "dashed", "gray50"),
        _ => {
            writeln!(
                buf,
                "{indent}n{} [label=\"{}\", shape={}, style=filled, fillcolor=\"{}\"];",
                node.id.0,
                leaf_label(node, &name),
                leaf_shape(&node.kind),
                fill(node.partition)
            )
            .unwrap();
            return;
        }
    };
    writeln!(buf, "{indent}subgraph cluster_n{} {{", node.id.0).unwrap();
    writeln!(buf, "{indent}    label=\"{title}\";").unwrap();
    writeln!(buf, "{indent}    style={style};").unwrap();
    writeln!(buf, "{indent}    color={colour};").unwrap();
    let inner = format!("{indent}    ");
    let mut children = node.children();
    children.sort();
    for child in children {
        if let Some(c) = graph.node(child) {
            write_node(buf, graph, c, &inner, visited);
        }
    }
    writeln!(buf, "{indent}}}").unwrap();
}

fn leaf_label(node: &Node, name: &str) -> String {
    match &node.kind {
        NodeKind::RateChangeInput(rc) | NodeKind::RateChangeOutput(rc) => format!("{name}\\n{rc}"),
        NodeKind::Channel(spec) => {
            format!("{name}\\ncap={} block={}", spec.capacity, spec.block_size)
        }
        NodeKind::ExternalIo(ep) => format!("{name}\\n{}[{}]", escape(&ep.bundle), ep.member),
        _ => name.to_string(),
    }
}

fn leaf_shape(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::RateChangeInput(_) => "invtrapezium",
        NodeKind::RateChangeOutput(_) => "trapezium",
        NodeKind::Channel(_) => "cds",
        NodeKind::ExternalIo(ep) if ep.direction == IoDirection::In => "invhouse",
        NodeKind::ExternalIo(_) => "house",
        _ => "box",
    }
}

fn fill(partition: Option<PartitionId>) -> &'static str {
    match partition {
        Some(p) if p.is_io() => IO_COLOUR,
        Some(p) => PALETTE[p.0 as usize % PALETTE.len()],
        None => "white",
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelPolicy;
    use crate::domain::validate;
    use crate::graph::{ElemType, IoEndpoint, PortRef, RateChange};
    use crate::insert::insert_channels;
    use crate::rate::Rate;

    fn crossing_pair() -> Graph {
        let mut g = Graph::new();
        let src = g.add_primitive(None, "src", 0, 1, PartitionId(0));
        let sink = g.add_primitive(None, "sink", 1, 0, PartitionId(1));
        g.set_output_type(PortRef::new(src, 0), ElemType::f32());
        g.connect(PortRef::new(src, 0), PortRef::new(sink, 0));
        let policy = ChannelPolicy::default();
        let v = validate(&g, &policy);
        insert_channels(&mut g, &v.analysis, &policy);
        g
    }

    #[test]
    fn channel_pair_snapshot() {
        insta::assert_snapshot!(emit_dot(&crossing_pair()), @r##"
digraph ptc {
    rankdir=LR;
    node [fontname="Helvetica", fontsize=10];
    edge [fontname="Helvetica", fontsize=9];
    n0 [label="src", shape=box, style=filled, fillcolor="#cfe2f3"];
    n1 [label="sink", shape=box, style=filled, fillcolor="#d9ead3"];
    n2 [label="src.0->sink.0\ncap=2 block=1", shape=cds, style=filled, fillcolor="#d9ead3"];
    n0 -> n2 [label="f32", style=bold, color=red];
    n2 -> n1 [label="f32", style=bold, color=red];
}
"##);
    }

    #[test]
    fn domains_become_nested_clusters() {
        let mut g = Graph::new();
        let outer = g.add_domain(None, "outer", Rate::downsample(2));
        let inner = g.add_domain(Some(outer), "inner", Rate::upsample(3));
        g.add_rate_input(inner, "rin", RateChange::upsample(3), PartitionId(0));
        let dot = emit_dot(&g);
        assert!(dot.contains("subgraph cluster_n0 {"));
        assert!(dot.contains("        subgraph cluster_n1 {"));
        assert!(dot.contains("label=\"domain: inner (3/1)\";"));
        assert!(dot.contains("            n2 [label=\"rin\\nupsample-by-3\", shape=invtrapezium"));
    }

    #[test]
    fn io_nodes_use_io_colour() {
        let mut g = Graph::new();
        g.add_io(
            None,
            "mic",
            IoEndpoint {
                bundle: "audio".into(),
                direction: IoDirection::In,
                member: 1,
            },
        );
        let dot = emit_dot(&g);
        assert!(dot.contains("label=\"mic\\naudio[1]\", shape=invhouse"));
        assert!(dot.contains(IO_COLOUR));
    }

    #[test]
    fn names_are_escaped() {
        let mut g = Graph::new();
        g.add_primitive(None, "say \"hi\"", 0, 0, PartitionId(0));
        assert!(emit_dot(&g).contains("label=\"say \\\"hi\\\"\""));
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_dot(&crossing_pair()), emit_dot(&crossing_pair()));
    }
}
