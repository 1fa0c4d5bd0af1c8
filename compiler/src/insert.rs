// insert.rs — Channel Insertion
//
// Rewrites every arc that crosses a partition or clock-domain boundary (or
// touches an external I/O bundle member) into `src → Channel → dst`. Each
// Channel is sized from the consumer side's clock domain and tagged with the
// consumer's partition so it is emitted alongside the thread that reads it.
//
// Preconditions: `graph` passed `domain::validate`; `analysis` is its result.
// Postconditions: no crossing arc remains without a Channel (C1); every
//                 Channel holds at least one block (C2); every Channel has one
//                 writer and only same-partition readers (C3). Running the
//                 pass again is a no-op.
// Failure modes: invalid policy (E0401) or an unrepresentable block size
//                (E0402) produce `Diagnostic` entries.
// Side effects: mutates `graph`; logs each inserted channel at debug level.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::ChannelPolicy;
use crate::diag::codes;
use crate::diag::{Diagnostic, ErrorClass};
use crate::domain::{classify_arc, Crossing, DomainAnalysis};
use crate::graph::{ChannelSpec, Graph, NodeKind, PortRef};
use crate::id::{ArcId, NodeId, PartitionId};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct InsertionResult {
    pub inserted: Vec<InsertedChannel>,
    pub diagnostics: Vec<Diagnostic>,
}

/// One Channel created by insertion and the original arcs it now carries.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedChannel {
    pub channel: NodeId,
    pub crossing: Crossing,
    pub arcs: Vec<ArcId>,
}

/// Fan-out sharing key: arcs agreeing on all four may share one Channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ShareKey {
    src: PortRef,
    partition: PartitionId,
    domain: Option<NodeId>,
    block: u32,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Insert a Channel on every boundary-crossing arc of `graph`.
pub fn insert_channels(
    graph: &mut Graph,
    analysis: &DomainAnalysis,
    policy: &ChannelPolicy,
) -> InsertionResult {
    let mut result = InsertionResult {
        inserted: Vec::new(),
        diagnostics: check_policy(policy),
    };
    if result.diagnostics.iter().any(Diagnostic::is_error) {
        return result;
    }

    let crossing: Vec<(ArcId, Crossing)> = {
        let view: &Graph = graph;
        view.arcs()
            .filter_map(|a| classify_arc(view, a).map(|c| (a.id, c)))
            .collect()
    };

    let mut shared: BTreeMap<ShareKey, usize> = BTreeMap::new();

    for (arc_id, kind) in crossing {
        let Some(arc) = graph.arc(arc_id).cloned() else {
            continue;
        };
        let Some(dst) = arc.dst_port() else {
            continue;
        };
        let Some(partition) = graph.partition_of(dst.node) else {
            result.diagnostics.push(
                Diagnostic::error(
                    ErrorClass::Plan,
                    Some(dst.node),
                    format!("consumer {} has no partition label", graph.label(dst.node)),
                )
                .with_code(codes::E0501),
            );
            continue;
        };

        let domain = graph.input_port_domain(dst);
        let block = match analysis
            .block_size(domain, policy.base_block_size as u64)
            .ok()
            .and_then(|b| u32::try_from(b).ok())
        {
            Some(b) => b,
            None => {
                result.diagnostics.push(
                    Diagnostic::error(
                        ErrorClass::Rate,
                        Some(dst.node),
                        format!(
                            "no integral 32-bit block size for the channel feeding {}",
                            graph.label(dst.node)
                        ),
                    )
                    .with_code(codes::E0402),
                );
                continue;
            }
        };
        let Some(capacity) = block.checked_mul(policy.capacity_multiplier) else {
            result.diagnostics.push(
                Diagnostic::error(
                    ErrorClass::Rate,
                    Some(dst.node),
                    format!(
                        "channel capacity {} x {} overflows",
                        block, policy.capacity_multiplier
                    ),
                )
                .with_code(codes::E0402),
            );
            continue;
        };

        let key = ShareKey {
            src: arc.src,
            partition,
            domain,
            block,
        };
        if policy.share_fanout {
            if let Some(&idx) = shared.get(&key) {
                let entry = &mut result.inserted[idx];
                graph.redirect_source(arc_id, PortRef::new(entry.channel, 0));
                entry.arcs.push(arc_id);
                debug!(arc = %arc_id, channel = %entry.channel, "shared fan-out channel");
                continue;
            }
        }

        let name = channel_name(graph, arc.src, dst);
        let ty = arc.ty.clone().or_else(|| graph.output_type(arc.src).cloned());
        let container = graph.input_port_container(dst);
        let spec = ChannelSpec {
            capacity,
            block_size: block,
            domain,
        };
        let channel = graph.add_channel(container, name, spec, partition, ty);
        graph.splice_arc(arc_id, channel);
        debug!(
            arc = %arc_id,
            channel = %channel,
            partition = %partition,
            block,
            capacity,
            ?kind,
            "inserted channel"
        );

        shared.insert(key, result.inserted.len());
        result.inserted.push(InsertedChannel {
            channel,
            crossing: kind,
            arcs: vec![arc_id],
        });
    }

    result
}

fn check_policy(policy: &ChannelPolicy) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    if policy.base_block_size == 0 {
        diags.push(
            Diagnostic::error(ErrorClass::Plan, None, "channel block size must be at least 1")
                .with_code(codes::E0401),
        );
    }
    match policy.capacity_multiplier {
        0 => diags.push(
            Diagnostic::error(
                ErrorClass::Plan,
                None,
                "channel capacity multiplier must be at least 1",
            )
            .with_code(codes::E0401),
        ),
        1 => diags.push(
            Diagnostic::warning(
                ErrorClass::Plan,
                None,
                "channel capacity equals block size; producer and consumer cannot overlap",
            )
            .with_code(codes::W0400)
            .with_hint("use a capacity multiplier of 2 or more"),
        ),
        _ => {}
    }
    diags
}

fn channel_name(graph: &Graph, src: PortRef, dst: PortRef) -> String {
    let name = |id: NodeId| {
        graph
            .node(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    };
    format!("{}.{}->{}.{}", name(src.node), src.port, name(dst.node), dst.port)
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for insertion postconditions (C1-C3).
#[derive(Debug, Clone)]
pub struct InsertionCert {
    /// C1: No crossing arc remains without a Channel.
    pub c1_no_direct_crossing: bool,
    /// C2: Every Channel's capacity holds at least one block.
    pub c2_capacity_holds_block: bool,
    /// C3: Every Channel has exactly one incoming arc, and every outgoing
    /// arc lands in the Channel's partition.
    pub c3_single_writer_local_reader: bool,
}

impl crate::pass::StageCert for InsertionCert {
    fn all_pass(&self) -> bool {
        self.c1_no_direct_crossing && self.c2_capacity_holds_block && self.c3_single_writer_local_reader
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("C1_no_direct_crossing", self.c1_no_direct_crossing),
            ("C2_capacity_holds_block", self.c2_capacity_holds_block),
            (
                "C3_single_writer_local_reader",
                self.c3_single_writer_local_reader,
            ),
        ]
    }
}

pub fn verify_insertion(graph: &Graph) -> InsertionCert {
    InsertionCert {
        c1_no_direct_crossing: graph.arcs().all(|a| classify_arc(graph, a).is_none()),
        c2_capacity_holds_block: verify_c2_capacity(graph),
        c3_single_writer_local_reader: verify_c3_endpoints(graph),
    }
}

fn verify_c2_capacity(graph: &Graph) -> bool {
    graph.nodes().all(|n| match &n.kind {
        NodeKind::Channel(spec) => spec.block_size > 0 && spec.capacity >= spec.block_size,
        _ => true,
    })
}

fn verify_c3_endpoints(graph: &Graph) -> bool {
    for node in graph.nodes() {
        if !node.kind.is_channel() {
            continue;
        }
        if graph.incoming(node.id).count() != 1 {
            return false;
        }
        for arc in graph.outgoing(node.id) {
            let Some(dst) = arc.dst_node() else {
                continue;
            };
            if graph.partition_of(dst) != node.partition {
                return false;
            }
        }
    }
    true
}

// ── Tests ───────────────────────────────────────────────────────────────────
