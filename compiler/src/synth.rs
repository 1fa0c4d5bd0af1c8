// synth.rs — Partition Thread Synthesizer (compile-time plan)
//
// Turns a channelized graph into one schedulable unit description per
// partition plus the External I/O Bridge's bundle list. Each unit lists its
// input and output Channels (ordered by Channel ID) and its internal nodes in
// topological order. A Channel whose two ends share a partition is local to
// that unit; one whose two ends are bundle members belongs to no unit.
//
// Preconditions: `graph` passed channel insertion (C1-C3 hold);
//                `analysis` is the validator's domain analysis.
// Postconditions: every leaf node belongs to exactly one unit (P1); every
//                 Channel has one producer and one consumer endpoint across
//                 units and bundles (P2).
// Failure modes: missing channel endpoints (E0501), unresolved bundle member
//                types (E0502), inconsistent bundle layout (E0503). Cycles
//                inside a partition produce warning W0500.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::diag::codes;
use crate::diag::{Diagnostic, ErrorClass};
use crate::domain::DomainAnalysis;
use crate::graph::{ElemType, Graph, IoDirection, NodeKind, PortRef};
use crate::id::{ArcId, NodeId, PartitionId};
use crate::rate::Rate;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SynthesisResult {
    pub plan: ProgramPlan,
    pub diagnostics: Vec<Diagnostic>,
}

/// Everything downstream code emission (or the in-process runtime) needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgramPlan {
    pub channels: Vec<ChannelDescriptor>,
    /// One unit per non-I/O partition, ordered by partition label.
    pub partitions: Vec<PartitionPlan>,
    pub io: Option<IoPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDescriptor {
    pub node: NodeId,
    pub name: String,
    pub capacity: u32,
    pub block_size: u32,
    pub elem: Option<ElemType>,
    pub domain: Option<NodeId>,
    /// Base-relative rate of `domain`.
    pub domain_rate: Rate,
    /// Output port writing into the channel.
    pub producer: PortRef,
    pub producer_partition: PartitionId,
    /// Input ports fed by the channel, all in `consumer_partition`.
    pub consumers: Vec<PortRef>,
    pub consumer_partition: PartitionId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPlan {
    pub partition: PartitionId,
    /// Channels read by this unit, by Channel ID.
    pub inputs: Vec<NodeId>,
    /// Channels written by this unit, by Channel ID.
    pub outputs: Vec<NodeId>,
    /// Channels this unit both writes and reads: clock-domain crossings
    /// inside the partition.
    pub locals: Vec<NodeId>,
    /// Internal nodes in topological order.
    pub nodes: Vec<NodeId>,
    /// Arcs between internal nodes.
    pub arcs: Vec<ArcId>,
}

impl PartitionPlan {
    fn empty(partition: PartitionId) -> Self {
        PartitionPlan {
            partition,
            inputs: Vec::new(),
            outputs: Vec::new(),
            locals: Vec::new(),
            nodes: Vec::new(),
            arcs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.locals.is_empty()
            && self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoPlan {
    pub bundles: Vec<BundlePlan>,
    /// Internal nodes of the I/O partition that are not bundle members.
    pub unit: Option<PartitionPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundlePlan {
    pub name: String,
    pub direction: IoDirection,
    /// Ordered by member index.
    pub members: Vec<BundleMember>,
    /// Bytes in one external frame (one block of every member).
    pub frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleMember {
    pub member: u32,
    pub node: NodeId,
    /// Channels written (input bundle) or read (output bundle).
    pub channels: Vec<NodeId>,
    pub elem: ElemType,
    pub block_size: u32,
    /// Offset of this member's block within the external frame.
    pub byte_offset: usize,
}

impl BundleMember {
    pub fn block_bytes(&self) -> usize {
        self.block_size as usize * self.elem.byte_width()
    }
}

impl ProgramPlan {
    pub fn channel(&self, id: NodeId) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|c| c.node == id)
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Build the per-partition plan for a channelized graph.
pub fn synthesize(graph: &Graph, analysis: &DomainAnalysis) -> SynthesisResult {
    let mut ctx = SynthCtx {
        graph,
        analysis,
        diagnostics: Vec::new(),
    };
    let channels = ctx.describe_channels();
    let bundles = ctx.build_bundles(&channels);
    let bundle_channels: BTreeSet<NodeId> = bundles
        .iter()
        .flat_map(|b| b.members.iter().flat_map(|m| m.channels.iter().copied()))
        .collect();

    let mut units = ctx.build_units(&channels, &bundle_channels);
    let io_unit = units.remove(&PartitionId::IO).filter(|u| !u.is_empty());
    let io = if bundles.is_empty() && io_unit.is_none() {
        None
    } else {
        Some(IoPlan {
            bundles,
            unit: io_unit,
        })
    };

    SynthesisResult {
        plan: ProgramPlan {
            channels,
            partitions: units.into_values().collect(),
            io,
        },
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct SynthCtx<'a> {
    graph: &'a Graph,
    analysis: &'a DomainAnalysis,
    diagnostics: Vec<Diagnostic>,
}

impl SynthCtx<'_> {
    fn error(&mut self, code: crate::diag::DiagCode, node: NodeId, message: String) {
        self.diagnostics
            .push(Diagnostic::error(ErrorClass::Plan, Some(node), message).with_code(code));
    }

    fn describe_channels(&mut self) -> Vec<ChannelDescriptor> {
        let graph = self.graph;
        let mut out = Vec::new();
        for node in graph.nodes() {
            let NodeKind::Channel(spec) = &node.kind else {
                continue;
            };
            let incoming: Vec<_> = graph.incoming(node.id).collect();
            let [writer] = incoming.as_slice() else {
                self.error(
                    codes::E0501,
                    node.id,
                    format!(
                        "channel {} has {} writers; expected exactly one",
                        graph.label(node.id),
                        incoming.len()
                    ),
                );
                continue;
            };
            let consumers: Vec<PortRef> = graph
                .outgoing(node.id)
                .filter_map(|a| a.dst_port())
                .collect();
            if consumers.is_empty() {
                self.error(
                    codes::E0501,
                    node.id,
                    format!("channel {} has no reader", graph.label(node.id)),
                );
                continue;
            }
            let (Some(producer_partition), Some(consumer_partition)) =
                (graph.partition_of(writer.src.node), node.partition)
            else {
                self.error(
                    codes::E0501,
                    node.id,
                    format!("channel {} endpoint has no partition", graph.label(node.id)),
                );
                continue;
            };
            out.push(ChannelDescriptor {
                node: node.id,
                name: node.name.clone(),
                capacity: spec.capacity,
                block_size: spec.block_size,
                elem: node.inputs.first().and_then(|p| p.ty.clone()),
                domain: spec.domain,
                domain_rate: self.analysis.base_rate(spec.domain),
                producer: writer.src,
                producer_partition,
                consumers,
                consumer_partition,
            });
        }
        out
    }

    fn build_bundles(&mut self, channels: &[ChannelDescriptor]) -> Vec<BundlePlan> {
        let graph = self.graph;
        let mut grouped: BTreeMap<String, (IoDirection, Vec<(u32, NodeId)>)> = BTreeMap::new();
        for node in graph.nodes() {
            if let NodeKind::ExternalIo(ep) = &node.kind {
                grouped
                    .entry(ep.bundle.clone())
                    .or_insert_with(|| (ep.direction, Vec::new()))
                    .1
                    .push((ep.member, node.id));
            }
        }

        let mut bundles = Vec::new();
        for (name, (direction, mut members)) in grouped {
            members.sort();
            let mut plan = BundlePlan {
                name,
                direction,
                members: Vec::new(),
                frame_bytes: 0,
            };
            let mut ok = true;
            for (member, node) in members {
                let attached: Vec<&ChannelDescriptor> = channels
                    .iter()
                    .filter(|c| match direction {
                        IoDirection::In => c.producer.node == node,
                        IoDirection::Out => c.consumers.iter().any(|p| p.node == node),
                    })
                    .collect();
                let Some(first) = attached.first() else {
                    self.error(
                        codes::E0501,
                        node,
                        format!(
                            "bundle '{}' member {} ({}) is not connected to a channel",
                            plan.name,
                            member,
                            graph.label(node)
                        ),
                    );
                    ok = false;
                    continue;
                };
                if attached.iter().any(|c| c.block_size != first.block_size) {
                    self.error(
                        codes::E0503,
                        node,
                        format!(
                            "bundle '{}' member {} feeds channels with different block sizes",
                            plan.name, member
                        ),
                    );
                    ok = false;
                    continue;
                }
                let Some(elem) = first.elem.clone() else {
                    self.error(
                        codes::E0502,
                        node,
                        format!(
                            "bundle '{}' member {} has no resolved element type",
                            plan.name, member
                        ),
                    );
                    ok = false;
                    continue;
                };
                let entry = BundleMember {
                    member,
                    node,
                    channels: attached.iter().map(|c| c.node).collect(),
                    elem,
                    block_size: first.block_size,
                    byte_offset: plan.frame_bytes,
                };
                plan.frame_bytes += entry.block_bytes();
                plan.members.push(entry);
            }
            if ok {
                bundles.push(plan);
            }
        }
        bundles
    }

    fn build_units(
        &mut self,
        channels: &[ChannelDescriptor],
        bundle_channels: &BTreeSet<NodeId>,
    ) -> BTreeMap<PartitionId, PartitionPlan> {
        let graph = self.graph;
        let mut units: BTreeMap<PartitionId, PartitionPlan> = BTreeMap::new();

        for node in graph.nodes() {
            if !node.is_leaf() || node.kind.is_channel() || node.kind.is_external_io() {
                continue;
            }
            if let Some(p) = node.partition {
                units
                    .entry(p)
                    .or_insert_with(|| PartitionPlan::empty(p))
                    .nodes
                    .push(node.id);
            }
        }

        let is_io_member =
            |n: NodeId| graph.node(n).is_some_and(|n| n.kind.is_external_io());
        for ch in channels {
            if bundle_channels.contains(&ch.node) {
                // Bundle side is owned by the bridge; the other side is not.
                let writer_is_io_member = is_io_member(ch.producer.node);
                let reader_is_io_member = ch.consumers.iter().all(|p| is_io_member(p.node));
                if writer_is_io_member && reader_is_io_member {
                    // Bundle to bundle: the bridge owns both ends.
                    continue;
                }
                if reader_is_io_member {
                    units
                        .entry(ch.producer_partition)
                        .or_insert_with(|| PartitionPlan::empty(ch.producer_partition))
                        .outputs
                        .push(ch.node);
                } else {
                    units
                        .entry(ch.consumer_partition)
                        .or_insert_with(|| PartitionPlan::empty(ch.consumer_partition))
                        .inputs
                        .push(ch.node);
                }
                continue;
            }
            if ch.producer_partition == ch.consumer_partition {
                units
                    .entry(ch.producer_partition)
                    .or_insert_with(|| PartitionPlan::empty(ch.producer_partition))
                    .locals
                    .push(ch.node);
                continue;
            }
            units
                .entry(ch.producer_partition)
                .or_insert_with(|| PartitionPlan::empty(ch.producer_partition))
                .outputs
                .push(ch.node);
            units
                .entry(ch.consumer_partition)
                .or_insert_with(|| PartitionPlan::empty(ch.consumer_partition))
                .inputs
                .push(ch.node);
        }

        for unit in units.values_mut() {
            unit.inputs.sort();
            unit.outputs.sort();
            unit.locals.sort();
            let (order, arcs, cyclic) = topo_order(graph, &unit.nodes);
            if !cyclic.is_empty() {
                let msg = format!(
                    "partition {} contains a cycle through {}; using ID order",
                    unit.partition,
                    graph.label(cyclic[0])
                );
                self.diagnostics.push(
                    Diagnostic::warning(ErrorClass::Plan, Some(cyclic[0]), msg)
                        .with_code(codes::W0500),
                );
            }
            unit.nodes = order;
            unit.arcs = arcs;
        }
        units
    }
}

/// Kahn's algorithm over the arcs internal to `nodes`, lowest ID first.
/// Nodes left on a cycle are appended in ID order and also returned.
fn topo_order(graph: &Graph, nodes: &[NodeId]) -> (Vec<NodeId>, Vec<ArcId>, Vec<NodeId>) {
    let members: BTreeSet<NodeId> = nodes.iter().copied().collect();
    let mut indegree: BTreeMap<NodeId, usize> = members.iter().map(|&n| (n, 0)).collect();
    let mut succ: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut arcs = Vec::new();

    for arc in graph.arcs() {
        let Some(dst) = arc.dst_node() else {
            continue;
        };
        if members.contains(&arc.src.node) && members.contains(&dst) {
            arcs.push(arc.id);
            succ.entry(arc.src.node).or_default().push(dst);
            *indegree.entry(dst).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<NodeId> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(n) = ready.pop_first() {
        order.push(n);
        for &s in succ.get(&n).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = indegree.get_mut(&s) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(s);
                }
            }
        }
    }

    let placed: BTreeSet<NodeId> = order.iter().copied().collect();
    let cyclic: Vec<NodeId> = members.difference(&placed).copied().collect();
    order.extend(cyclic.iter().copied());
    (order, arcs, cyclic)
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for plan postconditions (P1-P2).
#[derive(Debug, Clone)]
pub struct PlanCert {
    /// P1: Every internal leaf node is scheduled by exactly one unit.
    pub p1_each_node_in_one_unit: bool,
    /// P2: Every Channel has exactly one writing and one reading endpoint
    /// across units and bundles.
    pub p2_channel_endpoints_paired: bool,
}

impl crate::pass::StageCert for PlanCert {
    fn all_pass(&self) -> bool {
        self.p1_each_node_in_one_unit && self.p2_channel_endpoints_paired
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("P1_each_node_in_one_unit", self.p1_each_node_in_one_unit),
            ("P2_channel_endpoints_paired", self.p2_channel_endpoints_paired),
        ]
    }
}

fn all_units(plan: &ProgramPlan) -> impl Iterator<Item = &PartitionPlan> {
    plan.partitions
        .iter()
        .chain(plan.io.iter().filter_map(|io| io.unit.as_ref()))
}

pub fn verify_plan(graph: &Graph, plan: &ProgramPlan) -> PlanCert {
    PlanCert {
        p1_each_node_in_one_unit: verify_p1_nodes(graph, plan),
        p2_channel_endpoints_paired: verify_p2_channels(graph, plan),
    }
}

fn verify_p1_nodes(graph: &Graph, plan: &ProgramPlan) -> bool {
    let mut seen: BTreeMap<NodeId, usize> = BTreeMap::new();
    for unit in all_units(plan) {
        for &n in &unit.nodes {
            *seen.entry(n).or_default() += 1;
        }
    }
    let expected: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.is_leaf() && !n.kind.is_channel() && !n.kind.is_external_io())
        .map(|n| n.id)
        .collect();
    seen.len() == expected.len() && expected.iter().all(|n| seen.get(n) == Some(&1))
}

fn verify_p2_channels(graph: &Graph, plan: &ProgramPlan) -> bool {
    let mut writers: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut readers: BTreeMap<NodeId, usize> = BTreeMap::new();
    for unit in all_units(plan) {
        for &c in &unit.outputs {
            *writers.entry(c).or_default() += 1;
        }
        for &c in &unit.inputs {
            *readers.entry(c).or_default() += 1;
        }
        for &c in &unit.locals {
            *writers.entry(c).or_default() += 1;
            *readers.entry(c).or_default() += 1;
        }
    }
    if let Some(io) = &plan.io {
        for bundle in &io.bundles {
            let side = match bundle.direction {
                IoDirection::In => &mut writers,
                IoDirection::Out => &mut readers,
            };
            for m in &bundle.members {
                for &c in &m.channels {
                    *side.entry(c).or_default() += 1;
                }
            }
        }
    }
    graph
        .nodes()
        .filter(|n| n.kind.is_channel())
        .all(|n| writers.get(&n.id) == Some(&1) && readers.get(&n.id) == Some(&1))
}

// ── Display ─────────────────────────────────────────────────────────────────

fn id_list(ids: &[NodeId]) -> String {
    let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl fmt::Display for ProgramPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in &self.channels {
            let elem = ch
                .elem
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "?".into());
            let domain = ch
                .domain
                .map(|d| d.to_string())
                .unwrap_or_else(|| "base".into());
            writeln!(
                f,
                "channel {} '{}' cap={} block={} elem={} domain={} rate={} {} -> {}",
                ch.node,
                ch.name,
                ch.capacity,
                ch.block_size,
                elem,
                domain,
                ch.domain_rate,
                ch.producer_partition,
                ch.consumer_partition
            )?;
        }
        let io_unit = self.io.iter().filter_map(|io| io.unit.as_ref());
        for unit in self.partitions.iter().chain(io_unit) {
            write!(
                f,
                "unit {}: in {} out {}",
                unit.partition,
                id_list(&unit.inputs),
                id_list(&unit.outputs)
            )?;
            if !unit.locals.is_empty() {
                write!(f, " local {}", id_list(&unit.locals))?;
            }
            writeln!(f, " nodes {}", id_list(&unit.nodes))?;
        }
        if let Some(io) = &self.io {
            for b in &io.bundles {
                writeln!(
                    f,
                    "bundle '{}' {} frame={}B",
                    b.name, b.direction, b.frame_bytes
                )?;
                for m in &b.members {
                    writeln!(
                        f,
                        "  [{}] {} {} x{} @{} via {}",
                        m.member,
                        m.node,
                        m.elem,
                        m.block_size,
                        m.byte_offset,
                        id_list(&m.channels)
                    )?;
                }
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelPolicy;
    use crate::domain::validate;
    use crate::graph::IoEndpoint;
    use crate::insert::insert_channels;
    use crate::pass::StageCert;

    const P0: PartitionId = PartitionId(0);
    const P1: PartitionId = PartitionId(1);

    fn compile(graph: &mut Graph, policy: &ChannelPolicy) -> SynthesisResult {
        let v = validate(graph, policy);
        assert!(v.diagnostics.is_empty(), "{:?}", v.diagnostics);
        let ins = insert_channels(graph, &v.analysis, policy);
        assert!(ins.diagnostics.is_empty(), "{:?}", ins.diagnostics);
        synthesize(graph, &v.analysis)
    }

    fn endpoint(bundle: &str, direction: IoDirection, member: u32) -> IoEndpoint {
        IoEndpoint {
            bundle: bundle.into(),
            direction,
            member,
        }
    }

    /// adc[0] → a(p0) → b(p1) → dac[0]
    fn chain() -> Graph {
        let mut g = Graph::new();
        let adc = g.add_io(None, "adc", endpoint("adc", IoDirection::In, 0));
        let a = g.add_primitive(None, "a", 1, 1, P0);
        let b = g.add_primitive(None, "b", 1, 1, P1);
        let dac = g.add_io(None, "dac", endpoint("dac", IoDirection::Out, 0));
        g.set_output_type(PortRef::new(adc, 0), ElemType::f32());
        g.set_output_type(PortRef::new(a, 0), ElemType::f32());
        g.set_output_type(PortRef::new(b, 0), ElemType::f32());
        g.connect(PortRef::new(adc, 0), PortRef::new(a, 0));
        g.connect(PortRef::new(a, 0), PortRef::new(b, 0));
        g.connect(PortRef::new(b, 0), PortRef::new(dac, 0));
        g
    }

    #[test]
    fn chain_plan_pairs_every_channel() {
        let mut g = chain();
        let r = compile(&mut g, &ChannelPolicy::default().with_block_size(2));
        assert!(r.diagnostics.is_empty(), "{:?}", r.diagnostics);
        let plan = &r.plan;
        assert_eq!(plan.channels.len(), 3);
        assert_eq!(plan.partitions.len(), 2);
        let io = plan.io.as_ref().unwrap();
        assert!(io.unit.is_none());
        assert_eq!(io.bundles.len(), 2);
        assert_eq!(io.bundles[0].name, "adc");
        assert_eq!(io.bundles[0].frame_bytes, 8);
        assert!(verify_plan(&g, plan).all_pass());

        let p0 = &plan.partitions[0];
        assert_eq!(p0.partition, P0);
        assert_eq!(p0.inputs, io.bundles[0].members[0].channels);
        assert_eq!(p0.outputs.len(), 1);
        assert_eq!(plan.partitions[1].inputs, p0.outputs);
    }

    #[test]
    fn channels_sorted_and_described() {
        let mut g = chain();
        let r = compile(&mut g, &ChannelPolicy::default().with_block_size(2));
        let ids: Vec<NodeId> = r.plan.channels.iter().map(|c| c.node).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        for ch in &r.plan.channels {
            assert_eq!(ch.block_size, 2);
            assert_eq!(ch.capacity, 4);
            assert_eq!(ch.elem, Some(ElemType::f32()));
            assert_eq!(ch.domain_rate, Rate::BASE);
        }
    }

    #[test]
    fn internal_nodes_in_topological_order() {
        let mut g = Graph::new();
        let c = g.add_primitive(None, "c", 1, 0, P0);
        let b = g.add_primitive(None, "b", 1, 1, P0);
        let a = g.add_primitive(None, "a", 0, 1, P0);
        g.connect(PortRef::new(a, 0), PortRef::new(b, 0));
        g.connect(PortRef::new(b, 0), PortRef::new(c, 0));
        let r = compile(&mut g, &ChannelPolicy::default());
        assert_eq!(r.plan.partitions[0].nodes, vec![a, b, c]);
        assert_eq!(r.plan.partitions[0].arcs.len(), 2);
        assert!(r.plan.io.is_none());
    }

    #[test]
    fn cycle_falls_back_to_id_order_with_warning() {
        let mut g = Graph::new();
        let a = g.add_primitive(None, "a", 1, 1, P0);
        let b = g.add_primitive(None, "b", 1, 1, P0);
        g.connect(PortRef::new(a, 0), PortRef::new(b, 0));
        g.connect(PortRef::new(b, 0), PortRef::new(a, 0));
        let r = compile(&mut g, &ChannelPolicy::default());
        assert_eq!(r.plan.partitions[0].nodes, vec![a, b]);
        assert_eq!(r.diagnostics.len(), 1);
        assert_eq!(r.diagnostics[0].code, Some(codes::W0500));
    }

    #[test]
    fn io_partition_internal_nodes_form_io_unit() {
        let mut g = Graph::new();
        let adc = g.add_io(None, "adc", endpoint("adc", IoDirection::In, 0));
        let pre = g.add_primitive(None, "pre", 1, 1, PartitionId::IO);
        let sink = g.add_primitive(None, "sink", 1, 0, P0);
        g.set_output_type(PortRef::new(adc, 0), ElemType::i32());
        g.connect(PortRef::new(adc, 0), PortRef::new(pre, 0));
        g.connect(PortRef::new(pre, 0), PortRef::new(sink, 0));
        let r = compile(&mut g, &ChannelPolicy::default());
        let io = r.plan.io.as_ref().unwrap();
        let unit = io.unit.as_ref().unwrap();
        assert_eq!(unit.nodes, vec![pre]);
        assert_eq!(unit.inputs, io.bundles[0].members[0].channels);
        assert_eq!(unit.outputs.len(), 1);
        assert!(verify_plan(&g, &r.plan).all_pass());
    }

    #[test]
    fn untyped_bundle_member_is_error() {
        let mut g = Graph::new();
        let adc = g.add_io(None, "adc", endpoint("adc", IoDirection::In, 0));
        let a = g.add_primitive(None, "a", 1, 0, P0);
        g.connect(PortRef::new(adc, 0), PortRef::new(a, 0));
        let r = compile(&mut g, &ChannelPolicy::default());
        assert_eq!(r.diagnostics[0].code, Some(codes::E0502));
    }

    #[test]
    fn bundle_layout_packs_members_in_index_order() {
        let mut g = Graph::new();
        let hi = g.add_io(None, "hi", endpoint("rx", IoDirection::In, 1));
        let lo = g.add_io(None, "lo", endpoint("rx", IoDirection::In, 0));
        let a = g.add_primitive(None, "a", 2, 0, P0);
        g.set_output_type(PortRef::new(hi, 0), ElemType::f64());
        g.set_output_type(PortRef::new(lo, 0), ElemType::i32());
        g.connect(PortRef::new(hi, 0), PortRef::new(a, 1));
        g.connect(PortRef::new(lo, 0), PortRef::new(a, 0));
        let r = compile(&mut g, &ChannelPolicy::default().with_block_size(3));
        let b = &r.plan.io.as_ref().unwrap().bundles[0];
        let layout: Vec<(u32, usize)> = b.members.iter().map(|m| (m.member, m.byte_offset)).collect();
        assert_eq!(layout, vec![(0, 0), (1, 12)]);
        assert_eq!(b.frame_bytes, 12 + 24);
    }

    #[test]
    fn same_partition_domain_crossing_is_local() {
        // a(p0, base) → b(p0, inside a decimate-by-2 domain)
        let mut g = Graph::new();
        let dom = g.add_domain(None, "dec", Rate::downsample(2));
        let a = g.add_primitive(None, "a", 0, 1, P0);
        let b = g.add_primitive(Some(dom), "b", 1, 0, P0);
        g.connect(PortRef::new(a, 0), PortRef::new(b, 0));
        let r = compile(&mut g, &ChannelPolicy::default().with_block_size(4));
        assert!(r.diagnostics.is_empty(), "{:?}", r.diagnostics);

        let [ch] = r.plan.channels.as_slice() else {
            panic!("expected one channel, got {:?}", r.plan.channels);
        };
        assert_eq!(ch.block_size, 2);
        assert_eq!(ch.producer_partition, ch.consumer_partition);
        let unit = &r.plan.partitions[0];
        assert!(unit.inputs.is_empty());
        assert!(unit.outputs.is_empty());
        assert_eq!(unit.locals, vec![ch.node]);
        assert_eq!(unit.nodes, vec![a, b]);
        assert!(verify_plan(&g, &r.plan).all_pass());
        assert!(r.plan.to_string().contains(&format!("local [{}]", ch.node)));
    }

    #[test]
    fn bundle_to_bundle_channel_has_no_unit() {
        let mut g = Graph::new();
        let adc = g.add_io(None, "adc", endpoint("adc", IoDirection::In, 0));
        let dac = g.add_io(None, "dac", endpoint("dac", IoDirection::Out, 0));
        g.set_output_type(PortRef::new(adc, 0), ElemType::f32());
        g.connect(PortRef::new(adc, 0), PortRef::new(dac, 0));
        let r = compile(&mut g, &ChannelPolicy::default().with_block_size(2));
        assert!(r.diagnostics.is_empty(), "{:?}", r.diagnostics);

        assert_eq!(r.plan.channels.len(), 1);
        assert!(r.plan.partitions.is_empty());
        let io = r.plan.io.as_ref().unwrap();
        assert!(io.unit.is_none());
        assert_eq!(io.bundles.len(), 2);
        assert_eq!(io.bundles[0].members[0].channels, io.bundles[1].members[0].channels);
        let cert = verify_plan(&g, &r.plan);
        assert!(cert.all_pass(), "failed: {:?}", cert.failed());
    }

    #[test]
    fn plan_cert_flags_missing_unit() {
        let mut g = chain();
        let mut r = compile(&mut g, &ChannelPolicy::default());
        r.plan.partitions.pop();
        let cert = verify_plan(&g, &r.plan);
        assert!(!cert.p1_each_node_in_one_unit);
        assert!(!cert.p2_channel_endpoints_paired);
    }
}
