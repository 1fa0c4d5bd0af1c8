// graph.rs — Hierarchical dataflow graph arena
//
// Nodes, ports, and arcs of a partition-labelled signal-processing graph.
// Containers (subsystems, clock domains) list their children by ID; every
// node stores its parent ID for lookup only. Arcs reference ports as
// (NodeId, index) pairs and never own nodes.
//
// Preconditions: none for construction; imported documents are checked for
//                duplicate IDs only (everything else is the validator's job).
// Postconditions: every mutation keeps arc endpoints pointing at live ports.
// Failure modes: JSON import errors → `ImportError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ChannelPolicy;
use crate::id::{ArcId, IdAllocator, NodeId, PartitionId};
use crate::rate::Rate;

// ── Element types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    Bool,
    Int,
    Float,
    Complex,
}

/// Resolved element type carried by a port or arc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElemType {
    pub kind: NumericKind,
    /// Bits per scalar component.
    pub bits: u16,
    #[serde(default)]
    pub signed: bool,
    /// Vector shape; empty for a scalar.
    #[serde(default)]
    pub dims: Vec<u32>,
}

impl ElemType {
    pub fn scalar(kind: NumericKind, bits: u16, signed: bool) -> Self {
        ElemType {
            kind,
            bits,
            signed,
            dims: Vec::new(),
        }
    }

    pub fn f32() -> Self {
        Self::scalar(NumericKind::Float, 32, true)
    }

    pub fn f64() -> Self {
        Self::scalar(NumericKind::Float, 64, true)
    }

    pub fn i32() -> Self {
        Self::scalar(NumericKind::Int, 32, true)
    }

    /// Bytes occupied by one element in an external frame.
    pub fn byte_width(&self) -> usize {
        let component = (self.bits as usize).div_ceil(8);
        let lanes = if self.kind == NumericKind::Complex { 2 } else { 1 };
        let count: usize = self.dims.iter().map(|&d| d as usize).product();
        component * lanes * count.max(1)
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            NumericKind::Bool => "bool".to_string(),
            NumericKind::Int if self.signed => format!("i{}", self.bits),
            NumericKind::Int => format!("u{}", self.bits),
            NumericKind::Float => format!("f{}", self.bits),
            NumericKind::Complex => format!("c{}", self.bits),
        };
        if self.dims.is_empty() {
            write!(f, "{base}")
        } else {
            let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
            write!(f, "{base}[{}]", dims.join(","))
        }
    }
}

// ── Ports and arcs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub ty: Option<ElemType>,
}

/// A port address: node plus index into that node's input or output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeId,
    pub port: u32,
}

impl PortRef {
    pub fn new(node: NodeId, port: u32) -> Self {
        PortRef { node, port }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcSink {
    Port(PortRef),
    /// Sentinel sink for an output with no consumers.
    Unconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arc {
    pub id: ArcId,
    pub src: PortRef,
    pub dst: ArcSink,
    #[serde(default)]
    pub ty: Option<ElemType>,
    /// Declared sample period in base-rate ticks per sample.
    #[serde(default)]
    pub period: Option<Rate>,
}

impl Arc {
    pub fn dst_port(&self) -> Option<PortRef> {
        match self.dst {
            ArcSink::Port(p) => Some(p),
            ArcSink::Unconnected => None,
        }
    }

    pub fn dst_node(&self) -> Option<NodeId> {
        self.dst_port().map(|p| p.node)
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.src.node == node || self.dst_node() == Some(node)
    }
}

// ── Node variants ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateChangeKind {
    Downsample,
    Upsample,
    /// Zero-order-hold upsample: each sample repeated `ratio` times.
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateChange {
    pub kind: RateChangeKind,
    pub ratio: u32,
}

impl RateChange {
    pub fn downsample(ratio: u32) -> Self {
        RateChange {
            kind: RateChangeKind::Downsample,
            ratio,
        }
    }

    pub fn upsample(ratio: u32) -> Self {
        RateChange {
            kind: RateChangeKind::Upsample,
            ratio,
        }
    }

    pub fn repeat(ratio: u32) -> Self {
        RateChange {
            kind: RateChangeKind::Repeat,
            ratio,
        }
    }

    /// The rate this boundary applies to samples crossing it.
    pub fn rate(self) -> Rate {
        match self.kind {
            RateChangeKind::Downsample => Rate::downsample(self.ratio),
            RateChangeKind::Upsample | RateChangeKind::Repeat => Rate::upsample(self.ratio),
        }
    }
}

impl fmt::Display for RateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            RateChangeKind::Downsample => "downsample",
            RateChangeKind::Upsample => "upsample",
            RateChangeKind::Repeat => "repeat",
        };
        write!(f, "{verb}-by-{}", self.ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub capacity: u32,
    pub block_size: u32,
    /// Domain governing the block size; `None` is the base domain.
    #[serde(default)]
    pub domain: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    In,
    Out,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::In => write!(f, "in"),
            IoDirection::Out => write!(f, "out"),
        }
    }
}

/// One member port of a named external I/O bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoEndpoint {
    pub bundle: String,
    pub direction: IoDirection,
    pub member: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Primitive {
        op: String,
    },
    Subsystem {
        #[serde(default)]
        children: Vec<NodeId>,
    },
    ClockDomain {
        rate: Rate,
        #[serde(default)]
        children: Vec<NodeId>,
        #[serde(default)]
        boundaries: Vec<NodeId>,
    },
    RateChangeInput(RateChange),
    RateChangeOutput(RateChange),
    Channel(ChannelSpec),
    ExternalIo(IoEndpoint),
}

impl NodeKind {
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Subsystem { .. } | NodeKind::ClockDomain { .. })
    }

    pub fn is_rate_change(&self) -> bool {
        matches!(
            self,
            NodeKind::RateChangeInput(_) | NodeKind::RateChangeOutput(_)
        )
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, NodeKind::Channel(_))
    }

    pub fn is_external_io(&self) -> bool {
        matches!(self, NodeKind::ExternalIo(_))
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            NodeKind::Primitive { .. } => "primitive",
            NodeKind::Subsystem { .. } => "subsystem",
            NodeKind::ClockDomain { .. } => "clock domain",
            NodeKind::RateChangeInput(_) => "rate-change input",
            NodeKind::RateChangeOutput(_) => "rate-change output",
            NodeKind::Channel(_) => "channel",
            NodeKind::ExternalIo(_) => "external I/O boundary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    #[serde(default)]
    pub partition: Option<PartitionId>,
    #[serde(default)]
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        !self.kind.is_container()
    }

    /// Direct children of a container (boundary nodes included).
    pub fn children(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::Subsystem { children } => children.clone(),
            NodeKind::ClockDomain {
                children,
                boundaries,
                ..
            } => children.iter().chain(boundaries.iter()).copied().collect(),
            _ => Vec::new(),
        }
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// The graph arena.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    arcs: BTreeMap<ArcId, Arc>,
    ids: IdAllocator,
}

/// Serialized form of a graph plus optional channel policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<Node>,
    pub arcs: Vec<Arc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ChannelPolicy>,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed graph document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),
    #[error("duplicate arc id {0}")]
    DuplicateArc(ArcId),
}

/// Walks of the parent chain stop after this many hops (guards cycles in
/// malformed imports).
const MAX_NESTING: usize = 4096;

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn arc(&self, id: ArcId) -> Option<&Arc> {
        self.arcs.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn arcs(&self) -> impl Iterator<Item = &Arc> {
        self.arcs.values()
    }

    pub fn arc_ids(&self) -> Vec<ArcId> {
        self.arcs.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }

    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &Arc> {
        self.arcs
            .values()
            .filter(move |a| a.dst_node() == Some(node))
    }

    pub fn outgoing(&self, node: NodeId) -> impl Iterator<Item = &Arc> {
        self.arcs.values().filter(move |a| a.src.node == node)
    }

    pub fn incoming_to(&self, port: PortRef) -> impl Iterator<Item = &Arc> {
        self.arcs
            .values()
            .filter(move |a| a.dst_port() == Some(port))
    }

    pub fn partition_of(&self, node: NodeId) -> Option<PartitionId> {
        self.nodes.get(&node).and_then(|n| n.partition)
    }

    /// `'name' (#id)` for diagnostics.
    pub fn label(&self, id: NodeId) -> String {
        match self.nodes.get(&id) {
            Some(n) => format!("'{}' ({})", n.name, id),
            None => format!("<missing> ({id})"),
        }
    }

    pub fn output_type(&self, port: PortRef) -> Option<&ElemType> {
        self.nodes
            .get(&port.node)?
            .outputs
            .get(port.port as usize)?
            .ty
            .as_ref()
    }

    // ── Hierarchy ───────────────────────────────────────────────────────

    /// Nearest `ClockDomain` strictly enclosing `node`; `None` is the base
    /// domain.
    pub fn enclosing_domain(&self, node: NodeId) -> Option<NodeId> {
        let mut cur = self.nodes.get(&node)?.parent;
        for _ in 0..MAX_NESTING {
            let id = cur?;
            let n = self.nodes.get(&id)?;
            if matches!(n.kind, NodeKind::ClockDomain { .. }) {
                return Some(id);
            }
            cur = n.parent;
        }
        None
    }

    /// Domains from the outermost down to `domain` inclusive. Empty for the
    /// base domain.
    pub fn domain_chain(&self, domain: Option<NodeId>) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = domain;
        while let Some(d) = cur {
            if chain.len() >= MAX_NESTING || chain.contains(&d) {
                break;
            }
            chain.push(d);
            cur = self.enclosing_domain(d);
        }
        chain.reverse();
        chain
    }

    /// Local rate of a `ClockDomain` node.
    pub fn domain_rate(&self, domain: NodeId) -> Option<Rate> {
        match self.nodes.get(&domain)?.kind {
            NodeKind::ClockDomain { rate, .. } => Some(rate),
            _ => None,
        }
    }

    /// Domain whose rate governs samples arriving at an input port.
    pub fn input_port_domain(&self, port: PortRef) -> Option<NodeId> {
        let own = self.enclosing_domain(port.node);
        match self.nodes.get(&port.node).map(|n| &n.kind) {
            Some(NodeKind::RateChangeInput(_)) => own.and_then(|d| self.enclosing_domain(d)),
            _ => own,
        }
    }

    /// Domain whose rate governs samples leaving an output port.
    pub fn output_port_domain(&self, port: PortRef) -> Option<NodeId> {
        let own = self.enclosing_domain(port.node);
        match self.nodes.get(&port.node).map(|n| &n.kind) {
            Some(NodeKind::RateChangeOutput(_)) => own.and_then(|d| self.enclosing_domain(d)),
            _ => own,
        }
    }

    /// Container that holds nodes running at the rate of `port`'s domain.
    pub fn input_port_container(&self, port: PortRef) -> Option<NodeId> {
        let node = self.nodes.get(&port.node)?;
        match node.kind {
            NodeKind::RateChangeInput(_) => self.nodes.get(&node.parent?)?.parent,
            _ => node.parent,
        }
    }

    // ── Construction ────────────────────────────────────────────────────

    /// Add a node and register it with its container. Rate-change nodes are
    /// registered as boundaries of their clock domain.
    pub fn add_node(
        &mut self,
        parent: Option<NodeId>,
        name: impl Into<String>,
        kind: NodeKind,
        n_inputs: usize,
        n_outputs: usize,
        partition: Option<PartitionId>,
    ) -> NodeId {
        let id = self.ids.alloc_node();
        let is_boundary = kind.is_rate_change();
        self.nodes.insert(
            id,
            Node {
                id,
                name: name.into(),
                kind,
                inputs: vec![Port::default(); n_inputs],
                outputs: vec![Port::default(); n_outputs],
                partition,
                parent,
            },
        );
        if let Some(p) = parent {
            if let Some(container) = self.nodes.get_mut(&p) {
                match &mut container.kind {
                    NodeKind::Subsystem { children } => children.push(id),
                    NodeKind::ClockDomain {
                        children,
                        boundaries,
                        ..
                    } => {
                        if is_boundary {
                            boundaries.push(id);
                        } else {
                            children.push(id);
                        }
                    }
                    _ => {}
                }
            }
        }
        id
    }

    pub fn add_primitive(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        n_inputs: usize,
        n_outputs: usize,
        partition: PartitionId,
    ) -> NodeId {
        let kind = NodeKind::Primitive {
            op: name.to_string(),
        };
        self.add_node(parent, name, kind, n_inputs, n_outputs, Some(partition))
    }

    pub fn add_subsystem(&mut self, parent: Option<NodeId>, name: &str) -> NodeId {
        let kind = NodeKind::Subsystem {
            children: Vec::new(),
        };
        self.add_node(parent, name, kind, 0, 0, None)
    }

    pub fn add_domain(&mut self, parent: Option<NodeId>, name: &str, rate: Rate) -> NodeId {
        let kind = NodeKind::ClockDomain {
            rate,
            children: Vec::new(),
            boundaries: Vec::new(),
        };
        self.add_node(parent, name, kind, 0, 0, None)
    }

    pub fn add_rate_input(
        &mut self,
        domain: NodeId,
        name: &str,
        change: RateChange,
        partition: PartitionId,
    ) -> NodeId {
        let kind = NodeKind::RateChangeInput(change);
        self.add_node(Some(domain), name, kind, 1, 1, Some(partition))
    }

    pub fn add_rate_output(
        &mut self,
        domain: NodeId,
        name: &str,
        change: RateChange,
        n_inputs: usize,
        partition: PartitionId,
    ) -> NodeId {
        let kind = NodeKind::RateChangeOutput(change);
        self.add_node(Some(domain), name, kind, n_inputs, 1, Some(partition))
    }

    /// Add an external I/O bundle member. Always tagged with the I/O
    /// partition.
    pub fn add_io(&mut self, parent: Option<NodeId>, name: &str, endpoint: IoEndpoint) -> NodeId {
        let (n_in, n_out) = match endpoint.direction {
            IoDirection::In => (0, 1),
            IoDirection::Out => (1, 0),
        };
        let kind = NodeKind::ExternalIo(endpoint);
        self.add_node(parent, name, kind, n_in, n_out, Some(PartitionId::IO))
    }

    pub(crate) fn add_channel(
        &mut self,
        parent: Option<NodeId>,
        name: String,
        spec: ChannelSpec,
        partition: PartitionId,
        ty: Option<ElemType>,
    ) -> NodeId {
        let id = self.add_node(parent, name, NodeKind::Channel(spec), 1, 1, Some(partition));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.inputs[0].ty = ty.clone();
            node.outputs[0].ty = ty;
        }
        id
    }

    pub fn set_output_type(&mut self, port: PortRef, ty: ElemType) {
        if let Some(p) = self
            .nodes
            .get_mut(&port.node)
            .and_then(|n| n.outputs.get_mut(port.port as usize))
        {
            p.ty = Some(ty);
        }
    }

    pub fn set_input_type(&mut self, port: PortRef, ty: ElemType) {
        if let Some(p) = self
            .nodes
            .get_mut(&port.node)
            .and_then(|n| n.inputs.get_mut(port.port as usize))
        {
            p.ty = Some(ty);
        }
    }

    /// Connect an output port to an input port. The arc inherits the source
    /// port's element type.
    pub fn connect(&mut self, src: PortRef, dst: PortRef) -> ArcId {
        self.push_arc(src, ArcSink::Port(dst))
    }

    /// Mark an output port as deliberately unconsumed.
    pub fn connect_unconnected(&mut self, src: PortRef) -> ArcId {
        self.push_arc(src, ArcSink::Unconnected)
    }

    fn push_arc(&mut self, src: PortRef, dst: ArcSink) -> ArcId {
        let id = self.ids.alloc_arc();
        let ty = self.output_type(src).cloned();
        self.arcs.insert(
            id,
            Arc {
                id,
                src,
                dst,
                ty,
                period: None,
            },
        );
        id
    }

    pub fn set_arc_period(&mut self, arc: ArcId, period: Rate) {
        if let Some(a) = self.arcs.get_mut(&arc) {
            a.period = Some(period);
        }
    }

    // ── Rewriting ───────────────────────────────────────────────────────

    pub fn remove_arc(&mut self, id: ArcId) -> Option<Arc> {
        self.arcs.remove(&id)
    }

    /// Remove a node, its subtree, and every arc touching any removed node,
    /// and unlink it from its container. Containment cycles are tolerated:
    /// each node is visited once.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let parent = node.parent;
        let mut doomed = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if !doomed.insert(n) {
                continue;
            }
            if let Some(node) = self.nodes.get(&n) {
                stack.extend(node.children());
            }
        }
        self.arcs.retain(|_, a| !doomed.iter().any(|&n| a.touches(n)));
        for n in &doomed {
            self.nodes.remove(n);
        }
        if let Some(container) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            match &mut container.kind {
                NodeKind::Subsystem { children } => children.retain(|c| *c != id),
                NodeKind::ClockDomain {
                    children,
                    boundaries,
                    ..
                } => {
                    children.retain(|c| *c != id);
                    boundaries.retain(|c| *c != id);
                }
                _ => {}
            }
        }
    }

    /// Reroute `arc` through the single-input/single-output node `via`:
    /// `src → dst` becomes `src → via → dst`. Returns the continuation arc.
    pub fn splice_arc(&mut self, arc: ArcId, via: NodeId) -> Option<ArcId> {
        let old = self.arcs.get(&arc)?.clone();
        let continuation = self.ids.alloc_arc();
        self.arcs.insert(
            continuation,
            Arc {
                id: continuation,
                src: PortRef::new(via, 0),
                dst: old.dst,
                ty: old.ty.clone(),
                period: old.period,
            },
        );
        if let Some(a) = self.arcs.get_mut(&arc) {
            a.dst = ArcSink::Port(PortRef::new(via, 0));
        }
        Some(continuation)
    }

    /// Move the source of `arc` to `new_src`, keeping its destination.
    pub fn redirect_source(&mut self, arc: ArcId, new_src: PortRef) {
        if let Some(a) = self.arcs.get_mut(&arc) {
            a.src = new_src;
        }
    }

    // ── Interchange ─────────────────────────────────────────────────────

    pub fn to_document(&self, policy: Option<ChannelPolicy>) -> GraphDocument {
        GraphDocument {
            nodes: self.nodes.values().cloned().collect(),
            arcs: self.arcs.values().cloned().collect(),
            policy,
        }
    }

    pub fn from_document(doc: GraphDocument) -> Result<(Graph, Option<ChannelPolicy>), ImportError> {
        let mut graph = Graph::new();
        for node in doc.nodes {
            let id = node.id;
            if graph.nodes.insert(id, node).is_some() {
                return Err(ImportError::DuplicateNode(id));
            }
        }
        for arc in doc.arcs {
            let id = arc.id;
            if graph.arcs.insert(id, arc).is_some() {
                return Err(ImportError::DuplicateArc(id));
            }
        }
        let max_node = graph.nodes.keys().next_back().copied();
        let max_arc = graph.arcs.keys().next_back().copied();
        graph.ids.reserve(max_node, max_arc);
        Ok((graph, doc.policy))
    }

    pub fn from_json(text: &str) -> Result<(Graph, Option<ChannelPolicy>), ImportError> {
        let doc: GraphDocument = serde_json::from_str(text)?;
        Self::from_document(doc)
    }

    pub fn to_json(&self, policy: Option<ChannelPolicy>) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_document(policy))
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Graph ({} nodes, {} arcs)",
            self.nodes.len(),
            self.arcs.len()
        )?;
        for node in self.nodes.values() {
            let part = node
                .partition
                .map(|p| format!(" @{p}"))
                .unwrap_or_default();
            let detail = match &node.kind {
                NodeKind::ClockDomain { rate, .. } => format!(" rate={rate}"),
                NodeKind::RateChangeInput(rc) | NodeKind::RateChangeOutput(rc) => {
                    format!(" {rc}")
                }
                NodeKind::Channel(spec) => {
                    format!(" cap={} block={}", spec.capacity, spec.block_size)
                }
                NodeKind::ExternalIo(ep) => {
                    format!(" {}[{}] {}", ep.bundle, ep.member, ep.direction)
                }
                _ => String::new(),
            };
            writeln!(
                f,
                "  {} {} '{}'{}{}",
                node.id,
                node.kind.variant_name(),
                node.name,
                detail,
                part
            )?;
        }
        for arc in self.arcs.values() {
            match arc.dst {
                ArcSink::Port(p) => writeln!(
                    f,
                    "  {}: {}.{} -> {}.{}",
                    arc.id, arc.src.node, arc.src.port, p.node, p.port
                )?,
                ArcSink::Unconnected => writeln!(
                    f,
                    "  {}: {}.{} -> (unconnected)",
                    arc.id, arc.src.node, arc.src.port
                )?,
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const P0: PartitionId = PartitionId(0);

    fn nested() -> (Graph, NodeId, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let src = g.add_primitive(None, "src", 0, 1, P0);
        let dom = g.add_domain(None, "dec4", Rate::downsample(4));
        let rin = g.add_rate_input(dom, "rin", RateChange::downsample(4), P0);
        let inner = g.add_primitive(Some(dom), "inner", 1, 1, P0);
        g.connect(PortRef::new(src, 0), PortRef::new(rin, 0));
        g.connect(PortRef::new(rin, 0), PortRef::new(inner, 0));
        (g, src, dom, rin, inner)
    }

    #[test]
    fn containers_record_children_and_boundaries() {
        let (g, _, dom, rin, inner) = nested();
        match &g.node(dom).unwrap().kind {
            NodeKind::ClockDomain {
                children,
                boundaries,
                ..
            } => {
                assert_eq!(children, &vec![inner]);
                assert_eq!(boundaries, &vec![rin]);
            }
            other => panic!("expected domain, got {other:?}"),
        }
    }

    #[test]
    fn enclosing_domain_and_chain() {
        let mut g = Graph::new();
        let outer = g.add_domain(None, "outer", Rate::downsample(2));
        let sub = g.add_subsystem(Some(outer), "sub");
        let inner = g.add_domain(Some(sub), "inner", Rate::upsample(3));
        let leaf = g.add_primitive(Some(inner), "leaf", 1, 1, P0);
        assert_eq!(g.enclosing_domain(leaf), Some(inner));
        assert_eq!(g.enclosing_domain(inner), Some(outer));
        assert_eq!(g.enclosing_domain(outer), None);
        assert_eq!(g.domain_chain(Some(inner)), vec![outer, inner]);
        assert!(g.domain_chain(None).is_empty());
    }

    #[test]
    fn rate_change_ports_run_at_parent_rate() {
        let (g, _, dom, rin, _) = nested();
        assert_eq!(g.input_port_domain(PortRef::new(rin, 0)), None);
        assert_eq!(g.output_port_domain(PortRef::new(rin, 0)), Some(dom));
        assert_eq!(g.input_port_container(PortRef::new(rin, 0)), None);
    }

    #[test]
    fn splice_keeps_endpoints_live() {
        let mut g = Graph::new();
        let a = g.add_primitive(None, "a", 0, 1, P0);
        let b = g.add_primitive(None, "b", 1, 0, PartitionId(1));
        let arc = g.connect(PortRef::new(a, 0), PortRef::new(b, 0));
        let spec = ChannelSpec {
            capacity: 2,
            block_size: 1,
            domain: None,
        };
        let ch = g.add_channel(None, "ch".into(), spec, PartitionId(1), None);
        let cont = g.splice_arc(arc, ch).unwrap();
        assert_eq!(g.arc(arc).unwrap().dst_node(), Some(ch));
        assert_eq!(g.arc(cont).unwrap().src.node, ch);
        assert_eq!(g.arc(cont).unwrap().dst_node(), Some(b));
    }

    #[test]
    fn remove_node_drops_incident_arcs_and_unlinks() {
        let (mut g, src, dom, rin, _) = nested();
        g.remove_node(rin);
        assert!(g.node(rin).is_none());
        assert_eq!(g.outgoing(src).count(), 0);
        match &g.node(dom).unwrap().kind {
            NodeKind::ClockDomain { boundaries, .. } => assert!(boundaries.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn remove_container_removes_subtree() {
        let (mut g, src, dom, _, inner) = nested();
        g.remove_node(dom);
        assert!(g.node(inner).is_none());
        assert_eq!(g.node_count(), 1);
        assert!(g.node(src).is_some());
        assert_eq!(g.arc_count(), 0);
    }

    #[test]
    fn remove_node_survives_containment_cycle() {
        let mut g = Graph::new();
        let outer = g.add_subsystem(None, "outer");
        let inner = g.add_subsystem(Some(outer), "inner");
        let leaf = g.add_primitive(Some(inner), "leaf", 0, 0, P0);
        // Close the loop: outer becomes a child of inner.
        if let NodeKind::Subsystem { children } = &mut g.node_mut(inner).unwrap().kind {
            children.push(outer);
        }
        g.node_mut(outer).unwrap().parent = Some(inner);

        g.remove_node(outer);
        assert!(g.node(outer).is_none());
        assert!(g.node(inner).is_none());
        assert!(g.node(leaf).is_none());
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn json_round_trip() {
        let (mut g, src, _, _, _) = nested();
        g.set_output_type(PortRef::new(src, 0), ElemType::f32());
        let text = g.to_json(Some(ChannelPolicy::default())).unwrap();
        let (back, policy) = Graph::from_json(&text).unwrap();
        assert_eq!(back.to_document(None).nodes, g.to_document(None).nodes);
        assert_eq!(back.arc_count(), g.arc_count());
        assert_eq!(policy, Some(ChannelPolicy::default()));
    }

    #[test]
    fn import_continues_id_allocation() {
        let (g, ..) = nested();
        let text = g.to_json(None).unwrap();
        let (mut back, _) = Graph::from_json(&text).unwrap();
        let fresh = back.add_primitive(None, "fresh", 0, 0, P0);
        assert_eq!(fresh, NodeId(g.node_count() as u32));
    }

    #[test]
    fn import_rejects_duplicate_ids() {
        let (g, ..) = nested();
        let mut doc = g.to_document(None);
        let dup = doc.nodes[0].clone();
        doc.nodes.push(dup);
        assert!(matches!(
            Graph::from_document(doc),
            Err(ImportError::DuplicateNode(NodeId(0)))
        ));
    }

    #[test]
    fn elem_type_widths() {
        assert_eq!(ElemType::f32().byte_width(), 4);
        let mut v = ElemType::scalar(NumericKind::Complex, 32, true);
        v.dims = vec![4];
        assert_eq!(v.byte_width(), 32);
        assert_eq!(v.to_string(), "c32[4]");
    }
}
