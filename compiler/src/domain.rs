// domain.rs — Clock Domain Validator
//
// Computes each clock domain's base-relative rate and rejects graphs whose
// structure, rate factors, block sizes, or boundary-crossing arcs violate the
// clock-domain model.
//
// Preconditions: `graph` is partition-labelled; `policy` carries the base
//                block size used to size channels.
// Postconditions: returns `ValidationResult` with per-domain rates and every
//                 diagnostic found. Structural errors suppress the rate and
//                 topology phases; dangling references stop immediately.
// Failure modes: structural (E01xx), rate (E02xx), and topology (E03xx)
//                violations produce `Diagnostic` entries.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ChannelPolicy;
use crate::diag::codes;
use crate::diag::{has_errors, DiagCode, Diagnostic, ErrorClass};
use crate::graph::{Arc, Graph, IoDirection, Node, NodeKind, PortRef};
use crate::id::{NodeId, PartitionId};
use crate::rate::{scale_along_chain, BlockFault, Rate};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ValidationResult {
    pub analysis: DomainAnalysis,
    pub diagnostics: Vec<Diagnostic>,
}

/// Per-domain rates computed by validation, consumed by insertion and
/// synthesis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainAnalysis {
    /// Declared local rate of each well-formed domain.
    pub local_rates: BTreeMap<NodeId, Rate>,
    /// Rate relative to the base domain, reduced.
    pub base_rates: BTreeMap<NodeId, Rate>,
    /// Enclosing domains from the outermost down to the key, inclusive.
    pub chains: BTreeMap<NodeId, Vec<NodeId>>,
}

impl DomainAnalysis {
    /// Base-relative rate of `domain`; the base domain is 1/1.
    pub fn base_rate(&self, domain: Option<NodeId>) -> Rate {
        domain
            .and_then(|d| self.base_rates.get(&d).copied())
            .unwrap_or(Rate::BASE)
    }

    /// Local rates from the outermost domain down to `domain`.
    pub fn local_chain(&self, domain: Option<NodeId>) -> Vec<Rate> {
        let Some(d) = domain else {
            return Vec::new();
        };
        self.chains
            .get(&d)
            .map(|chain| {
                chain
                    .iter()
                    .filter_map(|id| self.local_rates.get(id).copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Block size inside `domain` for `base_block` base-rate elements,
    /// integral at every level of the nesting chain.
    pub fn block_size(&self, domain: Option<NodeId>, base_block: u64) -> Result<u64, BlockFault> {
        scale_along_chain(base_block, &self.local_chain(domain))
    }
}

/// Why an arc must ride a Channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    /// Endpoints carry different partition labels.
    Partition,
    /// Endpoints sit in different clock domains with no boundary node between.
    Domain,
    /// One endpoint is an external I/O bundle member.
    ExternalIo,
}

/// How two clock domains are related in the containment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRelation {
    Same,
    ParentChild,
    Siblings,
    Distant,
}

// ── Shared queries ──────────────────────────────────────────────────────────

/// Classify an arc. `None` means the arc may stay a direct connection: it is
/// unconnected, already touches a Channel, or stays inside one partition and
/// one domain (or crosses only through a rate-change node).
pub fn classify_arc(graph: &Graph, arc: &Arc) -> Option<Crossing> {
    let dst = arc.dst_port()?;
    let src_node = graph.node(arc.src.node)?;
    let dst_node = graph.node(dst.node)?;
    if src_node.kind.is_channel() || dst_node.kind.is_channel() {
        return None;
    }
    if src_node.kind.is_external_io() || dst_node.kind.is_external_io() {
        return Some(Crossing::ExternalIo);
    }
    if src_node.partition != dst_node.partition {
        return Some(Crossing::Partition);
    }
    let touches_boundary = src_node.kind.is_rate_change() || dst_node.kind.is_rate_change();
    if !touches_boundary
        && graph.enclosing_domain(src_node.id) != graph.enclosing_domain(dst_node.id)
    {
        return Some(Crossing::Domain);
    }
    None
}

pub fn domain_relation(graph: &Graph, a: Option<NodeId>, b: Option<NodeId>) -> DomainRelation {
    if a == b {
        return DomainRelation::Same;
    }
    let parent = |d: Option<NodeId>| d.and_then(|id| graph.enclosing_domain(id));
    let a_parent = parent(a);
    let b_parent = parent(b);
    if (a.is_some() && a_parent == b) || (b.is_some() && b_parent == a) {
        return DomainRelation::ParentChild;
    }
    if a.is_some() && b.is_some() && a_parent == b_parent {
        return DomainRelation::Siblings;
    }
    DomainRelation::Distant
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Validate the clock-domain structure of `graph`.
pub fn validate(graph: &Graph, policy: &ChannelPolicy) -> ValidationResult {
    let mut ctx = ValidateCtx::new(graph, policy);
    if !ctx.check_references() {
        return ctx.build_result();
    }
    ctx.check_containment();
    ctx.check_fan_in();
    ctx.check_port_cardinality();
    ctx.check_channels();
    ctx.check_partitions();
    ctx.check_bundles();
    if has_errors(&ctx.diagnostics) {
        return ctx.build_result();
    }
    ctx.compute_rates();
    ctx.check_rate_changes();
    ctx.check_block_sizes();
    ctx.check_arc_periods();
    ctx.check_topology();
    ctx.build_result()
}

// ── Internal context ────────────────────────────────────────────────────────

struct ValidateCtx<'a> {
    graph: &'a Graph,
    policy: &'a ChannelPolicy,
    diagnostics: Vec<Diagnostic>,
    analysis: DomainAnalysis,
    /// Domains whose own or enclosing factors are malformed.
    broken: BTreeSet<NodeId>,
}

impl<'a> ValidateCtx<'a> {
    fn new(graph: &'a Graph, policy: &'a ChannelPolicy) -> Self {
        ValidateCtx {
            graph,
            policy,
            diagnostics: Vec::new(),
            analysis: DomainAnalysis::default(),
            broken: BTreeSet::new(),
        }
    }

    fn error(&mut self, class: ErrorClass, code: DiagCode, node: Option<NodeId>, message: String) {
        self.diagnostics
            .push(Diagnostic::error(class, node, message).with_code(code));
    }

    fn error_with_hint(
        &mut self,
        class: ErrorClass,
        code: DiagCode,
        node: Option<NodeId>,
        message: String,
        hint: String,
    ) {
        self.diagnostics.push(
            Diagnostic::error(class, node, message)
                .with_code(code)
                .with_hint(hint),
        );
    }

    fn build_result(self) -> ValidationResult {
        ValidationResult {
            analysis: self.analysis,
            diagnostics: self.diagnostics,
        }
    }

    fn label(&self, id: NodeId) -> String {
        self.graph.label(id)
    }

    /// One cause record per level of the domain nesting chain.
    fn with_domain_chain(&self, mut diag: Diagnostic, domain: Option<NodeId>) -> Diagnostic {
        diag = diag.with_cause("base domain, rate 1/1", None);
        for d in self.graph.domain_chain(domain) {
            let local = self.graph.domain_rate(d).unwrap_or(Rate::BASE);
            let msg = match self.analysis.base_rates.get(&d) {
                Some(base) => format!(
                    "clock domain {} local rate {}, base rate {}",
                    self.label(d),
                    local,
                    base
                ),
                None => format!("clock domain {} local rate {}", self.label(d), local),
            };
            diag = diag.with_cause(msg, Some(d));
        }
        diag
    }

    // ── Structural phase ────────────────────────────────────────────────

    /// Dangling node and port references. Returns false if any exist.
    fn check_references(&mut self) -> bool {
        let graph = self.graph;
        let before = self.diagnostics.len();

        for arc in graph.arcs() {
            self.check_port_ref(arc, arc.src, false);
            if let Some(dst) = arc.dst_port() {
                self.check_port_ref(arc, dst, true);
            }
        }

        for node in graph.nodes() {
            if let Some(p) = node.parent {
                if graph.node(p).is_none() {
                    self.error(
                        ErrorClass::Structural,
                        codes::E0101,
                        Some(node.id),
                        format!("{} names missing parent {}", self.label(node.id), p),
                    );
                }
            }
            for child in node.children() {
                if graph.node(child).is_none() {
                    self.error(
                        ErrorClass::Structural,
                        codes::E0101,
                        Some(node.id),
                        format!("{} lists missing child {}", self.label(node.id), child),
                    );
                }
            }
            if let NodeKind::Channel(spec) = &node.kind {
                if let Some(d) = spec.domain {
                    let is_domain = matches!(
                        graph.node(d).map(|n| &n.kind),
                        Some(NodeKind::ClockDomain { .. })
                    );
                    if !is_domain {
                        self.error(
                            ErrorClass::Structural,
                            codes::E0101,
                            Some(node.id),
                            format!(
                                "channel {} is anchored to {}, which is not a clock domain",
                                self.label(node.id),
                                d
                            ),
                        );
                    }
                }
            }
        }

        self.diagnostics.len() == before
    }

    fn check_port_ref(&mut self, arc: &Arc, port: PortRef, is_input: bool) {
        let side = if is_input { "destination" } else { "source" };
        let Some(node) = self.graph.node(port.node) else {
            self.error(
                ErrorClass::Structural,
                codes::E0101,
                None,
                format!("arc {} {} names missing node {}", arc.id, side, port.node),
            );
            return;
        };
        let count = if is_input {
            node.inputs.len()
        } else {
            node.outputs.len()
        };
        if port.port as usize >= count {
            let dir = if is_input { "input" } else { "output" };
            self.error(
                ErrorClass::Structural,
                codes::E0102,
                Some(node.id),
                format!(
                    "arc {} {} names {} port {} of {}, which has {} {} ports",
                    arc.id,
                    side,
                    dir,
                    port.port,
                    self.label(node.id),
                    count,
                    dir
                ),
            );
        }
    }

    fn check_containment(&mut self) {
        let graph = self.graph;
        let limit = graph.node_count();

        for node in graph.nodes() {
            // Containment cycles
            let mut cur = node.parent;
            let mut steps = 0;
            while let Some(p) = cur {
                steps += 1;
                if p == node.id || steps > limit {
                    self.error(
                        ErrorClass::Structural,
                        codes::E0111,
                        Some(node.id),
                        format!("{} is its own ancestor", self.label(node.id)),
                    );
                    break;
                }
                cur = graph.node(p).and_then(|n| n.parent);
            }

            // Child → parent agreement
            if let Some(p) = node.parent.and_then(|p| graph.node(p)) {
                self.check_membership(node, p);
            } else if node.kind.is_rate_change() {
                self.error_with_hint(
                    ErrorClass::Structural,
                    codes::E0106,
                    Some(node.id),
                    format!(
                        "{} {} is not owned by a clock domain",
                        node.kind.variant_name(),
                        self.label(node.id)
                    ),
                    "place rate-change nodes in the boundary list of the domain they enter or leave"
                        .into(),
                );
            }

            // Parent → child agreement
            for child in node.children() {
                let back = graph.node(child).and_then(|c| c.parent);
                if back != Some(node.id) {
                    self.error(
                        ErrorClass::Structural,
                        codes::E0104,
                        Some(child),
                        format!(
                            "{} lists {} as a child, but its parent is {}",
                            self.label(node.id),
                            self.label(child),
                            back.map(|b| b.to_string()).unwrap_or_else(|| "none".into())
                        ),
                    );
                }
            }
        }
    }

    fn check_membership(&mut self, node: &Node, parent: &Node) {
        let (listed_child, listed_boundary) = match &parent.kind {
            NodeKind::Subsystem { children } => (children.contains(&node.id), false),
            NodeKind::ClockDomain {
                children,
                boundaries,
                ..
            } => (children.contains(&node.id), boundaries.contains(&node.id)),
            _ => {
                self.error(
                    ErrorClass::Structural,
                    codes::E0104,
                    Some(node.id),
                    format!(
                        "parent of {} is {} {}, which cannot contain nodes",
                        self.label(node.id),
                        parent.kind.variant_name(),
                        self.label(parent.id)
                    ),
                );
                return;
            }
        };

        let in_domain = matches!(parent.kind, NodeKind::ClockDomain { .. });
        if node.kind.is_rate_change() {
            if !(in_domain && listed_boundary) {
                self.error_with_hint(
                    ErrorClass::Structural,
                    codes::E0106,
                    Some(node.id),
                    format!(
                        "{} {} is not in the boundary list of a clock domain",
                        node.kind.variant_name(),
                        self.label(node.id)
                    ),
                    "place rate-change nodes in the boundary list of the domain they enter or leave"
                        .into(),
                );
            }
        } else if listed_boundary || !listed_child {
            self.error(
                ErrorClass::Structural,
                codes::E0104,
                Some(node.id),
                format!(
                    "{} names {} as parent, but is not among its children",
                    self.label(node.id),
                    self.label(parent.id)
                ),
            );
        }
    }

    fn check_fan_in(&mut self) {
        let mut seen: BTreeMap<PortRef, usize> = BTreeMap::new();
        let graph = self.graph;
        for arc in graph.arcs() {
            if let Some(dst) = arc.dst_port() {
                *seen.entry(dst).or_default() += 1;
            }
        }
        for (port, count) in seen {
            if count > 1 {
                self.error(
                    ErrorClass::Structural,
                    codes::E0103,
                    Some(port.node),
                    format!(
                        "input port {} of {} has {} incoming arcs (at most one allowed)",
                        port.port,
                        self.label(port.node),
                        count
                    ),
                );
            }
        }
    }

    fn check_port_cardinality(&mut self) {
        let graph = self.graph;
        for node in graph.nodes() {
            let (n_in, n_out) = (node.inputs.len(), node.outputs.len());
            let expected: Option<&str> = match &node.kind {
                NodeKind::Subsystem { .. } | NodeKind::ClockDomain { .. } => {
                    (n_in != 0 || n_out != 0).then_some("no ports")
                }
                NodeKind::RateChangeInput(_) | NodeKind::Channel(_) => {
                    (n_in != 1 || n_out != 1).then_some("exactly 1 input and 1 output")
                }
                NodeKind::RateChangeOutput(_) => {
                    (n_in == 0 || n_out != 1).then_some("at least 1 input and exactly 1 output")
                }
                NodeKind::ExternalIo(ep) => match ep.direction {
                    IoDirection::In => (n_in != 0 || n_out != 1).then_some("0 inputs and 1 output"),
                    IoDirection::Out => {
                        (n_in != 1 || n_out != 0).then_some("1 input and 0 outputs")
                    }
                },
                NodeKind::Primitive { .. } => None,
            };
            if let Some(expected) = expected {
                self.error(
                    ErrorClass::Structural,
                    codes::E0105,
                    Some(node.id),
                    format!(
                        "{} {} has {} inputs and {} outputs; expected {}",
                        node.kind.variant_name(),
                        self.label(node.id),
                        n_in,
                        n_out,
                        expected
                    ),
                );
            }
        }
    }

    fn check_channels(&mut self) {
        let graph = self.graph;
        for node in graph.nodes() {
            if let NodeKind::Channel(spec) = &node.kind {
                if spec.block_size == 0 || spec.capacity < spec.block_size {
                    self.error_with_hint(
                        ErrorClass::Structural,
                        codes::E0107,
                        Some(node.id),
                        format!(
                            "channel {} has capacity {} and block size {}",
                            self.label(node.id),
                            spec.capacity,
                            spec.block_size
                        ),
                        "a channel must hold at least one non-empty block".into(),
                    );
                }
            }
        }
    }

    fn check_partitions(&mut self) {
        let graph = self.graph;
        for node in graph.nodes() {
            if !node.is_leaf() {
                continue;
            }
            match node.partition {
                None => self.error_with_hint(
                    ErrorClass::Structural,
                    codes::E0108,
                    Some(node.id),
                    format!("{} has no partition label", self.label(node.id)),
                    "run partition assignment before channel insertion".into(),
                ),
                Some(p) if node.kind.is_external_io() && !p.is_io() => self.error(
                    ErrorClass::Structural,
                    codes::E0109,
                    Some(node.id),
                    format!(
                        "external I/O node {} is in partition {}, not the I/O partition",
                        self.label(node.id),
                        p
                    ),
                ),
                Some(_) => {}
            }
        }
    }

    fn check_bundles(&mut self) {
        let mut members: BTreeMap<(String, u32), NodeId> = BTreeMap::new();
        let mut directions: BTreeMap<String, (IoDirection, NodeId)> = BTreeMap::new();
        let graph = self.graph;
        for node in graph.nodes() {
            let NodeKind::ExternalIo(ep) = &node.kind else {
                continue;
            };
            if let Some(first) = members.insert((ep.bundle.clone(), ep.member), node.id) {
                let msg = format!(
                    "bundle '{}' member {} is declared by both {} and {}",
                    ep.bundle,
                    ep.member,
                    self.label(first),
                    self.label(node.id)
                );
                self.diagnostics.push(
                    Diagnostic::error(ErrorClass::Structural, Some(node.id), msg)
                        .with_code(codes::E0110)
                        .with_related(first, "first declared here"),
                );
            }
            match directions.get(&ep.bundle) {
                Some(&(dir, first)) if dir != ep.direction => {
                    let msg = format!(
                        "bundle '{}' mixes input and output members ({} is {}, {} is {})",
                        ep.bundle,
                        self.label(first),
                        dir,
                        self.label(node.id),
                        ep.direction
                    );
                    self.diagnostics.push(
                        Diagnostic::error(ErrorClass::Structural, Some(node.id), msg)
                            .with_code(codes::E0112)
                            .with_related(first, "bundle direction fixed here"),
                    );
                }
                Some(_) => {}
                None => {
                    directions.insert(ep.bundle.clone(), (ep.direction, node.id));
                }
            }
        }
    }

    // ── Rate phase ──────────────────────────────────────────────────────

    fn compute_rates(&mut self) {
        let graph = self.graph;
        let domains: Vec<NodeId> = graph
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::ClockDomain { .. }))
            .map(|n| n.id)
            .collect();

        // Local factors
        for &d in &domains {
            let Some(rate) = graph.domain_rate(d) else {
                continue;
            };
            let fault = if rate.up == 0 || rate.down == 0 {
                Some((
                    codes::E0201,
                    format!("clock domain {} has a zero rate factor ({})", self.label(d), rate),
                    "rate factors must be positive integers".to_string(),
                ))
            } else if !rate.is_coprime() {
                Some((
                    codes::E0202,
                    format!(
                        "clock domain {} rate {} is not in lowest terms",
                        self.label(d),
                        rate
                    ),
                    format!("declare the rate as {}", rate.reduced()),
                ))
            } else if !rate.is_integral_hop() {
                Some((
                    codes::E0203,
                    format!(
                        "clock domain {} rate {} is neither a pure upsample nor a pure downsample",
                        self.label(d),
                        rate
                    ),
                    format!(
                        "nest an upsample-by-{} domain inside a downsample-by-{} domain",
                        rate.up, rate.down
                    ),
                ))
            } else {
                None
            };
            match fault {
                Some((code, msg, hint)) => {
                    self.broken.insert(d);
                    let diag = Diagnostic::error(ErrorClass::Rate, Some(d), msg)
                        .with_code(code)
                        .with_hint(hint);
                    let diag = self.with_domain_chain(diag, Some(d));
                    self.diagnostics.push(diag);
                }
                None => {
                    self.analysis.local_rates.insert(d, rate);
                }
            }
        }

        // Base-relative composition, outermost first
        for &d in &domains {
            let chain = graph.domain_chain(Some(d));
            if chain.iter().any(|c| self.broken.contains(c)) {
                self.broken.insert(d);
                continue;
            }
            let mut base = Rate::BASE;
            let mut overflow = false;
            for c in &chain {
                let local = self.analysis.local_rates.get(c).copied().unwrap_or(Rate::BASE);
                match base.compose(local) {
                    Some(r) => base = r,
                    None => {
                        overflow = true;
                        break;
                    }
                }
            }
            if overflow {
                self.broken.insert(d);
                let diag = Diagnostic::error(
                    ErrorClass::Rate,
                    Some(d),
                    format!(
                        "base-relative rate of clock domain {} overflows 32 bits",
                        self.label(d)
                    ),
                )
                .with_code(codes::E0207);
                let diag = self.with_domain_chain(diag, Some(d));
                self.diagnostics.push(diag);
                continue;
            }
            self.analysis.base_rates.insert(d, base);
            self.analysis.chains.insert(d, chain);
        }
    }

    fn check_rate_changes(&mut self) {
        let graph = self.graph;
        for node in graph.nodes() {
            let (change, entering) = match &node.kind {
                NodeKind::RateChangeInput(rc) => (*rc, true),
                NodeKind::RateChangeOutput(rc) => (*rc, false),
                _ => continue,
            };
            let Some(domain) = node.parent else {
                continue;
            };
            let Some(&local) = self.analysis.local_rates.get(&domain) else {
                continue;
            };
            // Entering applies the domain's rate; leaving undoes it.
            let expected = if entering { local } else { local.period() };
            if change.ratio == 0 || change.rate().reduced() != expected {
                let msg = format!(
                    "{} {} implements {} ({}), but clock domain {} requires {}",
                    node.kind.variant_name(),
                    self.label(node.id),
                    change,
                    change.rate(),
                    self.label(domain),
                    expected
                );
                let diag = Diagnostic::error(ErrorClass::Rate, Some(node.id), msg)
                    .with_code(codes::E0204);
                let diag = self.with_domain_chain(diag, Some(domain));
                self.diagnostics.push(diag);
            }
        }
    }

    /// Every domain that anchors a Channel, an external I/O endpoint, or the
    /// consumer side of a crossing arc must carry an integral block size at
    /// every level of its nesting chain.
    fn check_block_sizes(&mut self) {
        let graph = self.graph;
        let mut anchors: BTreeMap<NodeId, NodeId> = BTreeMap::new();

        for node in graph.nodes() {
            let anchor = match &node.kind {
                NodeKind::ExternalIo(_) => graph.enclosing_domain(node.id),
                NodeKind::Channel(spec) => {
                    self.check_channel_block(node.id, spec.block_size, spec.domain);
                    spec.domain
                }
                _ => None,
            };
            if let Some(d) = anchor {
                anchors.entry(d).or_insert(node.id);
            }
        }
        for arc in graph.arcs() {
            let Some(dst) = arc.dst_port() else {
                continue;
            };
            let via_channel = [arc.src.node, dst.node]
                .iter()
                .any(|&n| graph.node(n).is_some_and(|n| n.kind.is_channel()));
            if !via_channel && classify_arc(graph, arc).is_none() {
                continue;
            }
            if let Some(d) = graph.input_port_domain(dst) {
                anchors.entry(d).or_insert(dst.node);
            }
            // A channel at a rate-change boundary also fixes the block size
            // on the far side of that boundary.
            for end in [dst.node, arc.src.node] {
                let Some(node) = graph.node(end) else {
                    continue;
                };
                let inward = match node.kind {
                    NodeKind::RateChangeInput(_) => end == dst.node,
                    NodeKind::RateChangeOutput(_) => end == arc.src.node,
                    _ => false,
                };
                if let (true, Some(d)) = (inward, node.parent) {
                    anchors.entry(d).or_insert(end);
                }
            }
        }

        let base_block = self.policy.base_block_size as u64;
        for (domain, anchor) in anchors {
            if self.broken.contains(&domain) {
                continue;
            }
            let Err(fault) = self.analysis.block_size(Some(domain), base_block) else {
                continue;
            };
            let chain = self.graph.domain_chain(Some(domain));
            let at = chain.get(fault.hop).copied().unwrap_or(domain);
            let msg = format!(
                "block size {} base elements is {}/{} elements inside clock domain {}",
                base_block,
                fault.numer,
                fault.denom,
                self.label(at)
            );
            let diag = Diagnostic::error(ErrorClass::Rate, Some(domain), msg)
                .with_code(codes::E0205)
                .with_related(anchor, "channel endpoint anchored here")
                .with_hint(format!(
                    "use a base block size divisible by {}",
                    self.analysis.base_rate(Some(domain)).down
                ));
            let diag = self.with_domain_chain(diag, Some(domain));
            self.diagnostics.push(diag);
        }
    }

    /// An existing Channel's block, carried back up to the base domain, must
    /// stay integral at every boundary it straddles.
    fn check_channel_block(&mut self, channel: NodeId, block: u32, domain: Option<NodeId>) {
        if domain.is_some_and(|d| self.broken.contains(&d)) {
            return;
        }
        let upward: Vec<Rate> = self
            .analysis
            .local_chain(domain)
            .into_iter()
            .rev()
            .map(Rate::period)
            .collect();
        if let Err(fault) = scale_along_chain(block as u64, &upward) {
            let msg = format!(
                "channel {} block size {} is {}/{} elements one level out",
                self.label(channel),
                block,
                fault.numer,
                fault.denom
            );
            let diag = Diagnostic::error(ErrorClass::Rate, Some(channel), msg)
                .with_code(codes::E0205);
            let diag = self.with_domain_chain(diag, domain);
            self.diagnostics.push(diag);
        }
    }

    fn check_arc_periods(&mut self) {
        let graph = self.graph;
        for arc in graph.arcs() {
            let Some(declared) = arc.period else {
                continue;
            };
            let domain = graph.output_port_domain(arc.src);
            if domain.is_some_and(|d| self.broken.contains(&d)) {
                continue;
            }
            let expected = self.analysis.base_rate(domain).period();
            if declared.reduced() != expected {
                let msg = format!(
                    "arc {} declares sample period {}, but {} output {} runs at period {}",
                    arc.id,
                    declared,
                    self.label(arc.src.node),
                    arc.src.port,
                    expected
                );
                let diag = Diagnostic::error(ErrorClass::Rate, Some(arc.src.node), msg)
                    .with_code(codes::E0206);
                let diag = self.with_domain_chain(diag, domain);
                self.diagnostics.push(diag);
            }
        }
    }

    // ── Topology phase ──────────────────────────────────────────────────

    fn check_topology(&mut self) {
        let graph = self.graph;
        for arc in graph.arcs() {
            let Some(dst) = arc.dst_port() else {
                continue;
            };
            let (Some(src_node), Some(dst_node)) = (graph.node(arc.src.node), graph.node(dst.node))
            else {
                continue;
            };

            let src_domain = graph.output_port_domain(arc.src);
            let dst_domain = graph.input_port_domain(dst);

            if let NodeKind::RateChangeInput(_) = dst_node.kind {
                if src_domain != dst_domain {
                    self.topology_error(
                        codes::E0302,
                        dst_node.id,
                        format!(
                            "arc {} enters {} from {}, outside the parent of its clock domain",
                            arc.id,
                            self.label(dst_node.id),
                            self.label(src_node.id)
                        ),
                        src_domain,
                        dst_domain,
                    );
                }
                continue;
            }
            if let NodeKind::RateChangeOutput(_) = src_node.kind {
                if src_domain != dst_domain {
                    self.topology_error(
                        codes::E0303,
                        src_node.id,
                        format!(
                            "arc {} leaves {} for {}, outside the parent of its clock domain",
                            arc.id,
                            self.label(src_node.id),
                            self.label(dst_node.id)
                        ),
                        src_domain,
                        dst_domain,
                    );
                }
                continue;
            }
            if src_node.kind.is_rate_change() || dst_node.kind.is_rate_change() {
                continue;
            }

            let relation = domain_relation(graph, src_domain, dst_domain);
            if relation == DomainRelation::Distant {
                self.topology_error(
                    codes::E0301,
                    dst_node.id,
                    format!(
                        "arc {} from {} to {} skips more than one clock-domain level",
                        arc.id,
                        self.label(src_node.id),
                        self.label(dst_node.id)
                    ),
                    src_domain,
                    dst_domain,
                );
            }
        }
    }

    fn topology_error(
        &mut self,
        code: DiagCode,
        node: NodeId,
        message: String,
        src_domain: Option<NodeId>,
        dst_domain: Option<NodeId>,
    ) {
        let describe = |d: Option<NodeId>| match d {
            Some(id) => self.label(id),
            None => "the base domain".to_string(),
        };
        let diag = Diagnostic::error(ErrorClass::Topology, Some(node), message)
            .with_code(code)
            .with_cause(format!("source runs in {}", describe(src_domain)), src_domain)
            .with_cause(format!("destination runs in {}", describe(dst_domain)), dst_domain)
            .with_hint("route the arc through the rate-change boundary of each domain it crosses");
        self.diagnostics.push(diag);
    }
}

/// Partition labels carried by leaf nodes, in order.
pub fn partitions(graph: &Graph) -> BTreeSet<PartitionId> {
    graph
        .nodes()
        .filter(|n| n.is_leaf())
        .filter_map(|n| n.partition)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
