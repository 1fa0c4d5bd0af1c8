// pipeline.rs — Compilation state and pass orchestration
//
// Holds the graph being compiled plus every pass artifact, and runs the
// minimal set of passes for a given terminal PassId.
//
// Preconditions: `CompilationState::new` received an imported graph and the
//                effective channel policy.
// Postconditions: all artifacts for required passes are populated, or
//                 has_error is set.
// Failure modes: any pass emitting error-level diagnostics; a failed
//                postcondition certificate (E0601, E0602).
// Side effects: rewrites `state.graph` during channel insertion; calls
//               on_pass_complete after each pass for immediate display.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ChannelPolicy;
use crate::diag::codes;
use crate::diag::{has_errors, DiagCode, Diagnostic, ErrorClass};
use crate::domain::DomainAnalysis;
use crate::graph::Graph;
use crate::insert::{InsertedChannel, InsertionCert};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::synth::{PlanCert, ProgramPlan};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and cache keys.
///
/// `graph_hash`: SHA-256 of the compact JSON of the imported graph.
/// `policy_fingerprint`: SHA-256 of the compact JSON of the channel policy.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub graph_hash: [u8; 32],
    pub policy_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn graph_hash_hex(&self) -> String {
        bytes_to_hex(&self.graph_hash)
    }

    pub fn policy_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.policy_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"graph_hash\": \"{}\",\n  \"policy_fingerprint\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            self.graph_hash_hex(),
            self.policy_fingerprint_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the imported graph and the effective policy.
///
/// Both inputs are hashed in compact JSON form. Node and arc order follow
/// their IDs, so equal graphs hash equally regardless of file formatting.
pub fn compute_provenance(
    graph: &Graph,
    policy: &ChannelPolicy,
) -> Result<Provenance, serde_json::Error> {
    let graph_json = serde_json::to_vec(&graph.to_document(None))?;
    let policy_json = serde_json::to_vec(policy)?;
    Ok(Provenance {
        graph_hash: sha256(&graph_json),
        policy_fingerprint: sha256(&policy_json),
        compiler_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds the graph, all compilation artifacts, and accumulated diagnostics.
pub struct CompilationState {
    pub graph: Graph,
    pub policy: ChannelPolicy,
    pub analysis: Option<DomainAnalysis>,
    pub inserted: Option<Vec<InsertedChannel>>,
    pub insertion_cert: Option<InsertionCert>,
    pub plan: Option<ProgramPlan>,
    pub plan_cert: Option<PlanCert>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(graph: Graph, policy: ChannelPolicy) -> Self {
        Self {
            graph,
            policy,
            analysis: None,
            inserted: None,
            insertion_cert: None,
            plan: None,
            plan_cert: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Per-pass bookkeeping ───────────────────────────────────────────────────

/// Per-pass post-processing: callback, accumulate, log, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_errors(&diags);
    let desc = descriptor(pass_id);
    debug!(
        pass = desc.name,
        outputs = ?desc.outputs,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        diagnostics = diags.len(),
        "pass complete"
    );
    state.diagnostics.extend(diags);
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Error diagnostic naming every failed obligation of `cert`, if any.
fn cert_failure(cert: &impl StageCert, what: &str, code: DiagCode) -> Option<Diagnostic> {
    if cert.all_pass() {
        return None;
    }
    Some(
        Diagnostic::error(
            ErrorClass::Plan,
            None,
            format!("{} verification failed: {}", what, cert.failed().join(", ")),
        )
        .with_code(code),
    )
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → verify certificate → on_pass_complete → error check.
///
/// Preconditions: `state.graph` and `state.policy` are set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are
///   populated, or `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics; cert failure.
/// Side effects: rewrites `state.graph`; calls `on_pass_complete` after each pass.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    if state.provenance.is_none() {
        state.provenance = compute_provenance(&state.graph, &state.policy).ok();
    }

    for pass_id in required_passes(terminal) {
        match pass_id {
            PassId::Validate => {
                let t = Instant::now();
                let result = crate::domain::validate(&state.graph, &state.policy);
                let elapsed = t.elapsed();
                state.analysis = Some(result.analysis);
                finish_pass(
                    state,
                    PassId::Validate,
                    result.diagnostics,
                    elapsed,
                    &mut on_pass_complete,
                )?;
            }
            PassId::InsertChannels => {
                let Some(analysis) = state.analysis.as_ref() else {
                    return Err(PipelineError {
                        failing_pass: PassId::InsertChannels,
                    });
                };
                let t = Instant::now();
                let result =
                    crate::insert::insert_channels(&mut state.graph, analysis, &state.policy);
                let cert = crate::insert::verify_insertion(&state.graph);
                let elapsed = t.elapsed();
                let mut diags = result.diagnostics;
                diags.extend(cert_failure(&cert, "insertion", codes::E0601));
                state.inserted = Some(result.inserted);
                state.insertion_cert = Some(cert);
                finish_pass(
                    state,
                    PassId::InsertChannels,
                    diags,
                    elapsed,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Synthesize => {
                let Some(analysis) = state.analysis.as_ref() else {
                    return Err(PipelineError {
                        failing_pass: PassId::Synthesize,
                    });
                };
                let t = Instant::now();
                let result = crate::synth::synthesize(&state.graph, analysis);
                let cert = crate::synth::verify_plan(&state.graph, &result.plan);
                let elapsed = t.elapsed();
                let mut diags = result.diagnostics;
                diags.extend(cert_failure(&cert, "plan", codes::E0602));
                state.plan = Some(result.plan);
                state.plan_cert = Some(cert);
                finish_pass(
                    state,
                    PassId::Synthesize,
                    diags,
                    elapsed,
                    &mut on_pass_complete,
                )?;
            }
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PortRef, RateChange};
    use crate::id::PartitionId;
    use crate::rate::Rate;

    fn decimator(factor: u32) -> Graph {
        let mut g = Graph::new();
        let src = g.add_primitive(None, "src", 0, 1, PartitionId(0));
        let dom = g.add_domain(None, "dec", Rate::downsample(factor));
        let rin = g.add_rate_input(dom, "rin", RateChange::downsample(factor), PartitionId(1));
        let inner = g.add_primitive(Some(dom), "inner", 1, 1, PartitionId(1));
        let rout = g.add_rate_output(dom, "rout", RateChange::upsample(factor), 1, PartitionId(1));
        let sink = g.add_primitive(None, "sink", 1, 0, PartitionId(0));
        g.connect(PortRef::new(src, 0), PortRef::new(rin, 0));
        g.connect(PortRef::new(rin, 0), PortRef::new(inner, 0));
        g.connect(PortRef::new(inner, 0), PortRef::new(rout, 0));
        g.connect(PortRef::new(rout, 0), PortRef::new(sink, 0));
        g
    }

    #[test]
    fn full_pipeline_populates_artifacts() {
        let mut state =
            CompilationState::new(decimator(4), ChannelPolicy::default().with_block_size(8));
        let mut seen = Vec::new();
        run_pipeline(&mut state, PassId::Synthesize, |p, _| seen.push(p)).unwrap();
        assert_eq!(
            seen,
            vec![PassId::Validate, PassId::InsertChannels, PassId::Synthesize]
        );
        assert!(!state.has_error);
        assert!(state.insertion_cert.as_ref().unwrap().all_pass());
        assert!(state.plan_cert.as_ref().unwrap().all_pass());
        assert_eq!(state.inserted.as_ref().unwrap().len(), 2);
        assert_eq!(state.plan.as_ref().unwrap().partitions.len(), 2);
    }

    #[test]
    fn validate_only_leaves_graph_untouched() {
        let graph = decimator(2);
        let arcs = graph.arc_count();
        let mut state = CompilationState::new(graph, ChannelPolicy::default().with_block_size(2));
        run_pipeline(&mut state, PassId::Validate, |_, _| {}).unwrap();
        assert!(state.analysis.is_some());
        assert!(state.inserted.is_none());
        assert_eq!(state.graph.arc_count(), arcs);
    }

    #[test]
    fn rate_error_stops_before_insertion() {
        let mut state =
            CompilationState::new(decimator(3), ChannelPolicy::default().with_block_size(4));
        let err = run_pipeline(&mut state, PassId::Synthesize, |_, _| {}).unwrap_err();
        assert_eq!(err.failing_pass, PassId::Validate);
        assert!(state.has_error);
        assert!(state.plan.is_none());
        assert!(state
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::E0205)));
    }

    #[test]
    fn provenance_is_stable_and_policy_sensitive() {
        let g = decimator(4);
        let a = compute_provenance(&g, &ChannelPolicy::default()).unwrap();
        let b = compute_provenance(&g, &ChannelPolicy::default()).unwrap();
        let c = compute_provenance(&g, &ChannelPolicy::default().with_block_size(8)).unwrap();
        assert_eq!(a.graph_hash_hex(), b.graph_hash_hex());
        assert_eq!(a.graph_hash_hex().len(), 64);
        assert_eq!(a.graph_hash, c.graph_hash);
        assert_ne!(a.policy_fingerprint, c.policy_fingerprint);
        assert!(a.to_json().contains("\"compiler_version\""));
    }
}
