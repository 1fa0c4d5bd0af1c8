// pass.rs — Pass descriptor module: metadata, dependency resolution, certificates
//
// Declares the compiler's semantic passes, their dependency edges, and the
// artifacts they produce. Used by the pipeline runner to compute minimal pass
// subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (graph import is handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    InsertChannels,
    Synthesize,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Analysis,      // DomainAnalysis
    Channelized,   // Graph (rewritten in place)
    InsertionCert, // InsertionCert
    Plan,          // ProgramPlan
    PlanCert,      // PlanCert
}

// ── Postcondition certificates ─────────────────────────────────────────────

/// Machine-checkable evidence that a pass met its postconditions.
pub trait StageCert {
    /// True iff every obligation holds.
    fn all_pass(&self) -> bool;

    /// Named obligations with their outcome, in declaration order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::Analysis],
        },
        PassId::InsertChannels => PassDescriptor {
            name: "insert_channels",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Channelized, ArtifactId::InsertionCert],
        },
        PassId::Synthesize => PassDescriptor {
            name: "synthesize",
            inputs: &[PassId::InsertChannels],
            outputs: &[ArtifactId::Plan, ArtifactId::PlanCert],
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 3] = [PassId::Validate, PassId::InsertChannels, PassId::Synthesize];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
