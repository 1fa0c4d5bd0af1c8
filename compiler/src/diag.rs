// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used by every compile-time pass.
// Diagnostics point at graph elements (nodes) rather than source spans.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0400`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable code table, grouped by the phase that emits them.
pub mod codes {
    use super::DiagCode;

    // Structural (E01xx)
    pub const E0101: DiagCode = DiagCode("E0101"); // dangling node reference
    pub const E0102: DiagCode = DiagCode("E0102"); // dangling port reference
    pub const E0103: DiagCode = DiagCode("E0103"); // input port fan-in > 1
    pub const E0104: DiagCode = DiagCode("E0104"); // parent/child disagreement
    pub const E0105: DiagCode = DiagCode("E0105"); // port cardinality
    pub const E0106: DiagCode = DiagCode("E0106"); // rate change outside a domain boundary list
    pub const E0107: DiagCode = DiagCode("E0107"); // channel capacity < block size
    pub const E0108: DiagCode = DiagCode("E0108"); // leaf without partition tag
    pub const E0109: DiagCode = DiagCode("E0109"); // external I/O outside the I/O partition
    pub const E0110: DiagCode = DiagCode("E0110"); // duplicate bundle member
    pub const E0111: DiagCode = DiagCode("E0111"); // containment cycle
    pub const E0112: DiagCode = DiagCode("E0112"); // bundle direction mismatch

    // Rate (E02xx)
    pub const E0201: DiagCode = DiagCode("E0201"); // zero rate factor
    pub const E0202: DiagCode = DiagCode("E0202"); // factors not coprime
    pub const E0203: DiagCode = DiagCode("E0203"); // neither factor is 1
    pub const E0204: DiagCode = DiagCode("E0204"); // rate change disagrees with domain
    pub const E0205: DiagCode = DiagCode("E0205"); // non-integer block size
    pub const E0206: DiagCode = DiagCode("E0206"); // arc period mismatch
    pub const E0207: DiagCode = DiagCode("E0207"); // composed rate overflow

    // Topology (E03xx)
    pub const E0301: DiagCode = DiagCode("E0301"); // crossing skips a nesting level
    pub const E0302: DiagCode = DiagCode("E0302"); // rate input fed from outside parent
    pub const E0303: DiagCode = DiagCode("E0303"); // rate output feeds outside parent

    // Insertion / policy (E04xx)
    pub const E0401: DiagCode = DiagCode("E0401"); // invalid channel policy
    pub const E0402: DiagCode = DiagCode("E0402"); // channel block size unrepresentable
    pub const W0400: DiagCode = DiagCode("W0400"); // capacity below double-buffering

    // Synthesis (E05xx / W05xx)
    pub const E0501: DiagCode = DiagCode("E0501"); // channel endpoint missing
    pub const E0502: DiagCode = DiagCode("E0502"); // element type unresolved
    pub const E0503: DiagCode = DiagCode("E0503"); // bundle frame layout invalid
    pub const W0500: DiagCode = DiagCode("W0500"); // intra-partition cycle

    // Verification (E06xx)
    pub const E0601: DiagCode = DiagCode("E0601"); // post-insertion obligation failed
    pub const E0602: DiagCode = DiagCode("E0602"); // plan obligation failed
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

/// Error taxonomy of the compile-time passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    Rate,
    Topology,
    Plan,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Structural => "structural",
            ErrorClass::Rate => "rate",
            ErrorClass::Topology => "topology",
            ErrorClass::Plan => "plan",
        };
        write!(f, "{s}")
    }
}

// ── Related node ─────────────────────────────────────────────────────────

/// A secondary graph element providing context for a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedNode {
    pub node: NodeId,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain (e.g. one level of domain nesting).
#[derive(Debug, Clone, PartialEq)]
pub struct CauseRecord {
    pub message: String,
    pub node: Option<NodeId>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub class: ErrorClass,
    /// Offending node, when the failure is attributable to one.
    pub subject: Option<NodeId>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedNode>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related nodes, or causes.
    pub fn new(
        level: DiagLevel,
        class: ErrorClass,
        subject: Option<NodeId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: None,
            level,
            class,
            subject,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    pub fn error(class: ErrorClass, subject: Option<NodeId>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, class, subject, message)
    }

    pub fn warning(class: ErrorClass, subject: Option<NodeId>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, class, subject, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, node: NodeId, label: impl Into<String>) -> Self {
        self.related.push(RelatedNode {
            node,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, node: Option<NodeId>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            node,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

/// True if any diagnostic in the slice is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        for cause in &self.cause_chain {
            write!(f, "\n  in: {}", cause.message)?;
        }
        for rel in &self.related {
            write!(f, "\n  note: {} ({})", rel.label, rel.node)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
