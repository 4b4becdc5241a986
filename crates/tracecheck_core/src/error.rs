//! Core error types for tracecheck.
//!
//! Two families live here. [`CoreError`] covers failures of the machinery
//! itself (I/O, malformed input files, bad configuration). [`Violation`] is an
//! invariant breach found in a trace; it is a value the caller inspects, never
//! a panic.

use crate::id::ThreadId;
use serde::{Deserialize, Serialize};

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// A fixed-size record ended early
    #[error("Truncated record: needed {needed} bytes, found {available}")]
    Truncated {
        /// Bytes required for a full record
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Parse error in a textual input
    #[error("Parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// Parser message
        message: String,
    },

    /// I/O failure while reading an input
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid configuration
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// An invariant breach surfaced through a fallible API
    #[error(transparent)]
    Violation(#[from] Violation),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            line: err.line(),
            message: err.to_string(),
        }
    }
}

/// Category of a trace invariant breach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Engine-observed counts disagree with the stream metadata provider
    Ordinal,
    /// A marker appears where the grammar forbids it, or a required one is missing
    MarkerPlacement,
    /// An instruction is unreachable from its predecessor under every exemption
    ControlFlow,
    /// Signal return point or nesting mismatch
    KernelTransfer,
    /// Canonical schedule disagrees with the observed timeline
    Schedule,
    /// The branch-target decoder could not resolve a direct branch
    Decode,
}

impl ViolationKind {
    /// Short lowercase name, used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ordinal => "ordinal",
            Self::MarkerPlacement => "marker-placement",
            Self::ControlFlow => "control-flow",
            Self::KernelTransfer => "kernel-transfer",
            Self::Schedule => "schedule",
            Self::Decode => "decode",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trace invariant breach with shard and record attribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Trace invariant failure in {thread} at ref # {ordinal}: {message}")]
pub struct Violation {
    /// Taxonomy bucket
    pub kind: ViolationKind,
    /// Thread the failing shard is bound to
    pub thread: ThreadId,
    /// Record ordinal at the time of the failure
    pub ordinal: u64,
    /// Human-readable invariant name
    pub message: String,
}

impl Violation {
    /// Create a new violation
    #[must_use]
    pub fn new(
        kind: ViolationKind,
        thread: ThreadId,
        ordinal: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            thread,
            ordinal,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let v = Violation::new(
            ViolationKind::ControlFlow,
            ThreadId::new(42),
            17,
            "Non-explicit control flow has no marker",
        );
        assert_eq!(
            v.to_string(),
            "Trace invariant failure in T42 at ref # 17: Non-explicit control flow has no marker"
        );
    }

    #[test]
    fn test_truncated_error_display() {
        let err = CoreError::Truncated {
            needed: 32,
            available: 7,
        };
        let s = err.to_string();
        assert!(s.contains("32"));
        assert!(s.contains('7'));
    }

    #[test]
    fn test_violation_converts_into_core_error() {
        let v = Violation::new(ViolationKind::Schedule, ThreadId::default(), 0, "x");
        let err: CoreError = v.clone().into();
        assert_eq!(err, CoreError::Violation(v));
    }

    #[test]
    fn test_json_error_keeps_line() {
        let err = serde_json::from_str::<u64>("\n\nnope").unwrap_err();
        match CoreError::from(err) {
            CoreError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ViolationKind::Ordinal.to_string(), "ordinal");
        assert_eq!(ViolationKind::KernelTransfer.as_str(), "kernel-transfer");
    }
}
