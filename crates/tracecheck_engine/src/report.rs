//! Result reporting.

use serde::{Deserialize, Serialize};
use tracecheck_core::{Violation, ViolationKind};

/// Outcome of a whole checking run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// No breach anywhere in the run
    pub passed: bool,
    /// Shards processed
    pub shard_count: usize,
    /// Records processed across all shards
    pub record_count: u64,
    /// Schedule-file entries compared
    pub schedule_entries_checked: usize,
    /// Every breach, shard breaches first in registration order
    pub violations: Vec<Violation>,
}

impl CheckReport {
    /// Create a report; it passes iff `violations` is empty
    #[must_use]
    pub fn new(
        shard_count: usize,
        record_count: u64,
        schedule_entries_checked: usize,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            passed: violations.is_empty(),
            shard_count,
            record_count,
            schedule_entries_checked,
            violations,
        }
    }

    /// The breach to surface when only one is shown
    #[must_use]
    pub fn first_violation(&self) -> Option<&Violation> {
        self.violations.first()
    }

    /// Breaches of one kind
    #[must_use]
    pub fn violations_of(&self, kind: ViolationKind) -> Vec<&Violation> {
        self.violations.iter().filter(|v| v.kind == kind).collect()
    }

    /// Human-readable result, one line per breach
    #[must_use]
    pub fn summary(&self) -> String {
        if self.passed {
            return "Trace invariant checks passed".to_string();
        }
        let mut lines: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        lines.push(format!(
            "{} invariant violation(s) in {} shard(s), {} record(s)",
            self.violations.len(),
            self.shard_count,
            self.record_count
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracecheck_core::ThreadId;

    #[test]
    fn test_passed_summary() {
        let report = CheckReport::new(2, 40, 3, Vec::new());
        assert!(report.passed);
        assert_eq!(report.summary(), "Trace invariant checks passed");
        assert!(report.first_violation().is_none());
    }

    #[test]
    fn test_failed_summary_lists_violations() {
        let violations = vec![
            Violation::new(
                ViolationKind::ControlFlow,
                ThreadId::new(3),
                9,
                "Non-explicit control flow has no marker",
            ),
            Violation::new(
                ViolationKind::Schedule,
                ThreadId::default(),
                0,
                "Serial schedule entry count does not match trace",
            ),
        ];
        let report = CheckReport::new(1, 9, 2, violations);
        assert!(!report.passed);
        let summary = report.summary();
        assert!(summary.starts_with("Trace invariant failure in T3 at ref # 9"));
        assert!(summary.ends_with("2 invariant violation(s) in 1 shard(s), 9 record(s)"));
        assert_eq!(report.violations_of(ViolationKind::Schedule).len(), 1);
        assert_eq!(report.first_violation().unwrap().thread, ThreadId::new(3));
    }

    #[test]
    fn test_report_serializes() {
        let report = CheckReport::new(1, 1, 0, Vec::new());
        let json = serde_json::to_string(&report).unwrap();
        let back: CheckReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
