//! Schedule reconciliation.
//!
//! Once every shard is finished, their cpu-id timelines are merged and
//! compared against the canonical schedule files written alongside the trace.

use crate::shard::ShardTimeline;
use indexmap::IndexMap;
use std::io::Read;
use tracecheck_core::{schedule, CpuId, ScheduleEntry, ThreadId, Violation, ViolationKind};
use tracecheck_log::ScheduleDecoder;

/// All shard timelines merged and ordered by timestamp
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedSchedule {
    /// Every entry of every shard
    pub serial: Vec<ScheduleEntry>,
    /// Entries per cpu
    pub per_cpu: IndexMap<CpuId, Vec<ScheduleEntry>>,
}

impl MergedSchedule {
    /// Merge timelines in the given shard order
    ///
    /// Sorting is stable, so entries with equal timestamps keep shard order.
    #[must_use]
    pub fn merge<'a>(timelines: impl IntoIterator<Item = &'a ShardTimeline>) -> Self {
        let mut merged = Self::default();
        for timeline in timelines {
            merged.serial.extend_from_slice(&timeline.sched);
            for (cpu, entries) in &timeline.cpu_sched {
                merged
                    .per_cpu
                    .entry(*cpu)
                    .or_default()
                    .extend_from_slice(entries);
            }
        }
        schedule::sort_by_timestamp(&mut merged.serial);
        for entries in merged.per_cpu.values_mut() {
            schedule::sort_by_timestamp(entries);
        }
        merged
    }

    /// Total entries observed
    #[must_use]
    pub fn len(&self) -> usize {
        self.serial.len()
    }

    /// No schedule data in the trace
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.serial.is_empty()
    }
}

/// Result of comparing one schedule file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Entries read from the file
    pub compared: usize,
    /// Every mismatch found
    pub violations: Vec<Violation>,
}

impl ReconcileOutcome {
    /// File agreed with the trace
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn report(&mut self, thread: ThreadId, ordinal: u64, message: impl Into<String>) {
        let violation = Violation::new(ViolationKind::Schedule, thread, ordinal, message);
        tracing::warn!("{violation}");
        self.violations.push(violation);
    }
}

/// Compares canonical schedule files with a merged timeline
#[derive(Debug, Clone, Copy)]
pub struct ScheduleReconciler<'a> {
    merged: &'a MergedSchedule,
}

impl<'a> ScheduleReconciler<'a> {
    /// Create a reconciler for `merged`
    #[must_use]
    pub fn new(merged: &'a MergedSchedule) -> Self {
        Self { merged }
    }

    /// Check a file holding the whole schedule in timestamp order
    pub fn check_serial<R: Read>(&self, source: R) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for (index, next) in ScheduleDecoder::new(source).enumerate() {
            let next = match next {
                Ok(entry) => entry,
                Err(err) => {
                    outcome.report(
                        ThreadId::default(),
                        index as u64,
                        format!("Serial schedule file unreadable: {err}"),
                    );
                    break;
                }
            };
            if self.merged.serial.get(index) != Some(&next) {
                tracing::debug!(index, entry = %next, "serial schedule mismatch");
                outcome.report(
                    ThreadId::default(),
                    index as u64,
                    "Serial schedule entry does not match trace",
                );
            }
            outcome.compared += 1;
        }
        if outcome.compared != self.merged.serial.len() {
            outcome.report(
                ThreadId::default(),
                outcome.compared as u64,
                "Serial schedule entry count does not match trace",
            );
        }
        tracing::debug!(
            compared = outcome.compared,
            clean = outcome.is_clean(),
            "serial schedule checked"
        );
        outcome
    }

    /// Check a file holding each cpu's schedule, cpus concatenated
    ///
    /// Entries are attributed to the thread and instruction count they carry.
    pub fn check_cpu<R: Read>(&self, source: R) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut positions: IndexMap<CpuId, usize> =
            self.merged.per_cpu.keys().map(|cpu| (*cpu, 0)).collect();
        for next in ScheduleDecoder::new(source) {
            let next = match next {
                Ok(entry) => entry,
                Err(err) => {
                    outcome.report(
                        ThreadId::default(),
                        outcome.compared as u64,
                        format!("Cpu schedule file unreadable: {err}"),
                    );
                    break;
                }
            };
            let position = positions.entry(next.cpu).or_insert(0);
            let expected = self
                .merged
                .per_cpu
                .get(&next.cpu)
                .and_then(|entries| entries.get(*position));
            if expected != Some(&next) {
                tracing::debug!(entry = %next, position = *position, "cpu schedule mismatch");
                outcome.report(
                    next.thread,
                    next.instr_count,
                    "Cpu schedule entry does not match trace",
                );
            }
            *position += 1;
            outcome.compared += 1;
        }
        for (cpu, entries) in &self.merged.per_cpu {
            let seen = positions.get(cpu).copied().unwrap_or(0);
            if seen != entries.len() {
                tracing::debug!(%cpu, seen, expected = entries.len(), "cpu schedule short");
                outcome.report(
                    ThreadId::default(),
                    0,
                    "Cpu schedule entry count does not match trace",
                );
            }
        }
        if outcome.compared != self.merged.serial.len() {
            outcome.report(
                ThreadId::default(),
                outcome.compared as u64,
                "Cpu schedule entry count does not match trace",
            );
        }
        tracing::debug!(
            compared = outcome.compared,
            clean = outcome.is_clean(),
            "cpu schedule checked"
        );
        outcome
    }
}
