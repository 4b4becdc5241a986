//! Per-shard rolling state.
//!
//! A [`ShardState`] holds everything the invariant engine remembers between
//! records of one shard. Lookback is kept as owned copies of earlier records,
//! never as references into a record log.

use crate::branch::BranchTargetCache;
use crate::signal::{AnnotationState, SignalStacks};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracecheck_core::{
    CpuId, FileType, ScheduleEntry, ShardKey, ThreadId, Violation, ViolationKind,
};
use tracecheck_log::{Instr, MarkerKind, StreamMetadata, TraceRecord};

/// Schedule entries one shard observed on cpu-id markers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTimeline {
    /// Entries in observation order
    pub sched: Vec<ScheduleEntry>,
    /// The same entries bucketed by cpu
    pub cpu_sched: IndexMap<CpuId, Vec<ScheduleEntry>>,
}

impl ShardTimeline {
    /// Create an empty timeline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry to both views
    pub fn record(&mut self, entry: ScheduleEntry) {
        self.sched.push(entry);
        self.cpu_sched.entry(entry.cpu).or_default().push(entry);
    }

    /// Number of entries observed
    #[must_use]
    pub fn len(&self) -> usize {
        self.sched.len()
    }

    /// No cpu-id marker was seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sched.is_empty()
    }
}

/// Mutable state for one shard
///
/// Owned by exactly one worker while records flow; read by the reconciler
/// once every worker has finished.
pub struct ShardState {
    pub(crate) key: ShardKey,
    pub(crate) thread: Option<ThreadId>,
    pub(crate) stream: Option<Arc<dyn StreamMetadata>>,
    /// The stream is shared by every shard of a serial run
    pub(crate) stream_is_serial: bool,

    pub(crate) ref_count: u64,
    pub(crate) instr_count: u64,
    pub(crate) last_instr_count_marker: u64,
    pub(crate) last_window: u64,
    pub(crate) chunk_instr_count: u64,
    pub(crate) file_type: FileType,

    pub(crate) skipped_instrs: bool,
    pub(crate) saw_timestamp_but_no_instr: bool,
    pub(crate) saw_kernel_xfer_after_prev_instr: bool,
    pub(crate) window_transition: bool,
    pub(crate) found_instr_count_marker: bool,
    pub(crate) found_cache_line_size_marker: bool,
    pub(crate) found_page_size_marker: bool,

    pub(crate) last_timestamp: u64,
    pub(crate) last_retaddr: u64,

    pub(crate) prev_entry: Option<TraceRecord>,
    pub(crate) prev_prev_entry: Option<TraceRecord>,
    pub(crate) prev_instr: Option<Instr>,
    /// Transfer marker since the previous instruction; cleared by each instruction
    pub(crate) prev_xfer_marker: Option<MarkerKind>,
    /// Most recent transfer marker, never cleared
    pub(crate) last_xfer_marker: Option<MarkerKind>,

    pub(crate) signals: SignalStacks,
    pub(crate) annotations: AnnotationState,
    pub(crate) branch_targets: BranchTargetCache,
    pub(crate) timeline: ShardTimeline,
    pub(crate) violations: Vec<Violation>,
}

impl ShardState {
    /// Create state for a shard that has seen nothing yet
    #[must_use]
    pub fn new(
        key: ShardKey,
        stream: Option<Arc<dyn StreamMetadata>>,
        stream_is_serial: bool,
    ) -> Self {
        let thread = match key {
            ShardKey::Thread(tid) if tid.is_known() => Some(tid),
            _ => None,
        };
        Self {
            key,
            thread,
            stream,
            stream_is_serial,
            ref_count: 0,
            instr_count: 0,
            last_instr_count_marker: 0,
            last_window: 0,
            chunk_instr_count: 0,
            file_type: FileType::DEFAULT,
            skipped_instrs: false,
            saw_timestamp_but_no_instr: false,
            saw_kernel_xfer_after_prev_instr: false,
            window_transition: false,
            found_instr_count_marker: false,
            found_cache_line_size_marker: false,
            found_page_size_marker: false,
            last_timestamp: 0,
            last_retaddr: 0,
            prev_entry: None,
            prev_prev_entry: None,
            prev_instr: None,
            prev_xfer_marker: None,
            last_xfer_marker: None,
            signals: SignalStacks::new(),
            annotations: AnnotationState::default(),
            branch_targets: BranchTargetCache::new(),
            timeline: ShardTimeline::new(),
            violations: Vec::new(),
        }
    }

    /// Key this shard was registered under
    #[must_use]
    pub fn key(&self) -> ShardKey {
        self.key
    }

    /// Thread bound from the first record with a known id
    #[must_use]
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    /// Records processed
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.ref_count
    }

    /// Counted instructions processed
    #[must_use]
    pub fn instr_count(&self) -> u64 {
        self.instr_count
    }

    /// File-type flags seen on this shard
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Whether the stream started past its first instruction
    #[must_use]
    pub fn skipped_instructions(&self) -> bool {
        self.skipped_instrs
    }

    /// Depth of in-flight signal deliveries
    #[must_use]
    pub fn signal_depth(&self) -> usize {
        self.signals.depth()
    }

    /// Observed schedule timeline
    #[must_use]
    pub fn timeline(&self) -> &ShardTimeline {
        &self.timeline
    }

    /// Every breach found so far, oldest first
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Any breach found
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Message of the most recent breach, empty when clean
    #[must_use]
    pub fn error(&self) -> &str {
        self.violations.last().map_or("", |v| v.message.as_str())
    }

    /// Thread to attribute violations to
    pub(crate) fn attributed_thread(&self) -> ThreadId {
        self.thread.unwrap_or_default()
    }

    /// Ordinal to attribute violations to
    pub(crate) fn attributed_ordinal(&self) -> u64 {
        self.stream
            .as_ref()
            .map_or(self.ref_count, |s| s.record_ordinal())
    }

    /// Record a breach unless `condition` holds
    pub(crate) fn require(&mut self, condition: bool, kind: ViolationKind, message: &str) {
        if condition {
            return;
        }
        let violation = Violation::new(
            kind,
            self.attributed_thread(),
            self.attributed_ordinal(),
            message,
        );
        tracing::warn!(shard = %self.key, %kind, "{violation}");
        self.violations.push(violation);
    }
}

impl std::fmt::Debug for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardState")
            .field("key", &self.key)
            .field("thread", &self.thread)
            .field("ref_count", &self.ref_count)
            .field("instr_count", &self.instr_count)
            .field("file_type", &self.file_type)
            .field("has_stream", &self.stream.is_some())
            .field("signal_depth", &self.signals.depth())
            .field("violations", &self.violations.len())
            .finish_non_exhaustive()
    }
}
