//! Record invariant engine.
//!
//! [`InvariantChecker`] drives shards either serially (records of every
//! thread interleaved, shards discovered by thread id) or in parallel (one
//! worker per shard, shards registered by index). Both paths end in
//! [`InvariantChecker::process`], which advances one shard by one record.

use crate::branch::BranchDecoder;
use crate::reconcile::{MergedSchedule, ScheduleReconciler};
use crate::registry::{ShardHandle, ShardRegistry};
use crate::report::CheckReport;
use crate::shard::{ShardState, ShardTimeline};
use crate::signal::AnnotationState;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use tracecheck_core::{
    CoreError, CoreResult, CpuId, FileType, ScheduleEntry, Violation, ViolationKind,
};
use tracecheck_log::{
    DataAccess, Instr, InstrKind, Marker, MarkerKind, PrefetchHint, StreamMetadata, TraceRecord,
};

/// Test apps whose traces carry prefetch annotations
const ANNOTATED_TESTS: [&str; 2] = ["kernel_xfer_app", "rseq_app"];

/// Test whose final instruction-count marker is known
const INSTR_COUNT_TEST: &str = "filter_asm_instr_count";
const INSTR_COUNT_TEST_VALUE: u64 = 133;

/// Bits of a physical and virtual address that always agree
const MIN_PAGE_MASK: u64 = 0xfff;

/// Invariant checker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Trace was produced offline (post-processed) rather than online
    pub offline: bool,
    /// Diagnostic verbosity; 3 and up logs every record
    pub verbose: u32,
    /// Name of a known test app whose trace gets extra checks
    pub test_name: Option<String>,
    /// Validate signal delivery and return
    pub check_kernel_transfers: bool,
    /// Refuse further records on a shard once it has failed
    pub stop_on_error: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            offline: true,
            verbose: 0,
            test_name: None,
            check_kernel_transfers: cfg!(unix),
            stop_on_error: true,
        }
    }
}

impl CheckerConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set offline vs online capture
    #[must_use]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Set verbosity
    #[must_use]
    pub fn with_verbose(mut self, verbose: u32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the known-test name
    #[must_use]
    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    /// Enable or disable signal checks
    #[must_use]
    pub fn with_kernel_transfer_checks(mut self, enabled: bool) -> Self {
        self.check_kernel_transfers = enabled;
        self
    }

    /// Set the continuation policy after a failure
    #[must_use]
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Parse a configuration from JSON; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or names an empty test
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.test_name.as_deref() == Some("") {
            return Err(CoreError::InvalidConfig {
                field: "test_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    /// Prefetch annotations are meaningful for this trace
    #[must_use]
    pub fn has_annotations(&self) -> bool {
        self.check_kernel_transfers
            && self
                .test_name
                .as_deref()
                .is_some_and(|name| ANNOTATED_TESTS.contains(&name))
    }
}

/// Optional external schedule file
type ScheduleSource = Mutex<Option<Box<dyn Read + Send>>>;

/// Trace invariant checker
pub struct InvariantChecker {
    config: CheckerConfig,
    decoder: Option<Box<dyn BranchDecoder>>,
    registry: ShardRegistry,
    serial_stream: Option<Arc<dyn StreamMetadata>>,
    serial_schedule: ScheduleSource,
    cpu_schedule: ScheduleSource,
}

impl InvariantChecker {
    /// Create a checker with no decoder and no schedule files
    #[must_use]
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            decoder: None,
            registry: ShardRegistry::new(),
            serial_stream: None,
            serial_schedule: Mutex::new(None),
            cpu_schedule: Mutex::new(None),
        }
    }

    /// Resolve direct-branch targets with `decoder`
    #[must_use]
    pub fn with_decoder(mut self, decoder: impl BranchDecoder + 'static) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Reconcile against a canonical serial schedule
    #[must_use]
    pub fn with_serial_schedule(self, source: impl Read + Send + 'static) -> Self {
        *self.serial_schedule.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Box::new(source));
        self
    }

    /// Reconcile against a canonical per-cpu schedule
    #[must_use]
    pub fn with_cpu_schedule(self, source: impl Read + Send + 'static) -> Self {
        *self.cpu_schedule.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Box::new(source));
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Registered shards
    #[must_use]
    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    /// Attach the stream shared by every shard of a serial run
    pub fn initialize_stream(&mut self, stream: Arc<dyn StreamMetadata>) {
        self.serial_stream = Some(stream);
    }

    /// Register shard `index` for a parallel run
    pub fn init_shard(&self, index: usize, stream: Option<Arc<dyn StreamMetadata>>) -> ShardHandle {
        self.registry
            .init(tracecheck_core::ShardKey::Index(index), stream, false)
    }

    /// Advance a parallel shard by one record
    ///
    /// # Errors
    ///
    /// Returns the first breach this record caused, or the shard's first
    /// breach when it has already failed and `stop_on_error` is set
    pub fn process_shard(
        &self,
        shard: &ShardHandle,
        record: &TraceRecord,
    ) -> Result<(), Violation> {
        let mut state = shard.lock();
        self.process(&mut state, record)
    }

    /// Finish a parallel shard; `true` if it is clean
    pub fn exit_shard(&self, shard: &ShardHandle) -> bool {
        let state = shard.lock();
        tracing::debug!(
            shard = %state.key(),
            records = state.record_count(),
            instrs = state.instr_count(),
            violations = state.violations().len(),
            "shard finished"
        );
        !state.has_errors()
    }

    /// Latest error message of a shard, empty when clean
    #[must_use]
    pub fn shard_error(&self, shard: &ShardHandle) -> String {
        shard.lock().error().to_string()
    }

    /// Feed one record of a serial run
    ///
    /// # Errors
    ///
    /// Returns the first breach this record caused in its thread's shard
    pub fn process_record(&self, record: &TraceRecord) -> Result<(), Violation> {
        let (shard, _) = self
            .registry
            .lookup_or_create(record.tid, self.serial_stream.clone());
        self.process_shard(&shard, record)
    }

    /// First breach recorded by any shard, in registration order
    #[must_use]
    pub fn first_violation(&self) -> Option<Violation> {
        self.registry
            .handles()
            .iter()
            .find_map(|h| h.lock().violations().first().cloned())
    }

    /// Advance `shard` by `record`, evaluating every applicable invariant
    ///
    /// All breaches are kept on the shard; the first one caused by this
    /// record is returned.
    ///
    /// # Errors
    ///
    /// Returns the first breach for this record, or the shard's first breach
    /// when it has already failed and `stop_on_error` is set
    pub fn process(&self, shard: &mut ShardState, record: &TraceRecord) -> Result<(), Violation> {
        if self.config.stop_on_error {
            if let Some(first) = shard.violations.first() {
                return Err(first.clone());
            }
        }
        let before = shard.violations.len();
        // A serial stream only counts per shard while one thread exists.
        let sole_shard = !shard.stream_is_serial || self.registry.len() <= 1;
        self.check(shard, record, sole_shard);
        match shard.violations.get(before) {
            Some(violation) => Err(violation.clone()),
            None => Ok(()),
        }
    }

    fn check(&self, shard: &mut ShardState, record: &TraceRecord, sole_shard: bool) {
        if shard.thread.is_none() && record.tid.is_known() {
            shard.thread = Some(record.tid);
        }
        self.check_ordinals(shard, record, sole_shard);

        if self.config.has_annotations() {
            Self::check_annotations(shard, record, self.config.offline);
        }
        if self.config.check_kernel_transfers {
            Self::check_rseq(shard, record);
        }
        if let Some(marker) = record.as_marker() {
            Self::check_header_marker(shard, marker);
        }
        Self::check_function_markers(shard, record);
        if record.is_thread_exit() {
            self.check_thread_exit(shard);
        }
        Self::check_physical_address(shard, record);

        if let Some(instr) = record.as_instr() {
            self.check_instr(shard, record, instr);
        } else if self.config.verbose >= 3 {
            tracing::debug!(pid = record.pid, tid = %record.tid, body = ?record.body, "record");
        }
        if let Some(marker) = record.as_marker() {
            self.track_marker(shard, record, marker);
        }

        shard.prev_prev_entry = shard.prev_entry.take();
        shard.prev_entry = Some(record.clone());
    }

    fn check_ordinals(&self, shard: &mut ShardState, record: &TraceRecord, sole_shard: bool) {
        shard.ref_count += 1;
        if record.is_counted_instr() {
            shard.instr_count += 1;
        }
        let Some(stream) = shard.stream.clone() else {
            return;
        };
        // Only a skip at the very start is visible here.
        if shard.instr_count <= 1 && !shard.skipped_instrs && stream.instruction_ordinal() > 1 {
            tracing::debug!(shard = %shard.key, "leading instructions skipped");
            shard.skipped_instrs = true;
        }
        if shard.skipped_instrs || !sole_shard {
            return;
        }
        let records_match = shard.ref_count == stream.record_ordinal();
        shard.require(records_match, ViolationKind::Ordinal, "Stream record ordinal inaccurate");
        let instrs_match = shard.instr_count == stream.instruction_ordinal();
        shard.require(instrs_match, ViolationKind::Ordinal, "Stream instr ordinal inaccurate");
    }

    fn check_annotations(shard: &mut ShardState, record: &TraceRecord, offline: bool) {
        if shard.annotations.countdown_expired() {
            // Online instruction bundles break this.
            let on_time = record.is_marker(MarkerKind::KernelEvent) || !offline;
            shard.require(on_time, ViolationKind::KernelTransfer, "Interruption marker mis-placed");
            shard.annotations.reset_countdowns();
        }
        let Some(data) = record.as_data() else {
            return;
        };
        if data.is_read_or_write() {
            let in_time = shard.annotations.consume_memref();
            shard.require(in_time, ViolationKind::KernelTransfer, "Interruption marker too late");
        }
        // "prefetcht0 [1]" tags the first instruction of the app's handler.
        if data.is_prefetch(PrefetchHint::T0) && data.addr == 1 {
            let handler = shard.prev_entry.as_ref().and_then(TraceRecord::as_instr).cloned();
            let placed = handler.as_ref().is_some_and(|i| i.kind.is_counted())
                && shard
                    .prev_prev_entry
                    .as_ref()
                    .is_some_and(|r| r.as_marker().is_some())
                && shard.last_xfer_marker == Some(MarkerKind::KernelEvent);
            shard.require(
                placed,
                ViolationKind::KernelTransfer,
                "Signal handler not immediately after signal marker",
            );
            shard.annotations.app_handler_pc = handler.map(|i| i.addr);
        }
        Self::arm_countdowns(&mut shard.annotations, data);
    }

    fn arm_countdowns(annotations: &mut AnnotationState, data: &DataAccess) {
        if data.addr >= AnnotationState::ANNOTATION_LIMIT {
            return;
        }
        if data.is_prefetch(PrefetchHint::T2) {
            annotations.instrs_until_interrupt = Some(data.addr);
        }
        if data.is_prefetch(PrefetchHint::T1) {
            annotations.memrefs_until_interrupt = Some(data.addr);
        }
    }

    fn check_rseq(shard: &mut ShardState, record: &TraceRecord) {
        let Some(marker) = record.as_marker() else {
            return;
        };
        let after_abort = shard
            .prev_entry
            .as_ref()
            .is_some_and(|prev| prev.is_marker(MarkerKind::RseqAbort));
        if after_abort {
            shard.require(
                marker.kind == MarkerKind::KernelEvent,
                ViolationKind::MarkerPlacement,
                "Rseq marker not immediately prior to kernel marker",
            );
        }
        if marker.kind == MarkerKind::RseqAbort {
            let prev_pc = shard.prev_instr.as_ref().map_or(0, |i| i.addr);
            shard.require(
                marker.value != prev_pc,
                ViolationKind::KernelTransfer,
                "Rseq post-abort instruction not rolled back",
            );
        }
    }

    fn check_header_marker(shard: &mut ShardState, marker: &Marker) {
        let value = marker.value;
        let stream = shard.stream.clone();
        let agrees = |property: fn(&dyn StreamMetadata) -> u64| {
            stream.as_deref().is_none_or(|s| property(s) == value)
        };
        match marker.kind {
            MarkerKind::Filetype => {
                shard.file_type = FileType::from_bits(value);
                let file_type = shard.file_type;
                let ok = stream.as_deref().is_none_or(|s| s.filetype() == file_type);
                shard.require(
                    ok,
                    ViolationKind::Ordinal,
                    "Stream interface filetype != trace marker",
                );
            }
            MarkerKind::InstructionCount => {
                shard.found_instr_count_marker = true;
                let increasing = value >= shard.last_instr_count_marker;
                shard.require(
                    increasing,
                    ViolationKind::MarkerPlacement,
                    "Instr count markers not increasing",
                );
                shard.last_instr_count_marker = value;
            }
            MarkerKind::CacheLineSize => {
                shard.found_cache_line_size_marker = true;
                let ok = agrees(|s| s.cache_line_size());
                shard.require(
                    ok,
                    ViolationKind::Ordinal,
                    "Stream interface cache line size != trace marker",
                );
            }
            MarkerKind::PageSize => {
                shard.found_page_size_marker = true;
                let ok = agrees(|s| s.page_size());
                shard.require(
                    ok,
                    ViolationKind::Ordinal,
                    "Stream interface page size != trace marker",
                );
            }
            MarkerKind::Version => {
                let ok = agrees(|s| s.version());
                shard.require(
                    ok,
                    ViolationKind::Ordinal,
                    "Stream interface version != trace marker",
                );
            }
            MarkerKind::ChunkInstrCount => {
                shard.chunk_instr_count = value;
                let ok = agrees(|s| s.chunk_instr_count());
                shard.require(
                    ok,
                    ViolationKind::Ordinal,
                    "Stream interface chunk instr count != trace marker",
                );
            }
            MarkerKind::ChunkFooter => {
                let chunk = shard.chunk_instr_count;
                let aligned =
                    shard.skipped_instrs || (chunk != 0 && shard.instr_count % chunk == 0);
                shard.require(
                    aligned,
                    ViolationKind::MarkerPlacement,
                    "Chunk instruction counts are inconsistent",
                );
            }
            _ => {}
        }
    }

    fn check_function_markers(shard: &mut ShardState, record: &TraceRecord) {
        let after_function_marker = shard
            .prev_entry
            .as_ref()
            .and_then(TraceRecord::as_marker)
            .is_some_and(|m| m.kind.is_function_marker());
        if after_function_marker {
            // Callee entry is always the top of a block, so no memref may follow.
            shard.require(
                record.as_data().is_none(),
                ViolationKind::MarkerPlacement,
                "Function marker misplaced between instr and memref",
            );
        }
        let Some(marker) = record.as_marker() else {
            return;
        };
        if marker.kind.is_function_marker() {
            let after_branch = shard.prev_instr.as_ref().is_some_and(|i| i.kind.is_branch());
            shard.require(
                after_branch,
                ViolationKind::MarkerPlacement,
                "Function marker should be after a branch",
            );
        }
        if marker.kind == MarkerKind::FuncRetaddr {
            let matches_call = marker.value == shard.last_retaddr;
            shard.require(
                matches_call,
                ViolationKind::MarkerPlacement,
                "Function marker retaddr should match prior call",
            );
        }
    }

    fn check_thread_exit(&self, shard: &mut ShardState) {
        let has_count = !shard.file_type.is_filtered() || shard.found_instr_count_marker;
        shard.require(has_count, ViolationKind::MarkerPlacement, "Missing instr count markers");

        // A skipped prefix may have swallowed the header markers.
        let stream = shard.stream.clone();
        let compensated = |property: fn(&dyn StreamMetadata) -> u64| {
            shard.skipped_instrs && stream.as_deref().is_some_and(|s| property(s) > 0)
        };
        let has_line = shard.found_cache_line_size_marker || compensated(|s| s.cache_line_size());
        let has_page = shard.found_page_size_marker || compensated(|s| s.page_size());
        shard.require(has_line, ViolationKind::MarkerPlacement, "Missing cache line marker");
        shard.require(has_page, ViolationKind::MarkerPlacement, "Missing page size marker");

        if self.config.test_name.as_deref() == Some(INSTR_COUNT_TEST) {
            let exact = shard.last_instr_count_marker == INSTR_COUNT_TEST_VALUE;
            shard.require(
                exact,
                ViolationKind::MarkerPlacement,
                "Incorrect instr count marker value",
            );
        }
    }

    fn check_physical_address(shard: &mut ShardState, record: &TraceRecord) {
        let Some(physical) = shard
            .prev_entry
            .as_ref()
            .and_then(|prev| prev.marker_value(MarkerKind::PhysicalAddress))
        else {
            return;
        };
        let virtual_addr = record.marker_value(MarkerKind::VirtualAddress);
        shard.require(
            virtual_addr.is_some(),
            ViolationKind::MarkerPlacement,
            "Physical addr marker not immediately prior to virtual marker",
        );
        if let Some(virtual_addr) = virtual_addr {
            shard.require(
                virtual_addr & MIN_PAGE_MASK == physical & MIN_PAGE_MASK,
                ViolationKind::MarkerPlacement,
                "Physical addr bottom 12 bits do not match virtual",
            );
        }
    }

    fn check_instr(&self, shard: &mut ShardState, record: &TraceRecord, instr: &Instr) {
        if self.config.verbose >= 3 {
            tracing::debug!(
                pid = record.pid,
                tid = %record.tid,
                addr = format_args!("{:#x}", instr.addr),
                size = instr.size,
                fetched = instr.kind.is_counted(),
                "instr"
            );
        }
        if self.config.has_annotations() {
            let in_time = shard.annotations.consume_instr();
            shard.require(in_time, ViolationKind::KernelTransfer, "Interruption marker too late");
        }
        if instr.kind.is_call() {
            shard.last_retaddr = instr.fall_through();
        }

        let prev = shard.prev_instr.take();
        if let Some(prev) = &prev {
            // Offline traces never switch threads between a branch and its target.
            if self.config.offline && prev.kind.is_branch() {
                let adjacent = !shard.saw_timestamp_but_no_instr
                    || shard.prev_xfer_marker == Some(MarkerKind::KernelEvent);
                shard.require(
                    adjacent,
                    ViolationKind::ControlFlow,
                    "Branch target not immediately after branch",
                );
            }
            let target = self.resolve_branch_target(shard, prev);
            let legal = self.control_flow_is_explicit(shard, prev, instr, target);
            shard.require(
                legal,
                ViolationKind::ControlFlow,
                "Non-explicit control flow has no marker",
            );
        }

        if self.config.check_kernel_transfers
            && shard.prev_xfer_marker == Some(MarkerKind::KernelXfer)
        {
            // Entry and exit are paired: no longjmp out of a handler.
            let app_handler_pc = shard.annotations.app_handler_pc;
            let returned = shard
                .signals
                .pop()
                .is_some_and(|frame| frame.accepts(instr, app_handler_pc));
            shard.require(
                returned,
                ViolationKind::KernelTransfer,
                "Signal handler return point incorrect",
            );
        }

        shard.prev_instr = Some(instr.clone());
        shard.saw_kernel_xfer_after_prev_instr = false;
        shard.prev_xfer_marker = None;
        shard.saw_timestamp_but_no_instr = false;
        shard.window_transition = false;
    }

    /// Target of `prev` when it is a direct branch we can decode
    fn resolve_branch_target(&self, shard: &mut ShardState, prev: &Instr) -> Option<u64> {
        if !prev.kind.is_direct_branch() || !shard.file_type.has_encodings() {
            return None;
        }
        let decoder = self.decoder.as_deref()?;
        match shard.branch_targets.resolve(prev, decoder) {
            Ok(target) => Some(target),
            Err(err) => {
                tracing::debug!(shard = %shard.key, error = %err, "branch decode failed");
                shard.require(false, ViolationKind::Decode, "Branch target is not decodeable");
                None
            }
        }
    }

    fn control_flow_is_explicit(
        &self,
        shard: &ShardState,
        prev: &Instr,
        instr: &Instr,
        target: Option<u64>,
    ) -> bool {
        let string_loop = prev.addr == instr.addr
            && (instr.kind == InstrKind::NoFetch
                // Online marks the first string iteration after a switch as fetched.
                || (!self.config.offline && shard.saw_timestamp_but_no_instr));
        shard.file_type.is_filtered()
            || prev.fall_through() == instr.addr
            || (prev.kind.is_branch() && !prev.kind.is_direct_branch())
            || (prev.kind.is_direct_branch() && target.is_none_or(|t| t == instr.addr))
            || string_loop
            || shard.prev_xfer_marker.is_some()
            || shard.window_transition
            || prev.kind == InstrKind::Sysenter
    }

    fn track_marker(&self, shard: &mut ShardState, record: &TraceRecord, marker: &Marker) {
        match marker.kind {
            MarkerKind::Timestamp => {
                shard.last_timestamp = marker.value;
                shard.saw_timestamp_but_no_instr = true;
                if self.config.verbose >= 3 {
                    tracing::debug!(tid = %record.tid, timestamp = marker.value, "timestamp");
                }
            }
            MarkerKind::CpuId => {
                let entry = ScheduleEntry::new(
                    shard.attributed_thread(),
                    shard.last_timestamp,
                    CpuId::new(marker.value),
                    shard.instr_count,
                );
                shard.timeline.record(entry);
            }
            MarkerKind::KernelEvent | MarkerKind::KernelXfer => {
                if self.config.verbose >= 3 {
                    tracing::debug!(
                        tid = %record.tid,
                        kind = ?marker.kind,
                        value = format_args!("{:#x}", marker.value),
                        "kernel transfer"
                    );
                }
                if self.config.check_kernel_transfers {
                    Self::track_kernel_transfer(shard, marker);
                }
                shard.prev_xfer_marker = Some(marker.kind);
                shard.last_xfer_marker = Some(marker.kind);
            }
            MarkerKind::WindowId => {
                if shard.last_window != marker.value {
                    shard.window_transition = true;
                }
                shard.last_window = marker.value;
            }
            _ => {}
        }
    }

    fn track_kernel_transfer(shard: &mut ShardState, marker: &Marker) {
        shard.require(
            marker.value != 0,
            ViolationKind::KernelTransfer,
            "Kernel event marker value missing",
        );
        if marker.kind != MarkerKind::KernelEvent {
            return;
        }
        let back_to_back = shard.prev_xfer_marker == Some(MarkerKind::KernelXfer);
        if back_to_back {
            // The handler that just returned never reached an instruction, so
            // its frame is closed here instead of being checked.
            shard.signals.pop();
        }
        let pre_signal = if back_to_back || shard.saw_kernel_xfer_after_prev_instr {
            // Nested delivery with no app instruction in between.
            None
        } else {
            shard.saw_kernel_xfer_after_prev_instr = true;
            shard.prev_instr.clone()
        };
        shard.signals.push(marker.value, pre_signal);
    }

    /// Run schedule reconciliation and summarise the whole run
    ///
    /// Schedule sources are consumed; a second call only re-reports shard
    /// breaches.
    pub fn print_results(&mut self) -> CheckReport {
        let handles = self.registry.handles();
        let mut violations = Vec::new();
        let mut record_count = 0;
        let mut timelines: Vec<ShardTimeline> = Vec::with_capacity(handles.len());
        for handle in &handles {
            let shard = handle.lock();
            record_count += shard.record_count();
            violations.extend_from_slice(shard.violations());
            timelines.push(shard.timeline().clone());
        }

        let merged = MergedSchedule::merge(&timelines);
        let reconciler = ScheduleReconciler::new(&merged);
        let mut compared = 0;
        let serial = self
            .serial_schedule
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(source) = serial {
            let outcome = reconciler.check_serial(source);
            compared += outcome.compared;
            violations.extend(outcome.violations);
        }
        let cpu = self
            .cpu_schedule
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(source) = cpu {
            let outcome = reconciler.check_cpu(source);
            compared += outcome.compared;
            violations.extend(outcome.violations);
        }

        let report = CheckReport::new(handles.len(), record_count, compared, violations);
        if report.passed {
            tracing::info!(
                shards = report.shard_count,
                records = report.record_count,
                "Trace invariant checks passed"
            );
        } else {
            tracing::warn!(violations = report.violations.len(), "trace invariant checks failed");
        }
        report
    }
}

impl std::fmt::Debug for InvariantChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantChecker")
            .field("config", &self.config)
            .field("has_decoder", &self.decoder.is_some())
            .field("shards", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracecheck_core::{ShardKey, ThreadId};
    use tracecheck_log::AccessKind;

    const TID: ThreadId = ThreadId::new(7);

    fn plain(addr: u64) -> TraceRecord {
        TraceRecord::instr(TID, Instr::new(addr, 4, InstrKind::Plain))
    }

    fn marker(kind: MarkerKind, value: u64) -> TraceRecord {
        TraceRecord::marker(TID, kind, value)
    }

    fn header() -> Vec<TraceRecord> {
        vec![
            marker(MarkerKind::Version, 6),
            marker(MarkerKind::Filetype, 0),
            marker(MarkerKind::CacheLineSize, 64),
            marker(MarkerKind::PageSize, 4096),
        ]
    }

    fn shard() -> ShardState {
        ShardState::new(ShardKey::Index(0), None, false)
    }

    fn run(checker: &InvariantChecker, records: &[TraceRecord]) -> ShardState {
        let mut state = shard();
        for record in records {
            let _ = checker.process(&mut state, record);
        }
        state
    }

    fn checker() -> InvariantChecker {
        InvariantChecker::new(CheckerConfig::default().with_kernel_transfer_checks(true))
    }

    fn messages(state: &ShardState) -> Vec<&str> {
        state.violations().iter().map(|v| v.message.as_str()).collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = CheckerConfig::default();
        assert!(config.offline);
        assert!(config.stop_on_error);
        assert_eq!(config.verbose, 0);
        assert!(!config.has_annotations());
        assert!(
            config
                .with_test_name("rseq_app")
                .with_kernel_transfer_checks(true)
                .has_annotations()
        );
    }

    #[test]
    fn test_config_from_json() {
        let config = CheckerConfig::from_json(r#"{"offline":false,"verbose":2}"#).unwrap();
        assert!(!config.offline);
        assert_eq!(config.verbose, 2);
        assert!(config.stop_on_error);

        let err = CheckerConfig::from_json(r#"{"test_name":""}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { .. }));
    }

    #[test]
    fn test_clean_sequence_passes() {
        let checker = checker();
        let mut records = header();
        records.extend([plain(0x1000), plain(0x1004), TraceRecord::thread_exit(TID)]);
        let state = run(&checker, &records);
        assert!(!state.has_errors(), "{:?}", state.violations());
        assert_eq!(state.record_count(), 7);
        assert_eq!(state.instr_count(), 2);
        assert_eq!(state.thread(), Some(TID));
    }

    #[test]
    fn test_fall_through_gap_is_reported() {
        let checker = checker();
        let mut state = shard();
        checker.process(&mut state, &plain(0x1000)).unwrap();
        let err = checker.process(&mut state, &plain(0x2000)).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ControlFlow);
        assert_eq!(err.message, "Non-explicit control flow has no marker");
        assert_eq!(err.ordinal, 2);
    }

    #[test]
    fn test_stop_on_error_repeats_first_failure() {
        let checker = checker();
        let mut state = shard();
        checker.process(&mut state, &plain(0x1000)).unwrap();
        let first = checker.process(&mut state, &plain(0x2000)).unwrap_err();
        let again = checker.process(&mut state, &plain(0x2004)).unwrap_err();
        assert_eq!(first, again);
        assert_eq!(state.record_count(), 2);
    }

    #[test]
    fn test_continue_collects_all_failures() {
        let checker = InvariantChecker::new(CheckerConfig::default().with_stop_on_error(false));
        let state = run(&checker, &[plain(0x1000), plain(0x2000), plain(0x3000)]);
        assert_eq!(state.violations().len(), 2);
        assert_eq!(state.record_count(), 3);
    }

    #[test]
    fn test_exemptions() {
        let checker = checker();
        // Window change, indirect jump, sysenter and a string loop.
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::WindowId, 1),
            plain(0x5000),
            TraceRecord::instr(TID, Instr::new(0x5004, 2, InstrKind::IndirectJump)),
            plain(0x9000),
            TraceRecord::instr(TID, Instr::new(0x9004, 2, InstrKind::Sysenter)),
            plain(0xa000),
            TraceRecord::instr(TID, Instr::new(0xa000, 4, InstrKind::NoFetch)),
        ];
        let state = run(&checker, &records);
        assert!(!state.has_errors(), "{:?}", state.violations());
        assert_eq!(state.instr_count(), 6);
    }

    #[test]
    fn test_filtered_trace_skips_control_flow() {
        let checker = checker();
        let records = vec![
            marker(MarkerKind::Filetype, FileType::IFILTERED.bits()),
            plain(0x1000),
            plain(0x8000),
        ];
        assert!(!run(&checker, &records).has_errors());
    }

    #[test]
    fn test_branch_target_after_timestamp() {
        let checker = checker();
        let records = vec![
            TraceRecord::instr(TID, Instr::new(0x1000, 2, InstrKind::Return)),
            marker(MarkerKind::Timestamp, 10),
            plain(0x4000),
        ];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Branch target not immediately after branch"]);

        let online = InvariantChecker::new(CheckerConfig::default().with_offline(false));
        assert!(!run(&online, &records).has_errors());
    }

    #[test]
    fn test_instr_count_markers_must_not_decrease() {
        let checker = checker();
        let records = vec![
            marker(MarkerKind::InstructionCount, 10),
            marker(MarkerKind::InstructionCount, 10),
            marker(MarkerKind::InstructionCount, 9),
        ];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Instr count markers not increasing"]);
    }

    #[test]
    fn test_function_marker_rules() {
        let checker = checker();
        let records = vec![
            TraceRecord::instr(TID, Instr::new(0x1000, 5, InstrKind::DirectCall)),
            marker(MarkerKind::FuncId, 3),
            marker(MarkerKind::FuncRetaddr, 0x1005),
            plain(0x2000),
        ];
        assert!(!run(&checker, &records).has_errors());

        let misplaced = vec![
            plain(0x1000),
            marker(MarkerKind::FuncId, 3),
            TraceRecord::data(TID, AccessKind::Read, 0x40),
        ];
        let state = run(
            &InvariantChecker::new(CheckerConfig::default().with_stop_on_error(false)),
            &misplaced,
        );
        assert_eq!(
            messages(&state),
            vec![
                "Function marker should be after a branch",
                "Function marker misplaced between instr and memref",
            ]
        );
    }

    #[test]
    fn test_wrong_retaddr() {
        let checker = checker();
        let records = vec![
            TraceRecord::instr(TID, Instr::new(0x1000, 5, InstrKind::IndirectCall)),
            marker(MarkerKind::FuncRetaddr, 0x1004),
        ];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Function marker retaddr should match prior call"]);
    }

    #[test]
    fn test_thread_exit_requires_header_markers() {
        let checker = InvariantChecker::new(CheckerConfig::default().with_stop_on_error(false));
        let state = run(&checker, &[TraceRecord::thread_exit(TID)]);
        assert_eq!(
            messages(&state),
            vec!["Missing cache line marker", "Missing page size marker"]
        );
    }

    #[test]
    fn test_known_instr_count_test() {
        let checker =
            InvariantChecker::new(CheckerConfig::default().with_test_name(INSTR_COUNT_TEST));
        let mut records = header();
        records.push(marker(MarkerKind::InstructionCount, 132));
        records.push(TraceRecord::thread_exit(TID));
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Incorrect instr count marker value"]);
    }

    #[test]
    fn test_kernel_event_value_required() {
        let checker = checker();
        let records = vec![plain(0x1000), marker(MarkerKind::KernelEvent, 0)];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Kernel event marker value missing"]);
        assert_eq!(state.signal_depth(), 1);
    }

    #[test]
    fn test_signal_return_to_interruption_point() {
        let checker = checker();
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::KernelEvent, 0x1004),
            plain(0x8000),
            marker(MarkerKind::KernelXfer, 0x8004),
            plain(0x1004),
        ];
        let state = run(&checker, &records);
        assert!(!state.has_errors(), "{:?}", state.violations());
        assert_eq!(state.signal_depth(), 0);
    }

    #[test]
    fn test_signal_return_elsewhere_fails() {
        let checker = checker();
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::KernelEvent, 0x1004),
            plain(0x8000),
            marker(MarkerKind::KernelXfer, 0x8004),
            plain(0x3000),
        ];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Signal handler return point incorrect"]);
    }

    #[test]
    fn test_signal_checks_can_be_disabled() {
        let checker =
            InvariantChecker::new(CheckerConfig::default().with_kernel_transfer_checks(false));
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::KernelXfer, 0x8004),
            plain(0x3000),
        ];
        let state = run(&checker, &records);
        assert!(!state.has_errors());
        assert_eq!(state.signal_depth(), 0);
    }

    #[test]
    fn test_rseq_abort_rules() {
        let checker = InvariantChecker::new(
            CheckerConfig::default()
                .with_kernel_transfer_checks(true)
                .with_stop_on_error(false),
        );
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::RseqAbort, 0x1000),
            marker(MarkerKind::Timestamp, 5),
        ];
        let state = run(&checker, &records);
        assert_eq!(
            messages(&state),
            vec![
                "Rseq post-abort instruction not rolled back",
                "Rseq marker not immediately prior to kernel marker",
            ]
        );
    }

    #[test]
    fn test_annotation_countdown() {
        let checker = InvariantChecker::new(
            CheckerConfig::default()
                .with_test_name("kernel_xfer_app")
                .with_kernel_transfer_checks(true)
                .with_stop_on_error(false),
        );
        let on_time = vec![
            plain(0x1000),
            TraceRecord::data(TID, AccessKind::Prefetch(PrefetchHint::T2), 1),
            plain(0x1004),
            marker(MarkerKind::KernelEvent, 0x1008),
        ];
        assert!(!run(&checker, &on_time).has_errors());

        let late = vec![
            plain(0x1000),
            TraceRecord::data(TID, AccessKind::Prefetch(PrefetchHint::T2), 1),
            plain(0x1004),
            marker(MarkerKind::Timestamp, 1),
        ];
        let state = run(&checker, &late);
        assert_eq!(messages(&state), vec!["Interruption marker mis-placed"]);
    }

    fn annotated() -> InvariantChecker {
        InvariantChecker::new(
            CheckerConfig::default()
                .with_test_name("kernel_xfer_app")
                .with_kernel_transfer_checks(true)
                .with_stop_on_error(false),
        )
    }

    fn prefetch(hint: PrefetchHint, addr: u64) -> TraceRecord {
        TraceRecord::data(TID, AccessKind::Prefetch(hint), addr)
    }

    #[test]
    fn test_handler_annotation_allows_return_to_handler() {
        let checker = annotated();
        let mut records = vec![
            plain(0x1000),
            marker(MarkerKind::KernelEvent, 0x1004),
            plain(0x8000),
            prefetch(PrefetchHint::T0, 1),
            plain(0x8004),
            marker(MarkerKind::KernelXfer, 0x8008),
            // Resumes at the handler entry rather than the interruption point.
            plain(0x8000),
        ];
        let state = run(&checker, &records);
        assert!(!state.has_errors(), "{:?}", state.violations());
        assert_eq!(state.annotations.app_handler_pc, Some(0x8000));
        assert_eq!(state.signal_depth(), 0);

        records.remove(3);
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Signal handler return point incorrect"]);
    }

    #[test]
    fn test_misplaced_handler_annotation() {
        let checker = annotated();
        let records = vec![plain(0x1000), plain(0x1004), prefetch(PrefetchHint::T0, 1)];
        let state = run(&checker, &records);
        assert_eq!(
            messages(&state),
            vec!["Signal handler not immediately after signal marker"]
        );
        assert_eq!(state.annotations.app_handler_pc, Some(0x1004));
    }

    #[test]
    fn test_memref_countdown() {
        let checker = annotated();
        let on_time = vec![
            plain(0x1000),
            prefetch(PrefetchHint::T1, 1),
            TraceRecord::data(TID, AccessKind::Read, 0x100),
            marker(MarkerKind::KernelEvent, 0x1004),
        ];
        let state = run(&checker, &on_time);
        assert!(!state.has_errors(), "{:?}", state.violations());
        assert_eq!(state.annotations.memrefs_until_interrupt, None);

        // The instruction countdown keeps the expired memref countdown armed.
        let late = vec![
            plain(0x1000),
            prefetch(PrefetchHint::T2, 5),
            prefetch(PrefetchHint::T1, 1),
            TraceRecord::data(TID, AccessKind::Read, 0x100),
            TraceRecord::data(TID, AccessKind::Write, 0x200),
        ];
        let state = run(&checker, &late);
        assert_eq!(messages(&state), vec!["Interruption marker too late"]);
    }

    #[test]
    fn test_window_transition_clears_on_instr() {
        let checker = checker();
        let records = vec![
            plain(0x1000),
            marker(MarkerKind::WindowId, 2),
            plain(0x4000),
            plain(0x9000),
        ];
        let state = run(&checker, &records);
        assert_eq!(messages(&state), vec!["Non-explicit control flow has no marker"]);
    }

    #[test]
    fn test_cpu_marker_records_schedule() {
        let checker = checker();
        let records = vec![
            marker(MarkerKind::Timestamp, 100),
            marker(MarkerKind::CpuId, 3),
            plain(0x1000),
            marker(MarkerKind::Timestamp, 200),
            marker(MarkerKind::CpuId, 3),
        ];
        let state = run(&checker, &records);
        let timeline = state.timeline();
        assert_eq!(
            timeline.sched,
            vec![
                ScheduleEntry::new(TID, 100, CpuId::new(3), 0),
                ScheduleEntry::new(TID, 200, CpuId::new(3), 1),
            ]
        );
        assert_eq!(timeline.cpu_sched[&CpuId::new(3)].len(), 2);
    }

    #[test]
    fn test_serial_mode_discovers_shards() {
        let mut checker = checker();
        let other = ThreadId::new(8);
        checker.process_record(&plain(0x1000)).unwrap();
        checker
            .process_record(&TraceRecord::instr(other, Instr::new(0x5000, 4, InstrKind::Plain)))
            .unwrap();
        checker.process_record(&plain(0x1004)).unwrap();
        assert_eq!(checker.registry().len(), 2);

        let report = checker.print_results();
        assert!(report.passed);
        assert_eq!(report.shard_count, 2);
        assert_eq!(report.record_count, 3);
    }

    #[test]
    fn test_parallel_shard_error_text() {
        let checker = checker();
        let handle = checker.init_shard(0, None);
        checker.process_shard(&handle, &plain(0x1000)).unwrap();
        assert!(checker.process_shard(&handle, &plain(0x9000)).is_err());
        assert_eq!(checker.shard_error(&handle), "Non-explicit control flow has no marker");
        assert!(!checker.exit_shard(&handle));
        assert!(checker.first_violation().is_some());
    }
}
