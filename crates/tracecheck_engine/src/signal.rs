//! Signal and kernel-transfer bookkeeping.
//!
//! Every kernel-event marker pushes one frame and the instruction after every
//! kernel-xfer marker pops one, so nesting depth is bounded only by the data.

use tracecheck_log::{Instr, InstrKind};

/// Frame popped when a handler returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReturn {
    /// Interrupted pc reported by the kernel-event marker
    pub interruption_point: u64,
    /// Last app instruction before delivery; `None` for nested delivery
    /// with no intervening instruction
    pub pre_signal: Option<Instr>,
}

impl PendingReturn {
    /// Whether `target` is a legal place to resume after the handler
    #[must_use]
    pub fn accepts(&self, target: &Instr, app_handler_pc: Option<u64>) -> bool {
        let pre = self.pre_signal.as_ref();
        // Sysenter resumes somewhere other than the reported point.
        let at_interruption = target.addr == self.interruption_point
            || pre.is_some_and(|p| p.kind == InstrKind::Sysenter);
        let consistent_with_pre = pre.is_none_or(|p| {
            target.addr == p.addr
                // Asynchronous delivery resumes at the next instruction.
                || target.addr == p.fall_through()
                || p.kind.is_branch()
                || p.kind == InstrKind::Sysenter
        });
        (at_interruption && consistent_with_pre)
            || app_handler_pc == Some(target.addr)
            // Rseq abort handlers are entered through a direct jump.
            || target.kind == InstrKind::DirectJump
    }
}

/// Dual stacks tracking in-flight handler invocations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalStacks {
    interruption_points: Vec<u64>,
    pre_signal_instrs: Vec<Option<Instr>>,
}

impl SignalStacks {
    /// Create empty stacks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery
    pub fn push(&mut self, interruption_point: u64, pre_signal: Option<Instr>) {
        self.interruption_points.push(interruption_point);
        self.pre_signal_instrs.push(pre_signal);
    }

    /// Pop the innermost delivery, `None` on underflow
    pub fn pop(&mut self) -> Option<PendingReturn> {
        let interruption_point = self.interruption_points.pop()?;
        let pre_signal = self.pre_signal_instrs.pop().flatten();
        Some(PendingReturn {
            interruption_point,
            pre_signal,
        })
    }

    /// Current nesting depth
    #[must_use]
    pub fn depth(&self) -> usize {
        self.interruption_points.len()
    }

    /// No delivery in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interruption_points.is_empty()
    }
}

/// Countdowns driven by test-harness prefetch annotations
///
/// Annotated test apps encode "a signal arrives after N instructions" or
/// "after N memrefs" as prefetches of tiny addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationState {
    /// Instructions remaining before a kernel event is due
    pub instrs_until_interrupt: Option<u64>,
    /// Loads/stores remaining before a kernel event is due
    pub memrefs_until_interrupt: Option<u64>,
    /// Entry of the annotated app signal handler
    pub app_handler_pc: Option<u64>,
}

impl AnnotationState {
    /// Prefetch addresses below this are annotations, not real prefetches
    pub const ANNOTATION_LIMIT: u64 = 1024;

    /// A countdown reached zero and nothing else is still counting
    #[must_use]
    pub fn countdown_expired(&self) -> bool {
        matches!(
            (self.instrs_until_interrupt, self.memrefs_until_interrupt),
            (Some(0), None) | (None, Some(0)) | (Some(0), Some(0))
        )
    }

    /// Stop both countdowns
    pub fn reset_countdowns(&mut self) {
        self.instrs_until_interrupt = None;
        self.memrefs_until_interrupt = None;
    }

    /// Count one instruction; `false` if the countdown had already run out
    pub fn consume_instr(&mut self) -> bool {
        match self.instrs_until_interrupt {
            Some(0) => false,
            Some(n) => {
                self.instrs_until_interrupt = Some(n - 1);
                true
            }
            None => true,
        }
    }

    /// Count one load or store; `false` if the countdown had already run out
    pub fn consume_memref(&mut self) -> bool {
        match self.memrefs_until_interrupt {
            Some(0) => {
                self.memrefs_until_interrupt = None;
                false
            }
            Some(n) => {
                self.memrefs_until_interrupt = Some(n - 1);
                true
            }
            None => true,
        }
    }
}
