//! tracecheck invariant engine
//!
//! Per-shard validation of trace record streams.
//! Schedule reconciliation against canonical schedule files.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod engine;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod shard;
pub mod signal;
pub mod trace;

pub use branch::{BranchDecodeError, BranchDecoder, BranchTargetCache, X86BranchDecoder};
pub use engine::{CheckerConfig, InvariantChecker};
pub use reconcile::{MergedSchedule, ReconcileOutcome, ScheduleReconciler};
pub use registry::{ShardHandle, ShardRegistry};
pub use report::CheckReport;
pub use shard::{ShardState, ShardTimeline};
pub use signal::{AnnotationState, SignalStacks};
pub use trace::{split_by_thread, TraceReader};
