//! tracecheck core types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything the invariant engine and the schedule reconciler share lives here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filetype;
pub mod id;
pub mod schedule;

// Re-exports
pub use error::{CoreError, CoreResult, Violation, ViolationKind};
pub use filetype::FileType;
pub use id::{CpuId, ShardKey, ThreadId};
pub use schedule::ScheduleEntry;
