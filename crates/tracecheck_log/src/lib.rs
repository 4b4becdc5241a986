//! tracecheck trace log
//!
//! The record model the invariant engine consumes, the fixed-size binary
//! codec for canonical schedule files, and the stream metadata interface a
//! trace reader exposes for cross-checking.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod record;
pub mod stream;

pub use encoding::{encode_all, ScheduleDecoder, ScheduleEncoder, SCHEDULE_ENTRY_SIZE};
pub use record::{
    AccessKind, DataAccess, Instr, InstrKind, Marker, MarkerKind, PrefetchHint, RecordBody,
    TraceRecord,
};
pub use stream::{StreamCursor, StreamHeader, StreamMetadata};
