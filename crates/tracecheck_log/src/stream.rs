//! Stream metadata for cross-checking a record sequence.
//!
//! A trace reader knows where it is in the stream and what the trace header
//! said. The invariant engine compares its own bookkeeping against that view
//! but never treats it as the truth being validated.

use crate::record::{MarkerKind, TraceRecord};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracecheck_core::FileType;

/// Ground-truth view a trace reader exposes for one stream
pub trait StreamMetadata: Send + Sync {
    /// 1-based ordinal of the record most recently delivered
    fn record_ordinal(&self) -> u64;
    /// Counted instructions delivered so far, including skipped ones
    fn instruction_ordinal(&self) -> u64;
    /// File-type flags from the header
    fn filetype(&self) -> FileType;
    /// Cache line size from the header
    fn cache_line_size(&self) -> u64;
    /// Page size from the header
    fn page_size(&self) -> u64;
    /// Trace format version from the header
    fn version(&self) -> u64;
    /// Instructions per chunk from the header
    fn chunk_instr_count(&self) -> u64;
}

/// Header properties a reader learns from the leading markers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// File-type flags
    pub filetype: FileType,
    /// Cache line size
    pub cache_line_size: u64,
    /// Page size
    pub page_size: u64,
    /// Format version
    pub version: u64,
    /// Instructions per chunk
    pub chunk_instr_count: u64,
}

impl StreamHeader {
    /// Collect header markers that precede the first instruction
    #[must_use]
    pub fn scan(records: &[TraceRecord]) -> Self {
        let mut header = Self::default();
        for record in records {
            if record.as_instr().is_some() {
                break;
            }
            let Some(marker) = record.as_marker() else {
                continue;
            };
            match marker.kind {
                MarkerKind::Filetype => header.filetype = FileType::from_bits(marker.value),
                MarkerKind::CacheLineSize => header.cache_line_size = marker.value,
                MarkerKind::PageSize => header.page_size = marker.value,
                MarkerKind::Version => header.version = marker.value,
                MarkerKind::ChunkInstrCount => header.chunk_instr_count = marker.value,
                _ => {}
            }
        }
        header
    }
}

/// Ordinal counters plus header, advanced by the reader as it delivers
///
/// Counters are atomics so one cursor can be shared between the reader and
/// the shard state that cross-checks against it.
#[derive(Debug, Default)]
pub struct StreamCursor {
    header: StreamHeader,
    records: AtomicU64,
    instrs: AtomicU64,
}

impl StreamCursor {
    /// Create a cursor positioned before the first record
    #[must_use]
    pub fn new(header: StreamHeader) -> Self {
        Self {
            header,
            records: AtomicU64::new(0),
            instrs: AtomicU64::new(0),
        }
    }

    /// Header this cursor reports
    #[must_use]
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Account for one delivered (or skipped) record
    pub fn advance(&self, record: &TraceRecord) {
        self.records.fetch_add(1, Ordering::Relaxed);
        if record.is_counted_instr() {
            self.instrs.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl StreamMetadata for StreamCursor {
    fn record_ordinal(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    fn instruction_ordinal(&self) -> u64 {
        self.instrs.load(Ordering::Relaxed)
    }

    fn filetype(&self) -> FileType {
        self.header.filetype
    }

    fn cache_line_size(&self) -> u64 {
        self.header.cache_line_size
    }

    fn page_size(&self) -> u64 {
        self.header.page_size
    }

    fn version(&self) -> u64 {
        self.header.version
    }

    fn chunk_instr_count(&self) -> u64 {
        self.header.chunk_instr_count
    }
}
