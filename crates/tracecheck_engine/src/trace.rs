//! In-memory trace source.
//!
//! [`TraceReader`] hands out the records of one stream in order and keeps a
//! [`StreamCursor`] in step, so the engine has ground-truth ordinals to
//! cross-check against.

use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracecheck_core::ThreadId;
use tracecheck_log::{StreamCursor, StreamHeader, StreamMetadata, TraceRecord};

/// Sequential reader over one stream of records
#[derive(Debug)]
pub struct TraceReader {
    /// Records not yet delivered
    buffer: VecDeque<TraceRecord>,
    /// Ordinals and header seen by consumers
    cursor: Arc<StreamCursor>,
    /// Records in the stream
    total: usize,
}

impl TraceReader {
    /// Create a reader; the header is taken from the leading markers
    #[must_use]
    pub fn from_records(records: Vec<TraceRecord>) -> Self {
        let header = StreamHeader::scan(&records);
        Self::with_header(records, header)
    }

    /// Create a reader reporting an explicit header
    #[must_use]
    pub fn with_header(records: Vec<TraceRecord>, header: StreamHeader) -> Self {
        let total = records.len();
        Self {
            buffer: records.into(),
            cursor: Arc::new(StreamCursor::new(header)),
            total,
        }
    }

    /// Stream metadata to hand to the engine
    #[must_use]
    pub fn stream(&self) -> Arc<dyn StreamMetadata> {
        self.cursor.clone()
    }

    /// The cursor itself
    #[must_use]
    pub fn cursor(&self) -> &Arc<StreamCursor> {
        &self.cursor
    }

    /// Deliver the next record, advancing the cursor first
    pub fn next_record(&mut self) -> Option<TraceRecord> {
        let record = self.buffer.pop_front()?;
        self.cursor.advance(&record);
        Some(record)
    }

    /// Skip `count` counted instructions and everything before them
    ///
    /// Skipped records still advance the ordinals. Returns the number of
    /// instructions actually skipped.
    pub fn skip_instructions(&mut self, count: u64) -> u64 {
        let mut skipped = 0;
        while skipped < count {
            let Some(record) = self.buffer.pop_front() else {
                break;
            };
            self.cursor.advance(&record);
            if record.is_counted_instr() {
                skipped += 1;
            }
        }
        tracing::debug!(requested = count, skipped, "skipped leading instructions");
        skipped
    }

    /// Records left to deliver
    #[must_use]
    pub fn has_more(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Number of records left
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Number of records in the stream
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for TraceReader {
    type Item = TraceRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

/// Split an interleaved trace into per-thread streams, in first-seen order
#[must_use]
pub fn split_by_thread(records: Vec<TraceRecord>) -> IndexMap<ThreadId, Vec<TraceRecord>> {
    let mut shards: IndexMap<ThreadId, Vec<TraceRecord>> = IndexMap::new();
    for record in records {
        shards.entry(record.tid).or_default().push(record);
    }
    shards
}
