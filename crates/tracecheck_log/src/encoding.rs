//! Fixed-size binary encoding for schedule entries.
//!
//! Canonical schedule files are a flat sequence of 32-byte little-endian
//! records: thread, timestamp, cpu, instruction count, each a `u64`.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read, Write};
use tracecheck_core::{CoreError, CoreResult, CpuId, ScheduleEntry, ThreadId};

/// Encoded size of one schedule entry
pub const SCHEDULE_ENTRY_SIZE: usize = 32;

/// Append the canonical encoding of `entry` to `buf`
pub fn encode_entry<B: BufMut>(entry: &ScheduleEntry, buf: &mut B) {
    buf.put_u64_le(entry.thread.as_u64());
    buf.put_u64_le(entry.timestamp);
    buf.put_u64_le(entry.cpu.as_u64());
    buf.put_u64_le(entry.instr_count);
}

/// Decode one entry from the front of `buf`
///
/// # Errors
///
/// Returns [`CoreError::Truncated`] if fewer than 32 bytes remain
pub fn decode_entry<B: Buf>(buf: &mut B) -> CoreResult<ScheduleEntry> {
    if buf.remaining() < SCHEDULE_ENTRY_SIZE {
        return Err(CoreError::Truncated {
            needed: SCHEDULE_ENTRY_SIZE,
            available: buf.remaining(),
        });
    }
    let thread = ThreadId::new(buf.get_u64_le());
    let timestamp = buf.get_u64_le();
    let cpu = CpuId::new(buf.get_u64_le());
    let instr_count = buf.get_u64_le();
    Ok(ScheduleEntry::new(thread, timestamp, cpu, instr_count))
}

/// Encode a whole schedule into one buffer
#[must_use]
pub fn encode_all(entries: &[ScheduleEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * SCHEDULE_ENTRY_SIZE);
    for entry in entries {
        encode_entry(entry, &mut buf);
    }
    buf.to_vec()
}

/// Streaming schedule writer
pub struct ScheduleEncoder<W> {
    writer: W,
    scratch: BytesMut,
}

impl<W: Write> ScheduleEncoder<W> {
    /// Create a new encoder
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: BytesMut::with_capacity(SCHEDULE_ENTRY_SIZE),
        }
    }

    /// Write one entry
    ///
    /// # Errors
    ///
    /// Returns error if the underlying writer fails
    pub fn encode(&mut self, entry: &ScheduleEntry) -> io::Result<()> {
        self.scratch.clear();
        encode_entry(entry, &mut self.scratch);
        self.writer.write_all(&self.scratch)
    }

    /// Flush the writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Consume and return the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Streaming schedule reader
pub struct ScheduleDecoder<R> {
    reader: R,
    decoded: usize,
}

impl<R: Read> ScheduleDecoder<R> {
    /// Create a new decoder
    pub fn new(reader: R) -> Self {
        Self { reader, decoded: 0 }
    }

    /// Entries decoded so far
    #[must_use]
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Decode the next entry, `None` at a clean end of input
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or when input ends mid-entry
    pub fn next_entry(&mut self) -> CoreResult<Option<ScheduleEntry>> {
        let mut raw = [0u8; SCHEDULE_ENTRY_SIZE];
        let mut filled = 0;
        while filled < SCHEDULE_ENTRY_SIZE {
            match self.reader.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        let entry = decode_entry(&mut &raw[..filled])?;
        self.decoded += 1;
        Ok(Some(entry))
    }
}

impl<R: Read> Iterator for ScheduleDecoder<R> {
    type Item = CoreResult<ScheduleEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(tid: u64, ts: u64, cpu: u64, count: u64) -> ScheduleEntry {
        ScheduleEntry::new(ThreadId::new(tid), ts, CpuId::new(cpu), count)
    }

    #[test]
    fn test_layout_is_little_endian() {
        let bytes = encode_all(&[entry(1, 2, 3, 4)]);
        assert_eq!(bytes.len(), SCHEDULE_ENTRY_SIZE);
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &4u64.to_le_bytes());
    }

    #[test]
    fn test_streaming_encode_decode() {
        let entries = vec![entry(10, 100, 0, 5), entry(11, 200, 1, 0)];
        let mut encoder = ScheduleEncoder::new(Vec::new());
        for e in &entries {
            encoder.encode(e).unwrap();
        }
        let buffer = encoder.into_inner();

        let decoder = ScheduleDecoder::new(buffer.as_slice());
        let decoded: Vec<_> = decoder.collect::<CoreResult<_>>().unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_empty_input() {
        let mut decoder = ScheduleDecoder::new(&[][..]);
        assert_eq!(decoder.next_entry().unwrap(), None);
        assert_eq!(decoder.decoded(), 0);
    }

    #[test]
    fn test_trailing_partial_entry_is_an_error() {
        let mut bytes = encode_all(&[entry(1, 1, 1, 1)]);
        bytes.extend_from_slice(&[0xAA; 7]);
        let mut decoder = ScheduleDecoder::new(bytes.as_slice());
        assert!(decoder.next_entry().unwrap().is_some());
        let err = decoder.next_entry().unwrap_err();
        assert_eq!(
            err,
            CoreError::Truncated {
                needed: SCHEDULE_ENTRY_SIZE,
                available: 7
            }
        );
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(tid: u64, ts: u64, cpu: u64, count: u64) {
            let original = entry(tid, ts, cpu, count);
            let bytes = encode_all(&[original]);
            let decoded = decode_entry(&mut bytes.as_slice()).unwrap();
            prop_assert_eq!(decoded, original);
        }
    }
}
