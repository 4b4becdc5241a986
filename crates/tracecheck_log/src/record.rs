//! Trace record types.
//!
//! A trace is an ordered stream of [`TraceRecord`]s. Records are immutable
//! once produced; consumers keep their own copies for lookback.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tracecheck_core::{CoreError, CoreResult, ThreadId};

/// Branch class of an instruction fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrKind {
    /// Not a control transfer
    Plain,
    /// Unconditional jump with an encoded target
    DirectJump,
    /// Jump through a register or memory
    IndirectJump,
    /// Conditional jump with an encoded target
    Conditional,
    /// Call with an encoded target
    DirectCall,
    /// Call through a register or memory
    IndirectCall,
    /// Function return
    Return,
    /// System call entry
    Sysenter,
    /// Repeated string-instruction iteration that did not fetch
    NoFetch,
}

impl InstrKind {
    /// Counted toward the instruction ordinal
    #[must_use]
    pub const fn is_counted(self) -> bool {
        !matches!(self, Self::NoFetch)
    }

    /// Any control transfer except sysenter
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            Self::DirectJump
                | Self::IndirectJump
                | Self::Conditional
                | Self::DirectCall
                | Self::IndirectCall
                | Self::Return
        )
    }

    /// Branch whose target is encoded in the instruction
    #[must_use]
    pub const fn is_direct_branch(self) -> bool {
        matches!(self, Self::DirectJump | Self::Conditional | Self::DirectCall)
    }

    /// Direct or indirect call
    #[must_use]
    pub const fn is_call(self) -> bool {
        matches!(self, Self::DirectCall | Self::IndirectCall)
    }
}

/// An instruction fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    /// Program counter
    pub addr: u64,
    /// Length in bytes
    pub size: u32,
    /// Branch class
    pub kind: InstrKind,
    /// Raw encoding, when the trace records one
    #[serde(default)]
    pub encoding: Option<Bytes>,
    /// The encoding differs from whatever was last seen at this address
    #[serde(default)]
    pub encoding_is_new: bool,
}

impl Instr {
    /// Create an instruction without encoding bytes
    #[must_use]
    pub fn new(addr: u64, size: u32, kind: InstrKind) -> Self {
        Self {
            addr,
            size,
            kind,
            encoding: None,
            encoding_is_new: false,
        }
    }

    /// Attach a fresh encoding
    #[must_use]
    pub fn with_encoding(mut self, encoding: impl Into<Bytes>) -> Self {
        self.encoding = Some(encoding.into());
        self.encoding_is_new = true;
        self
    }

    /// Attach an encoding already seen at this address
    #[must_use]
    pub fn with_repeated_encoding(mut self, encoding: impl Into<Bytes>) -> Self {
        self.encoding = Some(encoding.into());
        self.encoding_is_new = false;
        self
    }

    /// Address of the next sequential instruction
    #[must_use]
    pub fn fall_through(&self) -> u64 {
        self.addr.wrapping_add(u64::from(self.size))
    }
}

/// Prefetch flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefetchHint {
    /// Generic prefetch
    Generic,
    /// Prefetch into all cache levels
    T0,
    /// Prefetch into L2 and up
    T1,
    /// Prefetch into L3 and up
    T2,
    /// Non-temporal prefetch
    Nta,
}

/// Data access flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// Load
    Read,
    /// Store
    Write,
    /// Prefetch
    Prefetch(PrefetchHint),
}

/// A data reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccess {
    /// Access flavour
    pub kind: AccessKind,
    /// Virtual address
    pub addr: u64,
    /// Access size in bytes
    #[serde(default)]
    pub size: u32,
}

impl DataAccess {
    /// Load or store, as opposed to a prefetch
    #[must_use]
    pub const fn is_read_or_write(&self) -> bool {
        matches!(self.kind, AccessKind::Read | AccessKind::Write)
    }

    /// Prefetch of the given flavour
    #[must_use]
    pub fn is_prefetch(&self, hint: PrefetchHint) -> bool {
        self.kind == AccessKind::Prefetch(hint)
    }
}

/// Marker subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// Wall-clock timestamp
    Timestamp,
    /// Cpu the thread is running on
    CpuId,
    /// Asynchronous transfer into a handler; value is the interrupted pc
    KernelEvent,
    /// Return from a handler; value is the pc the kernel resumes at
    KernelXfer,
    /// File-type flags
    Filetype,
    /// Running instruction count
    InstructionCount,
    /// Cache line size
    CacheLineSize,
    /// Page size
    PageSize,
    /// Trace format version
    Version,
    /// Instructions per chunk
    ChunkInstrCount,
    /// End of a chunk
    ChunkFooter,
    /// Tracing window identifier
    WindowId,
    /// Physical address of the following virtual address
    PhysicalAddress,
    /// Virtual address paired with the preceding physical address
    VirtualAddress,
    /// Restartable-sequence abort; value is the aborted pc
    RseqAbort,
    /// Traced function identifier
    FuncId,
    /// Traced function return address
    FuncRetaddr,
    /// Traced function argument
    FuncArg,
    /// Traced function return value
    FuncRetval,
    /// Any subtype the checker does not interpret
    Other(u16),
}

impl MarkerKind {
    /// One of the function-tracing markers
    #[must_use]
    pub const fn is_function_marker(self) -> bool {
        matches!(
            self,
            Self::FuncId | Self::FuncRetaddr | Self::FuncArg | Self::FuncRetval
        )
    }

    /// Kernel event or kernel xfer
    #[must_use]
    pub const fn is_kernel_transfer(self) -> bool {
        matches!(self, Self::KernelEvent | Self::KernelXfer)
    }
}

/// An out-of-band marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Subtype
    pub kind: MarkerKind,
    /// Payload
    pub value: u64,
}

/// What a record carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordBody {
    /// Instruction fetch
    Instr(Instr),
    /// Data reference
    Data(DataAccess),
    /// Marker
    Marker(Marker),
    /// End of the thread's stream
    ThreadExit,
}

/// One trace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Process id
    #[serde(default)]
    pub pid: u64,
    /// Thread id
    pub tid: ThreadId,
    /// Payload
    pub body: RecordBody,
}

impl TraceRecord {
    /// Create an instruction record
    #[must_use]
    pub fn instr(tid: ThreadId, instr: Instr) -> Self {
        Self {
            pid: 0,
            tid,
            body: RecordBody::Instr(instr),
        }
    }

    /// Create a data reference record
    #[must_use]
    pub fn data(tid: ThreadId, kind: AccessKind, addr: u64) -> Self {
        Self {
            pid: 0,
            tid,
            body: RecordBody::Data(DataAccess {
                kind,
                addr,
                size: 0,
            }),
        }
    }

    /// Create a marker record
    #[must_use]
    pub fn marker(tid: ThreadId, kind: MarkerKind, value: u64) -> Self {
        Self {
            pid: 0,
            tid,
            body: RecordBody::Marker(Marker { kind, value }),
        }
    }

    /// Create a thread-exit record
    #[must_use]
    pub fn thread_exit(tid: ThreadId) -> Self {
        Self {
            pid: 0,
            tid,
            body: RecordBody::ThreadExit,
        }
    }

    /// Set the process id
    #[must_use]
    pub fn with_pid(mut self, pid: u64) -> Self {
        self.pid = pid;
        self
    }

    /// Instruction payload, if any
    #[must_use]
    pub fn as_instr(&self) -> Option<&Instr> {
        match &self.body {
            RecordBody::Instr(instr) => Some(instr),
            _ => None,
        }
    }

    /// Data payload, if any
    #[must_use]
    pub fn as_data(&self) -> Option<&DataAccess> {
        match &self.body {
            RecordBody::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Marker payload, if any
    #[must_use]
    pub fn as_marker(&self) -> Option<&Marker> {
        match &self.body {
            RecordBody::Marker(marker) => Some(marker),
            _ => None,
        }
    }

    /// Marker value when this is a marker of `kind`
    #[must_use]
    pub fn marker_value(&self, kind: MarkerKind) -> Option<u64> {
        self.as_marker().filter(|m| m.kind == kind).map(|m| m.value)
    }

    /// Whether this is a marker of `kind`
    #[must_use]
    pub fn is_marker(&self, kind: MarkerKind) -> bool {
        self.marker_value(kind).is_some()
    }

    /// Whether this is an instruction counted toward the ordinal
    #[must_use]
    pub fn is_counted_instr(&self) -> bool {
        self.as_instr().is_some_and(|i| i.kind.is_counted())
    }

    /// Whether this is the thread-exit sentinel
    #[must_use]
    pub fn is_thread_exit(&self) -> bool {
        matches!(self.body, RecordBody::ThreadExit)
    }

    /// Parse one JSON record per line, skipping blank lines
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or a malformed line
    pub fn read_json_lines<R: BufRead>(reader: R) -> CoreResult<Vec<Self>> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| CoreError::Parse {
                line: index + 1,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        tracing::debug!(count = records.len(), "parsed trace records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TID: ThreadId = ThreadId::new(3);

    #[test]
    fn test_instr_kind_classes() {
        assert!(InstrKind::Conditional.is_direct_branch());
        assert!(InstrKind::Conditional.is_branch());
        assert!(InstrKind::Return.is_branch());
        assert!(!InstrKind::Return.is_direct_branch());
        assert!(!InstrKind::Sysenter.is_branch());
        assert!(!InstrKind::NoFetch.is_counted());
        assert!(InstrKind::IndirectCall.is_call());
    }

    #[test]
    fn test_fall_through() {
        let instr = Instr::new(0x1000, 5, InstrKind::Plain);
        assert_eq!(instr.fall_through(), 0x1005);
    }

    #[test]
    fn test_with_encoding_marks_new() {
        let instr = Instr::new(0x10, 2, InstrKind::DirectJump).with_encoding(vec![0xeb, 0x00]);
        assert!(instr.encoding_is_new);
        let again = Instr::new(0x10, 2, InstrKind::DirectJump)
            .with_repeated_encoding(vec![0xeb, 0x00]);
        assert!(!again.encoding_is_new);
        assert_eq!(instr.encoding, again.encoding);
    }

    #[test]
    fn test_marker_accessors() {
        let rec = TraceRecord::marker(TID, MarkerKind::Timestamp, 99);
        assert_eq!(rec.marker_value(MarkerKind::Timestamp), Some(99));
        assert_eq!(rec.marker_value(MarkerKind::CpuId), None);
        assert!(rec.is_marker(MarkerKind::Timestamp));
        assert!(rec.as_instr().is_none());
    }

    #[test]
    fn test_marker_classes() {
        assert!(MarkerKind::FuncRetval.is_function_marker());
        assert!(!MarkerKind::Timestamp.is_function_marker());
        assert!(MarkerKind::KernelXfer.is_kernel_transfer());
        assert!(!MarkerKind::RseqAbort.is_kernel_transfer());
    }

    #[test]
    fn test_data_predicates() {
        let read = TraceRecord::data(TID, AccessKind::Read, 0x40);
        assert!(read.as_data().unwrap().is_read_or_write());
        let pf = TraceRecord::data(TID, AccessKind::Prefetch(PrefetchHint::T1), 3);
        assert!(pf.as_data().unwrap().is_prefetch(PrefetchHint::T1));
        assert!(!pf.as_data().unwrap().is_read_or_write());
    }

    #[test]
    fn test_read_json_lines() {
        let input = concat!(
            r#"{"tid":3,"body":{"Marker":{"kind":"Timestamp","value":5}}}"#,
            "\n\n",
            r#"{"pid":1,"tid":3,"body":{"Instr":{"addr":4096,"size":4,"kind":"Plain"}}}"#,
            "\n",
            r#"{"tid":3,"body":"ThreadExit"}"#,
            "\n",
        );
        let records = TraceRecord::read_json_lines(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].marker_value(MarkerKind::Timestamp), Some(5));
        assert_eq!(records[1].pid, 1);
        assert_eq!(records[1].as_instr().unwrap().addr, 4096);
        assert!(records[2].is_thread_exit());
    }

    #[test]
    fn test_read_json_lines_reports_line() {
        let input = "{\"tid\":3,\"body\":\"ThreadExit\"}\nnot json\n";
        let err = TraceRecord::read_json_lines(input.as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::Parse { line: 2, .. }));
    }
}
