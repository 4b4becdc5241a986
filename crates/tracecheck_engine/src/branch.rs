//! Direct-branch target resolution.
//!
//! Resolving a target means decoding the instruction, which is comparatively
//! expensive, so results are memoized per trace address. A record carrying a
//! fresh encoding for an address evicts that address first: the code there
//! may have changed.

use std::collections::HashMap;
use tracecheck_log::Instr;

/// Errors from branch-target decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BranchDecodeError {
    /// No encoding bytes were recorded and nothing is cached
    #[error("no encoding recorded for {pc:#x}")]
    MissingEncoding {
        /// Trace address
        pc: u64,
    },
    /// Encoding ended before the displacement
    #[error("encoding at {pc:#x} is truncated")]
    Truncated {
        /// Trace address
        pc: u64,
    },
    /// Opcode is not a direct branch this decoder understands
    #[error("opcode {opcode:#04x} at {pc:#x} is not a direct branch")]
    NotDirectBranch {
        /// Trace address
        pc: u64,
        /// First non-prefix byte
        opcode: u8,
    },
}

/// Resolves the target of a direct branch from its encoding
pub trait BranchDecoder: Send + Sync {
    /// Target address of the branch at `pc` encoded as `encoding`
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a decodable direct branch
    fn decode_target(&self, pc: u64, encoding: &[u8]) -> Result<u64, BranchDecodeError>;
}

/// Memoized branch targets for one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchTargetCache {
    targets: HashMap<u64, u64>,
}

impl BranchTargetCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached target for `pc`
    #[must_use]
    pub fn get(&self, pc: u64) -> Option<u64> {
        self.targets.get(&pc).copied()
    }

    /// Drop whatever is cached for `pc`
    pub fn evict(&mut self, pc: u64) {
        self.targets.remove(&pc);
    }

    /// Number of cached addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target of `branch`, decoding and caching on a miss
    ///
    /// # Errors
    ///
    /// Returns error if the branch must be decoded and cannot be
    pub fn resolve(
        &mut self,
        branch: &Instr,
        decoder: &dyn BranchDecoder,
    ) -> Result<u64, BranchDecodeError> {
        let pc = branch.addr;
        if branch.encoding_is_new {
            self.evict(pc);
        }
        if let Some(target) = self.get(pc) {
            return Ok(target);
        }
        let encoding = branch
            .encoding
            .as_deref()
            .ok_or(BranchDecodeError::MissingEncoding { pc })?;
        let target = decoder.decode_target(pc, encoding)?;
        self.targets.insert(pc, target);
        Ok(target)
    }
}

/// Decoder for x86 relative branches
///
/// Understands `jmp rel8/rel32`, `call rel32`, `jcc rel8/rel32`, and
/// `loop`/`jcxz rel8`, after any legacy or REX prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86BranchDecoder;

impl X86BranchDecoder {
    fn is_prefix(byte: u8) -> bool {
        matches!(
            byte,
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3
        ) || (0x40..=0x4f).contains(&byte)
    }

    fn rel8(bytes: &[u8], at: usize, pc: u64) -> Result<i64, BranchDecodeError> {
        bytes
            .get(at)
            .map(|b| i64::from(*b as i8))
            .ok_or(BranchDecodeError::Truncated { pc })
    }

    fn rel32(bytes: &[u8], at: usize, pc: u64) -> Result<i64, BranchDecodeError> {
        bytes
            .get(at..at + 4)
            .and_then(|s| <[u8; 4]>::try_from(s).ok())
            .map(|raw| i64::from(i32::from_le_bytes(raw)))
            .ok_or(BranchDecodeError::Truncated { pc })
    }
}

impl BranchDecoder for X86BranchDecoder {
    fn decode_target(&self, pc: u64, encoding: &[u8]) -> Result<u64, BranchDecodeError> {
        let start = encoding
            .iter()
            .position(|b| !Self::is_prefix(*b))
            .ok_or(BranchDecodeError::Truncated { pc })?;
        let opcode = encoding[start];
        let (displacement, length) = match opcode {
            0x70..=0x7f | 0xe0..=0xe3 | 0xeb => (Self::rel8(encoding, start + 1, pc)?, start + 2),
            0xe8 | 0xe9 => (Self::rel32(encoding, start + 1, pc)?, start + 5),
            0x0f => match encoding.get(start + 1) {
                Some(0x80..=0x8f) => (Self::rel32(encoding, start + 2, pc)?, start + 6),
                Some(_) => return Err(BranchDecodeError::NotDirectBranch { pc, opcode }),
                None => return Err(BranchDecodeError::Truncated { pc }),
            },
            _ => return Err(BranchDecodeError::NotDirectBranch { pc, opcode }),
        };
        Ok(pc
            .wrapping_add(length as u64)
            .wrapping_add_signed(displacement))
    }
}
