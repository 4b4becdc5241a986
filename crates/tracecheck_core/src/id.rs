//! Identifiers for trace entities.
//!
//! Thread and cpu ids are raw integers taken from the trace; the newtypes only
//! keep them from being mixed up.

use serde::{Deserialize, Serialize};

/// Thread identifier as recorded in the trace (0 means "not known")
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create from raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this id carries a real thread
    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for ThreadId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Cpu identifier carried by cpu-id markers
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CpuId(u64);

impl CpuId {
    /// Create from raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<u64> for CpuId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Key a shard is registered under
///
/// Parallel workers are handed an index by the dispatch framework; in serial
/// mode the shard is discovered lazily from the first record of each thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKey {
    /// Parallel-mode shard index
    Index(usize),
    /// Serial-mode thread id
    Thread(ThreadId),
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "shard#{}", index),
            Self::Thread(tid) => write!(f, "shard@{}", tid),
        }
    }
}
