//! File-type flags carried by the filetype marker.

use serde::{Deserialize, Serialize};

/// Bit set describing how a trace file was produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileType(u64);

impl FileType {
    /// No special properties
    pub const DEFAULT: Self = Self(0x00);
    /// Data references were filtered (e.g. through a cache)
    pub const FILTERED: Self = Self(0x01);
    /// Built without tracer optimizations
    pub const NO_OPTIMIZATIONS: Self = Self(0x02);
    /// Instruction fetches only, no data references
    pub const INSTRUCTION_ONLY: Self = Self(0x04);
    /// AArch64 trace
    pub const ARCH_AARCH64: Self = Self(0x08);
    /// ARM32 trace
    pub const ARCH_ARM32: Self = Self(0x10);
    /// 32-bit x86 trace
    pub const ARCH_X86_32: Self = Self(0x20);
    /// 64-bit x86 trace
    pub const ARCH_X86_64: Self = Self(0x40);
    /// Instruction fetches were filtered
    pub const IFILTERED: Self = Self(0x80);
    /// Data fetches were filtered
    pub const DFILTERED: Self = Self(0x100);
    /// Instruction records carry raw encodings
    pub const ENCODINGS: Self = Self(0x200);
    /// Syscall number markers are present
    pub const SYSCALL_NUMBERS: Self = Self(0x400);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::FILTERED, "filtered"),
        (Self::NO_OPTIMIZATIONS, "no-opts"),
        (Self::INSTRUCTION_ONLY, "instr-only"),
        (Self::ARCH_AARCH64, "aarch64"),
        (Self::ARCH_ARM32, "arm32"),
        (Self::ARCH_X86_32, "x86_32"),
        (Self::ARCH_X86_64, "x86_64"),
        (Self::IFILTERED, "ifiltered"),
        (Self::DFILTERED, "dfiltered"),
        (Self::ENCODINGS, "encodings"),
        (Self::SYSCALL_NUMBERS, "syscall-numbers"),
    ];

    /// Create from the raw marker value
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Whether any bit of `mask` is set
    #[must_use]
    pub const fn contains_any(&self, mask: Self) -> bool {
        self.0 & mask.0 != 0
    }

    /// Union of two flag sets
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Some records were deliberately omitted
    #[must_use]
    pub const fn is_filtered(&self) -> bool {
        self.contains_any(Self::FILTERED.union(Self::IFILTERED))
    }

    /// Instruction records carry raw encoding bytes
    #[must_use]
    pub const fn has_encodings(&self) -> bool {
        self.contains_any(Self::ENCODINGS)
    }
}

impl std::ops::BitOr for FileType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("default");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains_any(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}
