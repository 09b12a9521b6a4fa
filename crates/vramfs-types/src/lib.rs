#![forbid(unsafe_code)]
//! Shared vocabulary for the vramfs workspace.
//!
//! The block-size constant, entry kinds and lookup filters, the statfs
//! record, and byte-size parsing for the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

/// Size of one VRAM block in bytes.
///
/// Chosen to match the largest read/write request size the kernel FUSE
/// layer typically issues, so most transfers touch exactly one block.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Unit for the `st_blocks` field of stat results.
pub const STAT_BLOCK_UNIT: u64 = 512;

/// Maximum entry name length reported through statfs.
pub const NAME_MAX: u32 = 255;

/// The kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// Bitmask of entry kinds accepted by a path lookup.
///
/// Lookups that resolve to an entry outside the filter report an error
/// chosen by the combination of actual kind and filter; see the resolver
/// in `vramfs-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindFilter(u8);

impl KindFilter {
    pub const NONE: Self = Self(0);
    pub const FILE: Self = Self(1);
    pub const DIRECTORY: Self = Self(2);
    pub const SYMLINK: Self = Self(4);
    pub const ANY: Self = Self(1 | 2 | 4);

    /// Filter matching exactly one kind.
    #[must_use]
    pub fn of(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => Self::FILE,
            EntryKind::Directory => Self::DIRECTORY,
            EntryKind::Symlink => Self::SYMLINK,
        }
    }

    /// Whether an entry of `kind` passes this filter.
    #[must_use]
    pub fn contains(self, kind: EntryKind) -> bool {
        self.0 & Self::of(kind).0 != 0
    }

    /// Whether the two filters share any kind.
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// A filter accepting no kind matches nothing.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for KindFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Filesystem-wide statistics, as reported through statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    /// Size of one block in bytes.
    pub block_size: u32,
    /// Total blocks ever allocated into the pool.
    pub total_blocks: u64,
    /// Blocks currently on the free list.
    pub free_blocks: u64,
    /// Number of live entries, the root included.
    pub entries: u64,
    /// Maximum name length.
    pub name_max: u32,
}

// ── Byte-size parsing ───────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size")]
    Empty,
    #[error("invalid number in size {0:?}")]
    InvalidNumber(String),
    #[error("unknown size suffix {0:?}")]
    UnknownSuffix(String),
    #[error("size overflows u64")]
    Overflow,
}

/// Parse a human byte size: an integer with an optional suffix.
///
/// `K`/`M`/`G` are binary multipliers (1024ⁿ); `KB`/`MB`/`GB` are decimal
/// (1000ⁿ). Suffixes are case-insensitive; a bare integer is bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);

    let value: u64 = digits
        .parse()
        .map_err(|_| SizeParseError::InvalidNumber(trimmed.to_owned()))?;

    let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        other => return Err(SizeParseError::UnknownSuffix(other.to_owned())),
    };

    value.checked_mul(multiplier).ok_or(SizeParseError::Overflow)
}
