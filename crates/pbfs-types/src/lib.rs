#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const PBFS_MAGIC: u32 = 0x5042_4653; // "PBFS"
pub const PBFS_VERSION: u32 = 1;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_FRAGMENT_SIZE: u32 = 4096;
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

pub const MAX_NAMELEN: usize = 255;
pub const MAX_PATHLEN: usize = 4096;
pub const MAX_HOSTS: u32 = 64;
/// Largest data payload carried by one channel request.
pub const MAX_IOSIZE: usize = 4 * 1024 * 1024;
/// Open handles per environment.
pub const MAX_NFILE: usize = 1024;

/// Byte span of one host's range in the hostid lock file.
pub const HOSTID_LOCK_LEN: u64 = 1024;
/// Lock-file range held while a mount is being prepared (serializes growfs).
pub const HOSTID_RANGE_PREPARE: u32 = MAX_HOSTS + 1;
/// Lock-file range reserved for tool-mode mkfs/growfs.
pub const HOSTID_RANGE_TOOL: u32 = MAX_HOSTS + 2;

/// Physical block address on the device (allocation unit for file data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u64);

/// Logical block index within a file (position `index * block_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

/// Inode number. Equal to the inode record's allocator oid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ino(pub u64);

impl Ino {
    /// The root directory, allocated first by mkfs.
    pub const ROOT: Self = Self(0);
}

/// Allocator object id: a flat slot index within one metadata kind's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(pub u64);

/// Journal transaction id. Strictly increasing per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Host identity within one PBD cluster (0..MAX_HOSTS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

/// Fencing epoch. The highest epoch in the lease slots marks the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u32);

/// Per-slot generation stamp. Strictly increases every time a slot is
/// (re)allocated, so a stale reference can be detected by comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BirthTime(pub u64);

/// Byte offset on the device (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    #[must_use]
    pub fn align_down(self, alignment: u64) -> Option<Self> {
        align_down(self.0, alignment).map(Self)
    }

    #[must_use]
    pub fn align_up(self, alignment: u64) -> Option<Self> {
        align_up(self.0, alignment).map(Self)
    }

    #[must_use]
    pub fn is_aligned(self, alignment: u64) -> bool {
        alignment.is_power_of_two() && self.0 & (alignment - 1) == 0
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Validated device geometry: sector, fragment, block, and chunk sizes.
///
/// Invariants enforced at construction: all sizes are powers of two,
/// `fragment >= sector`, `block` is a multiple of `fragment`, and `chunk`
/// is a multiple of `block` holding at least two blocks (one metadata
/// header block plus data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    sector_size: u32,
    fragment_size: u32,
    block_size: u32,
    chunk_size: u64,
}

impl Geometry {
    pub fn new(
        sector_size: u32,
        fragment_size: u32,
        block_size: u32,
        chunk_size: u64,
    ) -> Result<Self, ParseError> {
        if !sector_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sector_size",
                reason: "must be a power of two",
            });
        }
        if !fragment_size.is_power_of_two() || fragment_size < sector_size {
            return Err(ParseError::InvalidField {
                field: "fragment_size",
                reason: "must be a power of two >= sector_size",
            });
        }
        if block_size == 0 || block_size % fragment_size != 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a non-zero multiple of fragment_size",
            });
        }
        if !block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two",
            });
        }
        if chunk_size == 0 || chunk_size % u64::from(block_size) != 0 {
            return Err(ParseError::InvalidField {
                field: "chunk_size",
                reason: "must be a non-zero multiple of block_size",
            });
        }
        if chunk_size / u64::from(block_size) < 2 {
            return Err(ParseError::InvalidField {
                field: "chunk_size",
                reason: "must hold at least two blocks",
            });
        }
        Ok(Self {
            sector_size,
            fragment_size,
            block_size,
            chunk_size,
        })
    }

    pub fn default_geometry() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn sector_size(self) -> u32 {
        self.sector_size
    }

    #[must_use]
    pub fn fragment_size(self) -> u32 {
        self.fragment_size
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn chunk_size(self) -> u64 {
        self.chunk_size
    }

    /// Blocks per chunk, metadata header blocks included.
    #[must_use]
    pub fn blocks_per_chunk(self) -> u64 {
        self.chunk_size / u64::from(self.block_size)
    }

    /// Byte offset of a physical block given the chunk region start.
    #[must_use]
    pub fn block_to_byte(self, chunk_start: ByteOffset, block: BlockNo) -> Option<ByteOffset> {
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .and_then(|rel| chunk_start.checked_add(rel))
    }

    /// Number of whole blocks needed to cover `size` bytes.
    #[must_use]
    pub fn blocks_for_size(self, size: u64) -> u64 {
        size.div_ceil(u64::from(self.block_size))
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::default_geometry()
    }
}

// ── Alignment and codec helpers ─────────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// Returns `None` on overflow or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── FD encoding ─────────────────────────────────────────────────────────────

/// Bit 30 distinguishes PBFS descriptors from kernel fds.
pub const FD_TAG: i32 = 1 << 30;

/// Tag a raw handle index as a PBFS descriptor.
#[must_use]
pub fn fd_make(raw: i32) -> i32 {
    raw | FD_TAG
}

/// Strip the PBFS tag, recovering the handle index.
#[must_use]
pub fn fd_raw(fd: i32) -> i32 {
    fd & !FD_TAG
}

/// Whether `fd` carries the PBFS tag (and is non-negative).
#[must_use]
pub fn fd_is_valid(fd: i32) -> bool {
    fd >= 0 && fd & FD_TAG != 0
}

// ── Interrupt ───────────────────────────────────────────────────────────────

/// Why an [`Interrupt`] checkpoint refused to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation aborted")]
    Aborted,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

/// Cooperative cancellation handle checked at every suspension point.
///
/// One `Interrupt` is shared mount-wide (force-umount trips the abort flag);
/// an operation-scoped deadline can be layered on top with
/// [`with_deadline`](Self::with_deadline). Checkpoints are cheap: one atomic
/// load plus an `Instant` comparison when a deadline is set.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    abort: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Interrupt {
    /// A handle that never aborts and never expires.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A fresh abortable handle with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share this handle's abort flag but bound the operation by `timeout`.
    #[must_use]
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        Self {
            abort: Arc::clone(&self.abort),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Trip the abort flag. Every clone sharing this handle observes it.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Refuse to continue if aborted or past the deadline.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_aborted() {
            return Err(Interrupted::Aborted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Interrupted::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Time remaining before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
