#![forbid(unsafe_code)]
//! On-disk layout of a PBD and the metadata record codecs.
//!
//! Regions in device order: the superblock (sector 0), the hostid fence
//! slots, the journal extent, then fixed-size chunks. Each chunk leads with
//! a metadata header holding three allocator nodes (inode, block tag,
//! directory entry), each a bitmap plus a packed record array; the remaining
//! blocks of the chunk carry file data.
//!
//! All formats are little-endian with `crc32c` protection. Serde never
//! touches the disk; these codecs are hand-written so the byte layout is a
//! stable contract between hosts.

use pbfs_error::{PbfsError, Result};
use pbfs_types::{
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, BirthTime, BlockIndex, BlockNo,
    ByteOffset, Geometry, Ino, Oid, ParseError, MAX_HOSTS, MAX_NAMELEN, PBFS_MAGIC, PBFS_VERSION,
};
use serde::Serialize;

/// Sentinel for an absent oid/ino in fixed-width fields.
const NONE_SENTINEL: u64 = u64::MAX;

pub const SUPERBLOCK_SIZE: usize = 80;
pub const CHUNK_HEADER_SIZE: usize = 64;
pub const CHUNK_HEADER_MAGIC: u32 = 0x5042_4348; // "PBCH"

pub const INODE_REC_SIZE: usize = 80;
pub const BLKTAG_REC_SIZE: usize = 48;
pub const DENTRY_REC_SIZE: usize = 304;

fn put_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn encode_opt(value: Option<u64>) -> u64 {
    value.unwrap_or(NONE_SENTINEL)
}

fn decode_opt(value: u64) -> Option<u64> {
    (value != NONE_SENTINEL).then_some(value)
}

/// FNV-1a over the entry name; keys the per-directory hash buckets.
///
/// The hash is part of the on-disk contract: all hosts must bucket a name
/// identically or follower lookups would miss entries the leader created.
#[must_use]
pub fn name_hash(name: &str) -> u32 {
    let mut hash = 0x811C_9DC5_u32;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Sector-0 superblock. Carries the geometry and the region map; protected
/// by a CRC computed over the serialized sector with the CRC field zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub geometry: Geometry,
    pub chunk_count: u32,
    /// Byte offset of the fence slot array.
    pub fence_off: u64,
    /// Byte offset of the journal extent.
    pub journal_off: u64,
    /// Journal extent length in bytes.
    pub journal_len: u64,
    /// Byte offset of physical block 0 (start of the chunk region).
    pub chunk_start: u64,
    /// Highest txid folded into the chunk headers by the last checkpoint.
    pub checkpoint_txid: u64,
}

impl Superblock {
    pub fn serialize(&self, sector_size: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; sector_size];
        put_le_u32(&mut buf, 0x00, PBFS_MAGIC);
        // 0x04: crc, patched below.
        put_le_u32(&mut buf, 0x08, PBFS_VERSION);
        put_le_u32(&mut buf, 0x0C, self.geometry.sector_size());
        put_le_u32(&mut buf, 0x10, self.geometry.fragment_size());
        put_le_u32(&mut buf, 0x14, self.geometry.block_size());
        put_le_u64(&mut buf, 0x18, self.geometry.chunk_size());
        put_le_u32(&mut buf, 0x20, self.chunk_count);
        put_le_u64(&mut buf, 0x28, self.fence_off);
        put_le_u64(&mut buf, 0x30, self.journal_off);
        put_le_u64(&mut buf, 0x38, self.journal_len);
        put_le_u64(&mut buf, 0x40, self.chunk_start);
        put_le_u64(&mut buf, 0x48, self.checkpoint_txid);
        let crc = crc32c::crc32c(&buf);
        put_le_u32(&mut buf, 0x04, crc);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let magic = read_le_u32(buf, 0x00)?;
        if magic != PBFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(PBFS_MAGIC),
                actual: u64::from(magic),
            }
            .into());
        }
        let stored_crc = read_le_u32(buf, 0x04)?;
        let mut zeroed = buf.to_vec();
        put_le_u32(&mut zeroed, 0x04, 0);
        let computed = crc32c::crc32c(&zeroed);
        if computed != stored_crc {
            return Err(PbfsError::Corruption {
                offset: 0,
                detail: format!("superblock crc mismatch: stored {stored_crc:#x}, computed {computed:#x}"),
            });
        }
        let version = read_le_u32(buf, 0x08)?;
        if version != PBFS_VERSION {
            return Err(PbfsError::Format(format!(
                "unsupported superblock version {version}"
            )));
        }
        let geometry = Geometry::new(
            read_le_u32(buf, 0x0C)?,
            read_le_u32(buf, 0x10)?,
            read_le_u32(buf, 0x14)?,
            read_le_u64(buf, 0x18)?,
        )?;
        Ok(Self {
            geometry,
            chunk_count: read_le_u32(buf, 0x20)?,
            fence_off: read_le_u64(buf, 0x28)?,
            journal_off: read_le_u64(buf, 0x30)?,
            journal_len: read_le_u64(buf, 0x38)?,
            chunk_start: read_le_u64(buf, 0x40)?,
            checkpoint_txid: read_le_u64(buf, 0x48)?,
        })
    }
}

// ── Region map ──────────────────────────────────────────────────────────────

/// Default journal extent: 16 MiB.
pub const DEFAULT_JOURNAL_LEN: u64 = 16 * 1024 * 1024;

/// Compute the region map for a device of `capacity` bytes.
pub fn compute_layout(geo: Geometry, capacity: u64, journal_len: u64) -> Result<Superblock> {
    let sector = u64::from(geo.sector_size());
    let fence_off = sector;
    let fence_end = fence_off + u64::from(MAX_HOSTS) * sector;
    let journal_off = pbfs_types::align_up(fence_end, 4096)
        .ok_or_else(|| PbfsError::Invalid("journal offset overflow".to_owned()))?;
    let journal_len = pbfs_types::align_up(journal_len, 4096)
        .ok_or_else(|| PbfsError::Invalid("journal length overflow".to_owned()))?;
    let chunk_start = pbfs_types::align_up(journal_off + journal_len, u64::from(geo.block_size()))
        .ok_or_else(|| PbfsError::Invalid("chunk region offset overflow".to_owned()))?;
    if chunk_start >= capacity {
        return Err(PbfsError::NoSpace);
    }
    let chunk_count = (capacity - chunk_start) / geo.chunk_size();
    if chunk_count == 0 {
        return Err(PbfsError::NoSpace);
    }
    let chunk_count = u32::try_from(chunk_count)
        .map_err(|_| PbfsError::Invalid("chunk count exceeds u32".to_owned()))?;
    Ok(Superblock {
        geometry: geo,
        chunk_count,
        fence_off,
        journal_off,
        journal_len,
        chunk_start,
        checkpoint_txid: 0,
    })
}

// ── Metadata kinds ──────────────────────────────────────────────────────────

/// The three allocator-managed metadata kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetaKind {
    Inode,
    BlockTag,
    DirEntry,
}

impl MetaKind {
    pub const ALL: [Self; 3] = [Self::Inode, Self::BlockTag, Self::DirEntry];

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Inode => 1,
            Self::BlockTag => 2,
            Self::DirEntry => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Inode),
            2 => Ok(Self::BlockTag),
            3 => Ok(Self::DirEntry),
            other => Err(PbfsError::Format(format!("unknown metadata kind {other}"))),
        }
    }

    #[must_use]
    pub fn record_size(self) -> usize {
        match self {
            Self::Inode => INODE_REC_SIZE,
            Self::BlockTag => BLKTAG_REC_SIZE,
            Self::DirEntry => DENTRY_REC_SIZE,
        }
    }
}

/// File or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InodeKind {
    File,
    Dir,
}

impl InodeKind {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Dir),
            other => Err(PbfsError::Format(format!("unknown inode kind {other}"))),
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRec {
    pub ino: Ino,
    pub kind: InodeKind,
    pub size: u64,
    pub nblocks: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Namespace link count: 1 while a DirEntry references this inode,
    /// 0 once unlinked. Release of an unlinked inode is deferred until the
    /// last open handle closes.
    pub refcount: u32,
    pub first_blktag: Option<Oid>,
    pub parent: Option<Ino>,
    pub birth_time: BirthTime,
}

impl InodeRec {
    fn serialize_into(&self, buf: &mut [u8]) {
        put_le_u64(buf, 0x00, self.ino.0);
        buf[0x08] = self.kind.as_u8();
        put_le_u64(buf, 0x10, self.size);
        put_le_u64(buf, 0x18, self.nblocks);
        put_le_u64(buf, 0x20, self.mtime);
        put_le_u64(buf, 0x28, self.ctime);
        put_le_u32(buf, 0x30, self.refcount);
        put_le_u64(buf, 0x38, encode_opt(self.first_blktag.map(|o| o.0)));
        put_le_u64(buf, 0x40, encode_opt(self.parent.map(|i| i.0)));
        put_le_u64(buf, 0x48, self.birth_time.0);
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        ensure_slice(buf, 0, INODE_REC_SIZE)?;
        Ok(Self {
            ino: Ino(read_le_u64(buf, 0x00)?),
            kind: InodeKind::from_u8(buf[0x08])?,
            size: read_le_u64(buf, 0x10)?,
            nblocks: read_le_u64(buf, 0x18)?,
            mtime: read_le_u64(buf, 0x20)?,
            ctime: read_le_u64(buf, 0x28)?,
            refcount: read_le_u32(buf, 0x30)?,
            first_blktag: decode_opt(read_le_u64(buf, 0x38)?).map(Oid),
            parent: decode_opt(read_le_u64(buf, 0x40)?).map(Ino),
            birth_time: BirthTime(read_le_u64(buf, 0x48)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTagRec {
    pub oid: Oid,
    pub owner: Ino,
    pub logical: BlockIndex,
    pub physical: BlockNo,
    pub next: Option<Oid>,
    pub birth_time: BirthTime,
}

impl BlockTagRec {
    fn serialize_into(&self, buf: &mut [u8]) {
        put_le_u64(buf, 0x00, self.oid.0);
        put_le_u64(buf, 0x08, self.owner.0);
        put_le_u64(buf, 0x10, self.logical.0);
        put_le_u64(buf, 0x18, self.physical.0);
        put_le_u64(buf, 0x20, encode_opt(self.next.map(|o| o.0)));
        put_le_u64(buf, 0x28, self.birth_time.0);
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        ensure_slice(buf, 0, BLKTAG_REC_SIZE)?;
        Ok(Self {
            oid: Oid(read_le_u64(buf, 0x00)?),
            owner: Ino(read_le_u64(buf, 0x08)?),
            logical: BlockIndex(read_le_u64(buf, 0x10)?),
            physical: BlockNo(read_le_u64(buf, 0x18)?),
            next: decode_opt(read_le_u64(buf, 0x20)?).map(Oid),
            birth_time: BirthTime(read_le_u64(buf, 0x28)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRec {
    pub oid: Oid,
    pub parent: Ino,
    pub child: Ino,
    pub next: Option<Oid>,
    pub birth_time: BirthTime,
    pub name: String,
}

impl DirEntryRec {
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAMELEN {
            return Err(PbfsError::NameTooLong);
        }
        if name.bytes().any(|b| b == b'/' || b == 0) {
            return Err(PbfsError::Invalid(format!(
                "entry name contains '/' or NUL: {name:?}"
            )));
        }
        Ok(())
    }

    fn serialize_into(&self, buf: &mut [u8]) {
        put_le_u64(buf, 0x00, self.oid.0);
        put_le_u64(buf, 0x08, self.parent.0);
        put_le_u64(buf, 0x10, self.child.0);
        put_le_u64(buf, 0x18, encode_opt(self.next.map(|o| o.0)));
        put_le_u64(buf, 0x20, self.birth_time.0);
        put_le_u32(buf, 0x28, name_hash(&self.name));
        let bytes = self.name.as_bytes();
        put_le_u16(buf, 0x2C, bytes.len() as u16);
        buf[0x30..0x30 + bytes.len()].copy_from_slice(bytes);
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        ensure_slice(buf, 0, DENTRY_REC_SIZE)?;
        let name_len = usize::from(read_le_u16(buf, 0x2C)?);
        if name_len > MAX_NAMELEN {
            return Err(PbfsError::Format(format!(
                "directory entry name length {name_len} exceeds maximum"
            )));
        }
        let name = std::str::from_utf8(&buf[0x30..0x30 + name_len])
            .map_err(|_| PbfsError::Format("directory entry name is not UTF-8".to_owned()))?
            .to_owned();
        Ok(Self {
            oid: Oid(read_le_u64(buf, 0x00)?),
            parent: Ino(read_le_u64(buf, 0x08)?),
            child: Ino(read_le_u64(buf, 0x10)?),
            next: decode_opt(read_le_u64(buf, 0x18)?).map(Oid),
            birth_time: BirthTime(read_le_u64(buf, 0x20)?),
            name,
        })
    }
}

/// Closed variant over the three record kinds.
///
/// All kinds share the allocator/serialization protocol: a kind tag, an
/// allocator oid, a birth-time generation, and a fixed-size LE codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    Inode(InodeRec),
    BlockTag(BlockTagRec),
    DirEntry(DirEntryRec),
}

impl MetaRecord {
    #[must_use]
    pub fn kind(&self) -> MetaKind {
        match self {
            Self::Inode(_) => MetaKind::Inode,
            Self::BlockTag(_) => MetaKind::BlockTag,
            Self::DirEntry(_) => MetaKind::DirEntry,
        }
    }

    #[must_use]
    pub fn oid(&self) -> Oid {
        match self {
            Self::Inode(rec) => Oid(rec.ino.0),
            Self::BlockTag(rec) => rec.oid,
            Self::DirEntry(rec) => rec.oid,
        }
    }

    #[must_use]
    pub fn birth_time(&self) -> BirthTime {
        match self {
            Self::Inode(rec) => rec.birth_time,
            Self::BlockTag(rec) => rec.birth_time,
            Self::DirEntry(rec) => rec.birth_time,
        }
    }

    pub fn set_birth_time(&mut self, birth: BirthTime) {
        match self {
            Self::Inode(rec) => rec.birth_time = birth,
            Self::BlockTag(rec) => rec.birth_time = birth,
            Self::DirEntry(rec) => rec.birth_time = birth,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.kind().record_size()];
        match self {
            Self::Inode(rec) => rec.serialize_into(&mut buf),
            Self::BlockTag(rec) => rec.serialize_into(&mut buf),
            Self::DirEntry(rec) => rec.serialize_into(&mut buf),
        }
        buf
    }

    pub fn deserialize(kind: MetaKind, buf: &[u8]) -> Result<Self> {
        match kind {
            MetaKind::Inode => InodeRec::deserialize(buf).map(Self::Inode),
            MetaKind::BlockTag => BlockTagRec::deserialize(buf).map(Self::BlockTag),
            MetaKind::DirEntry => DirEntryRec::deserialize(buf).map(Self::DirEntry),
        }
    }

    pub fn as_inode(&self) -> Result<&InodeRec> {
        match self {
            Self::Inode(rec) => Ok(rec),
            other => Err(PbfsError::Format(format!(
                "expected inode record, found {:?}",
                other.kind()
            ))),
        }
    }

    pub fn as_blocktag(&self) -> Result<&BlockTagRec> {
        match self {
            Self::BlockTag(rec) => Ok(rec),
            other => Err(PbfsError::Format(format!(
                "expected block tag record, found {:?}",
                other.kind()
            ))),
        }
    }

    pub fn as_dentry(&self) -> Result<&DirEntryRec> {
        match self {
            Self::DirEntry(rec) => Ok(rec),
            other => Err(PbfsError::Format(format!(
                "expected directory entry record, found {:?}",
                other.kind()
            ))),
        }
    }
}

// ── Chunk layout ────────────────────────────────────────────────────────────

/// Per-chunk geometry: slot counts for the three allocator nodes, the byte
/// offsets of their bitmaps and record arrays inside the chunk's metadata
/// header blocks, and the mapping from BlockTag slots to data blocks.
///
/// A chunk's BlockTag slot `i` is identity-mapped to its data block `i`:
/// allocating the tag allocates the block. The leading `meta_blocks` blocks
/// of every chunk hold the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkLayout {
    pub blocks_per_chunk: u64,
    pub meta_blocks: u64,
    pub inode_slots: u32,
    pub blktag_slots: u32,
    pub dentry_slots: u32,
    pub inode_bitmap_off: u64,
    pub inode_recs_off: u64,
    pub blktag_bitmap_off: u64,
    pub blktag_recs_off: u64,
    pub dentry_bitmap_off: u64,
    pub dentry_recs_off: u64,
    /// Total metadata bytes used at the head of each chunk.
    pub meta_bytes: u64,
}

fn bitmap_bytes(slots: u64) -> u64 {
    slots.div_ceil(8)
}

impl ChunkLayout {
    pub fn new(geo: Geometry) -> Result<Self> {
        let blocks = geo.blocks_per_chunk();
        let inode_slots = blocks;
        let dentry_slots = blocks * 2;
        // Upper bound for sizing: every block a data block.
        let blktag_upper = blocks;

        let mut off = CHUNK_HEADER_SIZE as u64;
        let inode_bitmap_off = off;
        off += bitmap_bytes(inode_slots);
        let inode_recs_off = off;
        off += inode_slots * INODE_REC_SIZE as u64;
        let blktag_bitmap_off = off;
        off += bitmap_bytes(blktag_upper);
        let blktag_recs_off = off;
        off += blktag_upper * BLKTAG_REC_SIZE as u64;
        let dentry_bitmap_off = off;
        off += bitmap_bytes(dentry_slots);
        let dentry_recs_off = off;
        off += dentry_slots * DENTRY_REC_SIZE as u64;

        let meta_blocks = off.div_ceil(u64::from(geo.block_size()));
        if meta_blocks >= blocks {
            return Err(PbfsError::Invalid(format!(
                "chunk metadata ({off} bytes) leaves no data blocks in a {} byte chunk",
                geo.chunk_size()
            )));
        }
        let data_blocks = blocks - meta_blocks;

        Ok(Self {
            blocks_per_chunk: blocks,
            meta_blocks,
            inode_slots: u32::try_from(inode_slots)
                .map_err(|_| PbfsError::Invalid("inode slot count exceeds u32".to_owned()))?,
            blktag_slots: u32::try_from(data_blocks)
                .map_err(|_| PbfsError::Invalid("blktag slot count exceeds u32".to_owned()))?,
            dentry_slots: u32::try_from(dentry_slots)
                .map_err(|_| PbfsError::Invalid("dentry slot count exceeds u32".to_owned()))?,
            inode_bitmap_off,
            inode_recs_off,
            blktag_bitmap_off,
            blktag_recs_off,
            dentry_bitmap_off,
            dentry_recs_off,
            meta_bytes: off,
        })
    }

    #[must_use]
    pub fn slots(&self, kind: MetaKind) -> u32 {
        match kind {
            MetaKind::Inode => self.inode_slots,
            MetaKind::BlockTag => self.blktag_slots,
            MetaKind::DirEntry => self.dentry_slots,
        }
    }

    #[must_use]
    pub fn bitmap_off(&self, kind: MetaKind) -> u64 {
        match kind {
            MetaKind::Inode => self.inode_bitmap_off,
            MetaKind::BlockTag => self.blktag_bitmap_off,
            MetaKind::DirEntry => self.dentry_bitmap_off,
        }
    }

    #[must_use]
    pub fn recs_off(&self, kind: MetaKind) -> u64 {
        match kind {
            MetaKind::Inode => self.inode_recs_off,
            MetaKind::BlockTag => self.blktag_recs_off,
            MetaKind::DirEntry => self.dentry_recs_off,
        }
    }

    /// Physical data block for a BlockTag slot within a chunk.
    #[must_use]
    pub fn data_block(&self, chunk_no: u32, slot: u32) -> BlockNo {
        BlockNo(u64::from(chunk_no) * self.blocks_per_chunk + self.meta_blocks + u64::from(slot))
    }

    /// Flat oid for `(chunk_no, slot)` of `kind`.
    #[must_use]
    pub fn oid_for(&self, kind: MetaKind, chunk_no: u32, slot: u32) -> Oid {
        Oid(u64::from(chunk_no) * u64::from(self.slots(kind)) + u64::from(slot))
    }

    /// Inverse of [`oid_for`](Self::oid_for): `(chunk_no, slot)`.
    #[must_use]
    pub fn chunk_slot(&self, kind: MetaKind, oid: Oid) -> (u32, u32) {
        let per_chunk = u64::from(self.slots(kind));
        ((oid.0 / per_chunk) as u32, (oid.0 % per_chunk) as u32)
    }

    /// Device byte offset of a chunk's metadata header.
    #[must_use]
    pub fn chunk_meta_off(&self, chunk_start: ByteOffset, geo: Geometry, chunk_no: u32) -> u64 {
        chunk_start.0 + u64::from(chunk_no) * geo.chunk_size()
    }
}

// ── Chunk header ────────────────────────────────────────────────────────────

/// Leading header of each chunk's metadata block, CRC-protected like the
/// superblock. The `checkpoint_txid` records the journal position folded in
/// by the last metadata checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_no: u32,
    pub checkpoint_txid: u64,
}

impl ChunkHeader {
    pub fn serialize(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0_u8; CHUNK_HEADER_SIZE];
        put_le_u32(&mut buf, 0x00, CHUNK_HEADER_MAGIC);
        // 0x04: crc, patched below.
        put_le_u32(&mut buf, 0x08, self.chunk_no);
        put_le_u64(&mut buf, 0x10, self.checkpoint_txid);
        let crc = crc32c::crc32c(&buf);
        put_le_u32(&mut buf, 0x04, crc);
        buf
    }

    pub fn deserialize(buf: &[u8], device_offset: u64) -> Result<Self> {
        let magic = read_le_u32(buf, 0x00)?;
        if magic != CHUNK_HEADER_MAGIC {
            return Err(PbfsError::Corruption {
                offset: device_offset,
                detail: format!("chunk header magic mismatch: {magic:#x}"),
            });
        }
        let stored_crc = read_le_u32(buf, 0x04)?;
        let mut zeroed = [0_u8; CHUNK_HEADER_SIZE];
        zeroed.copy_from_slice(ensure_slice(buf, 0, CHUNK_HEADER_SIZE)?);
        put_le_u32(&mut zeroed, 0x04, 0);
        let computed = crc32c::crc32c(&zeroed);
        if computed != stored_crc {
            return Err(PbfsError::Corruption {
                offset: device_offset,
                detail: "chunk header crc mismatch".to_owned(),
            });
        }
        Ok(Self {
            chunk_no: read_le_u32(buf, 0x08)?,
            checkpoint_txid: read_le_u64(buf, 0x10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_geo() -> Geometry {
        Geometry::new(512, 512, 4096, 64 * 4096).expect("geometry")
    }

    #[test]
    fn superblock_round_trip() {
        let geo = small_geo();
        let sb = compute_layout(geo, 8 * 1024 * 1024, 64 * 1024).expect("layout");
        let bytes = sb.serialize(geo.sector_size() as usize);
        assert_eq!(bytes.len(), 512);
        let back = Superblock::deserialize(&bytes).expect("deserialize");
        assert_eq!(back, sb);
    }

    #[test]
    fn superblock_crc_detects_corruption() {
        let geo = small_geo();
        let sb = compute_layout(geo, 8 * 1024 * 1024, 64 * 1024).expect("layout");
        let mut bytes = sb.serialize(geo.sector_size() as usize);
        bytes[0x20] ^= 0xFF;
        assert!(matches!(
            Superblock::deserialize(&bytes),
            Err(PbfsError::Corruption { .. })
        ));
    }

    #[test]
    fn layout_regions_ordered_and_aligned() {
        let geo = small_geo();
        let sb = compute_layout(geo, 8 * 1024 * 1024, 64 * 1024).expect("layout");
        assert!(sb.fence_off >= u64::from(geo.sector_size()));
        assert!(sb.journal_off >= sb.fence_off + u64::from(MAX_HOSTS) * 512);
        assert_eq!(sb.journal_off % 4096, 0);
        assert_eq!(sb.chunk_start % u64::from(geo.block_size()), 0);
        assert!(sb.chunk_start >= sb.journal_off + sb.journal_len);
        assert!(sb.chunk_count >= 1);
    }

    #[test]
    fn layout_rejects_tiny_device() {
        let geo = small_geo();
        assert!(matches!(
            compute_layout(geo, 64 * 1024, 64 * 1024),
            Err(PbfsError::NoSpace)
        ));
    }

    #[test]
    fn inode_record_round_trip() {
        let rec = InodeRec {
            ino: Ino(7),
            kind: InodeKind::File,
            size: 123_456,
            nblocks: 31,
            mtime: 1_700_000_000,
            ctime: 1_600_000_000,
            refcount: 1,
            first_blktag: Some(Oid(42)),
            parent: Some(Ino::ROOT),
            birth_time: BirthTime(99),
        };
        let record = MetaRecord::Inode(rec.clone());
        let bytes = record.serialize();
        assert_eq!(bytes.len(), INODE_REC_SIZE);
        let back = MetaRecord::deserialize(MetaKind::Inode, &bytes).expect("deserialize");
        assert_eq!(back, record);
        assert_eq!(back.as_inode().expect("inode"), &rec);
    }

    #[test]
    fn blocktag_record_round_trip() {
        let record = MetaRecord::BlockTag(BlockTagRec {
            oid: Oid(5),
            owner: Ino(7),
            logical: BlockIndex(3),
            physical: BlockNo(130),
            next: None,
            birth_time: BirthTime(12),
        });
        let bytes = record.serialize();
        assert_eq!(bytes.len(), BLKTAG_REC_SIZE);
        let back = MetaRecord::deserialize(MetaKind::BlockTag, &bytes).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn dentry_record_round_trip() {
        let record = MetaRecord::DirEntry(DirEntryRec {
            oid: Oid(9),
            parent: Ino::ROOT,
            child: Ino(7),
            next: Some(Oid(10)),
            birth_time: BirthTime(3),
            name: "data.log".to_owned(),
        });
        let bytes = record.serialize();
        assert_eq!(bytes.len(), DENTRY_REC_SIZE);
        let back = MetaRecord::deserialize(MetaKind::DirEntry, &bytes).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn dentry_name_validation() {
        assert!(DirEntryRec::validate_name("ok").is_ok());
        assert!(DirEntryRec::validate_name("").is_err());
        assert!(DirEntryRec::validate_name("a/b").is_err());
        let long = "x".repeat(MAX_NAMELEN + 1);
        assert!(matches!(
            DirEntryRec::validate_name(&long),
            Err(PbfsError::NameTooLong)
        ));
        assert!(DirEntryRec::validate_name(&"y".repeat(MAX_NAMELEN)).is_ok());
    }

    #[test]
    fn chunk_layout_slot_math() {
        let geo = small_geo();
        let layout = ChunkLayout::new(geo).expect("layout");
        assert_eq!(layout.blocks_per_chunk, 64);
        assert!(layout.meta_blocks >= 1);
        assert_eq!(
            u64::from(layout.blktag_slots),
            layout.blocks_per_chunk - layout.meta_blocks
        );
        // Bitmap and record regions are disjoint and in order.
        assert!(layout.inode_bitmap_off >= CHUNK_HEADER_SIZE as u64);
        assert!(layout.inode_recs_off > layout.inode_bitmap_off);
        assert!(layout.blktag_bitmap_off > layout.inode_recs_off);
        assert!(layout.dentry_recs_off > layout.dentry_bitmap_off);
        assert!(layout.meta_bytes <= layout.meta_blocks * u64::from(geo.block_size()));
    }

    #[test]
    fn chunk_layout_oid_mapping_round_trip() {
        let geo = small_geo();
        let layout = ChunkLayout::new(geo).expect("layout");
        for kind in MetaKind::ALL {
            for (chunk, slot) in [(0_u32, 0_u32), (0, 5), (3, 7)] {
                let oid = layout.oid_for(kind, chunk, slot);
                assert_eq!(layout.chunk_slot(kind, oid), (chunk, slot));
            }
        }
    }

    #[test]
    fn data_block_skips_meta_blocks() {
        let geo = small_geo();
        let layout = ChunkLayout::new(geo).expect("layout");
        let first = layout.data_block(0, 0);
        assert_eq!(first.0, layout.meta_blocks);
        let second_chunk = layout.data_block(1, 0);
        assert_eq!(second_chunk.0, layout.blocks_per_chunk + layout.meta_blocks);
    }

    #[test]
    fn chunk_header_round_trip_and_crc() {
        let header = ChunkHeader {
            chunk_no: 3,
            checkpoint_txid: 17,
        };
        let bytes = header.serialize();
        let back = ChunkHeader::deserialize(&bytes, 0).expect("deserialize");
        assert_eq!(back, header);

        let mut corrupt = bytes;
        corrupt[0x10] ^= 1;
        assert!(matches!(
            ChunkHeader::deserialize(&corrupt, 0),
            Err(PbfsError::Corruption { .. })
        ));
    }

    #[test]
    fn name_hash_is_stable() {
        // On-disk contract: these values must never change.
        assert_eq!(name_hash(""), 0x811C_9DC5);
        assert_eq!(name_hash("a"), 0xE40C_292C);
        assert_ne!(name_hash("ab"), name_hash("ba"));
    }
}
