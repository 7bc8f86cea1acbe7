#![forbid(unsafe_code)]
//! In-memory metadata store.
//!
//! Three allocator tables (inode, block tag, directory entry), each a free
//! bitmap over a packed slot array, plus the secondary indexes rebuilt on
//! mount: per-directory name-hash buckets and per-file block maps. The
//! leader mutates the store only through [`tx::Tx`]; followers feed it
//! replayed journal records through [`MetaStore::apply_record`].

pub mod tx;

use pbfs_error::{PbfsError, Result};
use pbfs_journal::{LogEntry, LogEntryKind, TxRecord};
use pbfs_ondisk::{
    name_hash, ChunkHeader, ChunkLayout, DirEntryRec, MetaKind, MetaRecord, CHUNK_HEADER_SIZE,
};
use pbfs_types::{BirthTime, BlockIndex, Geometry, Ino, Oid, TxId};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first free (zero) bit in the first `count` bits, from `start`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator table ─────────────────────────────────────────────────────────

/// One metadata kind's allocator: bitmap + packed records.
#[derive(Debug)]
pub struct AllocTable {
    kind: MetaKind,
    slots: Vec<Option<MetaRecord>>,
    bitmap: Vec<u8>,
    n_all: u64,
    n_free: u64,
}

impl AllocTable {
    fn new(kind: MetaKind, n_all: u64) -> Self {
        Self {
            kind,
            slots: vec![None; usize::try_from(n_all).unwrap_or(0)],
            bitmap: vec![0_u8; n_all.div_ceil(8) as usize],
            n_all,
            n_free: n_all,
        }
    }

    #[must_use]
    pub fn n_all(&self) -> u64 {
        self.n_all
    }

    #[must_use]
    pub fn n_free(&self) -> u64 {
        self.n_free
    }

    #[must_use]
    pub fn is_allocated(&self, oid: Oid) -> bool {
        bitmap_get(&self.bitmap, oid.0)
    }

    pub fn get(&self, oid: Oid) -> Result<&MetaRecord> {
        self.slots
            .get(oid.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| PbfsError::NotFound(format!("{:?} slot {}", self.kind, oid.0)))
    }

    fn find_free(&self) -> Option<Oid> {
        if self.n_free == 0 {
            return None;
        }
        bitmap_find_free(&self.bitmap, self.n_all, 0).map(Oid)
    }

    fn set(&mut self, oid: Oid, record: MetaRecord) {
        let idx = oid.0 as usize;
        if !bitmap_get(&self.bitmap, oid.0) {
            bitmap_set(&mut self.bitmap, oid.0);
            self.n_free -= 1;
        }
        self.slots[idx] = Some(record);
    }

    fn clear(&mut self, oid: Oid) {
        let idx = oid.0 as usize;
        if bitmap_get(&self.bitmap, oid.0) {
            bitmap_clear(&mut self.bitmap, oid.0);
            self.n_free += 1;
        }
        self.slots[idx] = None;
    }

    fn extend(&mut self, added: u64) {
        self.n_all += added;
        self.n_free += added;
        self.slots
            .resize(usize::try_from(self.n_all).unwrap_or(usize::MAX), None);
        self.bitmap.resize(self.n_all.div_ceil(8) as usize, 0);
    }

    fn iter_allocated(&self) -> impl Iterator<Item = (Oid, &MetaRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|rec| (Oid(idx as u64), rec)))
    }
}

// ── MetaStore ───────────────────────────────────────────────────────────────

/// The in-memory materialization of all metadata.
///
/// The leader owns the only mutable copy; followers hold one rebuilt by
/// journal replay. Mutation goes through [`tx::Tx`] (leader) or
/// [`apply_record`](Self::apply_record) (replay), both of which keep the
/// secondary indexes coherent.
#[derive(Debug)]
pub struct MetaStore {
    geo: Geometry,
    layout: ChunkLayout,
    chunk_count: u32,
    inodes: AllocTable,
    blktags: AllocTable,
    dentries: AllocTable,
    /// Monotonic generation source; strictly above every birth time seen.
    birth_clock: u64,
    committed_txid: TxId,
    /// parent ino → name-hash bucket → entry oids (chain order).
    dir_index: HashMap<Ino, HashMap<u32, Vec<Oid>>>,
    /// file ino → logical block index → tag oid.
    file_index: HashMap<Ino, BTreeMap<u64, Oid>>,
}

impl MetaStore {
    pub fn new(geo: Geometry, chunk_count: u32) -> Result<Self> {
        let layout = ChunkLayout::new(geo)?;
        let chunks = u64::from(chunk_count);
        Ok(Self {
            geo,
            layout,
            chunk_count,
            inodes: AllocTable::new(MetaKind::Inode, chunks * u64::from(layout.inode_slots)),
            blktags: AllocTable::new(MetaKind::BlockTag, chunks * u64::from(layout.blktag_slots)),
            dentries: AllocTable::new(MetaKind::DirEntry, chunks * u64::from(layout.dentry_slots)),
            birth_clock: 1,
            committed_txid: TxId(0),
            dir_index: HashMap::new(),
            file_index: HashMap::new(),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    #[must_use]
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[must_use]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    #[must_use]
    pub fn table(&self, kind: MetaKind) -> &AllocTable {
        match kind {
            MetaKind::Inode => &self.inodes,
            MetaKind::BlockTag => &self.blktags,
            MetaKind::DirEntry => &self.dentries,
        }
    }

    fn table_mut(&mut self, kind: MetaKind) -> &mut AllocTable {
        match kind {
            MetaKind::Inode => &mut self.inodes,
            MetaKind::BlockTag => &mut self.blktags,
            MetaKind::DirEntry => &mut self.dentries,
        }
    }

    /// Read a record under the meta read lock.
    pub fn get(&self, kind: MetaKind, oid: Oid) -> Result<&MetaRecord> {
        self.table(kind).get(oid)
    }

    /// Read a record and verify the caller's generation stamp.
    pub fn get_checked(&self, kind: MetaKind, oid: Oid, expected: BirthTime) -> Result<&MetaRecord> {
        let record = self.get(kind, oid)?;
        if record.birth_time() != expected {
            return Err(PbfsError::Again);
        }
        Ok(record)
    }

    pub(crate) fn find_free(&self, kind: MetaKind) -> Result<Oid> {
        self.table(kind).find_free().ok_or(PbfsError::NoSpace)
    }

    pub(crate) fn next_birth(&mut self) -> BirthTime {
        let birth = self.birth_clock;
        self.birth_clock += 1;
        BirthTime(birth)
    }

    pub(crate) fn set_committed(&mut self, txid: TxId) {
        self.committed_txid = txid;
    }

    /// Install a record into its slot, maintaining bitmap and indexes.
    pub(crate) fn install(&mut self, record: MetaRecord) {
        let oid = record.oid();
        let birth = record.birth_time().0;
        if birth >= self.birth_clock {
            self.birth_clock = birth + 1;
        }
        self.unindex(record.kind(), oid);
        self.index(&record);
        self.table_mut(record.kind()).set(oid, record);
    }

    /// Remove a record from its slot, maintaining bitmap and indexes.
    pub(crate) fn remove(&mut self, kind: MetaKind, oid: Oid) {
        self.unindex(kind, oid);
        self.table_mut(kind).clear(oid);
    }

    fn index(&mut self, record: &MetaRecord) {
        match record {
            MetaRecord::DirEntry(rec) => {
                let bucket = name_hash(&rec.name);
                self.dir_index
                    .entry(rec.parent)
                    .or_default()
                    .entry(bucket)
                    .or_default()
                    .push(rec.oid);
            }
            MetaRecord::BlockTag(rec) => {
                self.file_index
                    .entry(rec.owner)
                    .or_default()
                    .insert(rec.logical.0, rec.oid);
            }
            MetaRecord::Inode(_) => {}
        }
    }

    fn unindex(&mut self, kind: MetaKind, oid: Oid) {
        let Ok(old) = self.table(kind).get(oid) else {
            return;
        };
        match old {
            MetaRecord::DirEntry(rec) => {
                let parent = rec.parent;
                let bucket = name_hash(&rec.name);
                if let Some(buckets) = self.dir_index.get_mut(&parent) {
                    if let Some(chain) = buckets.get_mut(&bucket) {
                        chain.retain(|entry| *entry != oid);
                        if chain.is_empty() {
                            buckets.remove(&bucket);
                        }
                    }
                    if buckets.is_empty() {
                        self.dir_index.remove(&parent);
                    }
                }
            }
            MetaRecord::BlockTag(rec) => {
                let owner = rec.owner;
                let logical = rec.logical.0;
                if let Some(map) = self.file_index.get_mut(&owner) {
                    map.remove(&logical);
                    if map.is_empty() {
                        self.file_index.remove(&owner);
                    }
                }
            }
            MetaRecord::Inode(_) => {}
        }
    }

    /// Rebuild both secondary indexes from the slot arrays.
    pub fn rebuild_indexes(&mut self) {
        let mut dir_index: HashMap<Ino, HashMap<u32, Vec<Oid>>> = HashMap::new();
        for (oid, record) in self.dentries.iter_allocated() {
            if let MetaRecord::DirEntry(rec) = record {
                dir_index
                    .entry(rec.parent)
                    .or_default()
                    .entry(name_hash(&rec.name))
                    .or_default()
                    .push(oid);
            }
        }
        let mut file_index: HashMap<Ino, BTreeMap<u64, Oid>> = HashMap::new();
        for (oid, record) in self.blktags.iter_allocated() {
            if let MetaRecord::BlockTag(rec) = record {
                file_index
                    .entry(rec.owner)
                    .or_default()
                    .insert(rec.logical.0, oid);
            }
        }
        self.dir_index = dir_index;
        self.file_index = file_index;
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Look up `(parent, name)` via the hash buckets, byte-exact.
    pub fn lookup_dentry(&self, parent: Ino, name: &str) -> Option<&DirEntryRec> {
        let chain = self.dir_index.get(&parent)?.get(&name_hash(name))?;
        chain.iter().find_map(|oid| {
            let record = self.dentries.get(*oid).ok()?;
            let rec = record.as_dentry().ok()?;
            (rec.name == name).then_some(rec)
        })
    }

    /// All entries of a directory, ordered by oid for stable iteration.
    #[must_use]
    pub fn dir_entries(&self, parent: Ino) -> Vec<&DirEntryRec> {
        let mut oids: Vec<Oid> = self
            .dir_index
            .get(&parent)
            .map(|buckets| buckets.values().flatten().copied().collect())
            .unwrap_or_default();
        oids.sort_unstable();
        oids.iter()
            .filter_map(|oid| self.dentries.get(*oid).ok()?.as_dentry().ok())
            .collect()
    }

    #[must_use]
    pub fn dir_is_empty(&self, parent: Ino) -> bool {
        self.dir_index.get(&parent).is_none()
    }

    /// The tag covering `logical` of file `ino`, if allocated.
    pub fn tag_for(&self, ino: Ino, logical: BlockIndex) -> Option<&pbfs_ondisk::BlockTagRec> {
        let oid = self.file_index.get(&ino)?.get(&logical.0)?;
        self.blktags.get(*oid).ok()?.as_blocktag().ok()
    }

    /// All tags of a file in logical order.
    #[must_use]
    pub fn file_tags(&self, ino: Ino) -> Vec<&pbfs_ondisk::BlockTagRec> {
        self.file_index
            .get(&ino)
            .map(|map| {
                map.values()
                    .filter_map(|oid| self.blktags.get(*oid).ok()?.as_blocktag().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tag oids of a file with logical index >= `from`, descending order
    /// (the order a truncate frees them in).
    #[must_use]
    pub fn tags_from(&self, ino: Ino, from: BlockIndex) -> Vec<(Oid, BirthTime, BlockIndex)> {
        let Some(map) = self.file_index.get(&ino) else {
            return Vec::new();
        };
        let mut tags: Vec<(Oid, BirthTime, BlockIndex)> = map
            .range(from.0..)
            .filter_map(|(logical, oid)| {
                let record = self.blktags.get(*oid).ok()?;
                Some((*oid, record.birth_time(), BlockIndex(*logical)))
            })
            .collect();
        tags.reverse();
        tags
    }

    // ── Replay ──────────────────────────────────────────────────────────

    /// Apply one entry to the slot arrays. Used by Tx commit (leader) and
    /// journal replay (followers, recovery). Idempotent: re-applying an
    /// entry reproduces the same state.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let oid = Oid(u64::from(entry.slot));
        if oid.0 >= self.table(entry.meta_kind).n_all() {
            return Err(PbfsError::Format(format!(
                "journal entry slot {} out of range for {:?} table of {}",
                entry.slot,
                entry.meta_kind,
                self.table(entry.meta_kind).n_all()
            )));
        }
        match entry.kind {
            LogEntryKind::Alloc | LogEntryKind::Update => {
                let record = MetaRecord::deserialize(entry.meta_kind, &entry.payload)?;
                if record.oid() != oid {
                    return Err(PbfsError::Format(format!(
                        "journal entry slot {} does not match record oid {}",
                        entry.slot,
                        record.oid()
                    )));
                }
                self.install(record);
            }
            LogEntryKind::Free => {
                self.remove(entry.meta_kind, oid);
            }
        }
        Ok(())
    }

    /// Apply a committed transaction record. Records at or below the
    /// committed txid are skipped, making replay idempotent.
    pub fn apply_record(&mut self, record: &TxRecord) -> Result<()> {
        if record.txid <= self.committed_txid {
            debug!(
                target: "pbfs::meta",
                event = "replay_skip",
                txid = record.txid.0,
                committed = self.committed_txid.0
            );
            return Ok(());
        }
        for entry in &record.entries {
            self.apply_entry(entry)?;
        }
        self.set_committed(record.txid);
        Ok(())
    }

    // ── Invariants ──────────────────────────────────────────────────────

    /// Verify the committed-snapshot invariants; called at commit in debug
    /// builds and by tests.
    pub fn verify_invariants(&self) -> Result<()> {
        // Bitmap agrees with slot occupancy and birth times are stamped.
        for kind in MetaKind::ALL {
            let table = self.table(kind);
            for idx in 0..table.n_all {
                let allocated = bitmap_get(&table.bitmap, idx);
                let present = table.slots[idx as usize].is_some();
                if allocated != present {
                    return Err(PbfsError::Corruption {
                        offset: 0,
                        detail: format!("{kind:?} slot {idx}: bitmap/slot disagreement"),
                    });
                }
                if let Some(record) = &table.slots[idx as usize] {
                    if record.birth_time().0 == 0 {
                        return Err(PbfsError::Corruption {
                            offset: 0,
                            detail: format!("{kind:?} slot {idx}: zero birth time"),
                        });
                    }
                }
            }
        }

        // Every file inode's tag chain is exactly {0..n-1}.
        for (_, record) in self.inodes.iter_allocated() {
            let inode = record.as_inode()?;
            if matches!(inode.kind, pbfs_ondisk::InodeKind::File) {
                let expected = self.geo.blocks_for_size(inode.size);
                let tags = self.file_tags(inode.ino);
                if (tags.len() as u64) < expected {
                    return Err(PbfsError::Corruption {
                        offset: 0,
                        detail: format!(
                            "inode {} has {} tags, size {} needs {expected}",
                            inode.ino,
                            tags.len(),
                            inode.size
                        ),
                    });
                }
                for (idx, tag) in tags.iter().enumerate() {
                    if tag.logical.0 != idx as u64 {
                        return Err(PbfsError::Corruption {
                            offset: 0,
                            detail: format!(
                                "inode {} tag chain has a gap at index {idx}",
                                inode.ino
                            ),
                        });
                    }
                }
            }
        }

        // No dangling tag owners; no dangling or duplicate dentries.
        for (_, record) in self.blktags.iter_allocated() {
            let tag = record.as_blocktag()?;
            if !self.inodes.is_allocated(Oid(tag.owner.0)) {
                return Err(PbfsError::Corruption {
                    offset: 0,
                    detail: format!("block tag {} owned by free inode {}", tag.oid, tag.owner),
                });
            }
        }
        let mut seen: HashMap<(Ino, &str), Oid> = HashMap::new();
        for (oid, record) in self.dentries.iter_allocated() {
            let rec = record.as_dentry()?;
            if !self.inodes.is_allocated(Oid(rec.child.0)) {
                return Err(PbfsError::Corruption {
                    offset: 0,
                    detail: format!("dentry {:?} references free inode {}", rec.name, rec.child),
                });
            }
            let child = self.inodes.get(Oid(rec.child.0))?.as_inode()?;
            if child.parent != Some(rec.parent) {
                return Err(PbfsError::Corruption {
                    offset: 0,
                    detail: format!(
                        "dentry {:?}: child {} has parent {:?}, expected {}",
                        rec.name, rec.child, child.parent, rec.parent
                    ),
                });
            }
            if let Some(dup) = seen.insert((rec.parent, rec.name.as_str()), oid) {
                return Err(PbfsError::Corruption {
                    offset: 0,
                    detail: format!(
                        "duplicate dentry ({}, {:?}) at oids {dup} and {oid}",
                        rec.parent, rec.name
                    ),
                });
            }
        }
        Ok(())
    }

    // ── Space accounting ────────────────────────────────────────────────

    /// (total data blocks, free data blocks, total inodes, free inodes).
    #[must_use]
    pub fn space(&self) -> (u64, u64, u64, u64) {
        (
            self.blktags.n_all(),
            self.blktags.n_free(),
            self.inodes.n_all(),
            self.inodes.n_free(),
        )
    }

    /// Extend the allocator tables for newly appended chunks (growfs).
    pub fn extend_chunks(&mut self, new_chunk_count: u32) -> Result<()> {
        if new_chunk_count < self.chunk_count {
            return Err(PbfsError::Invalid(
                "chunk count cannot shrink".to_owned(),
            ));
        }
        let added = u64::from(new_chunk_count - self.chunk_count);
        if added == 0 {
            return Ok(());
        }
        self.inodes.extend(added * u64::from(self.layout.inode_slots));
        self.blktags
            .extend(added * u64::from(self.layout.blktag_slots));
        self.dentries
            .extend(added * u64::from(self.layout.dentry_slots));
        self.chunk_count = new_chunk_count;
        Ok(())
    }

    // ── Checkpoint codec ────────────────────────────────────────────────

    /// Serialize one chunk's metadata header blocks for a checkpoint.
    pub fn encode_chunk_meta(&self, chunk_no: u32) -> Result<Vec<u8>> {
        let layout = self.layout;
        let len = usize::try_from(layout.meta_blocks * u64::from(self.geo.block_size()))
            .map_err(|_| PbfsError::Invalid("chunk metadata exceeds usize".to_owned()))?;
        let mut buf = vec![0_u8; len];

        let header = ChunkHeader {
            chunk_no,
            checkpoint_txid: self.committed_txid.0,
        };
        buf[..CHUNK_HEADER_SIZE].copy_from_slice(&header.serialize());

        for kind in MetaKind::ALL {
            let table = self.table(kind);
            let per_chunk = u64::from(layout.slots(kind));
            let base = u64::from(chunk_no) * per_chunk;
            let bitmap_off = layout.bitmap_off(kind) as usize;
            let recs_off = layout.recs_off(kind) as usize;
            let rec_size = kind.record_size();
            for slot in 0..per_chunk {
                let oid = Oid(base + slot);
                if table.is_allocated(oid) {
                    bitmap_set(&mut buf[bitmap_off..], slot);
                    let bytes = table.get(oid)?.serialize();
                    let at = recs_off + (slot as usize) * rec_size;
                    buf[at..at + rec_size].copy_from_slice(&bytes);
                }
            }
        }
        Ok(buf)
    }

    /// Load one chunk's metadata from its header blocks. Indexes are NOT
    /// rebuilt here; call [`rebuild_indexes`](Self::rebuild_indexes) after
    /// all chunks load.
    pub fn decode_chunk_meta(&mut self, chunk_no: u32, buf: &[u8], device_offset: u64) -> Result<TxId> {
        let header = ChunkHeader::deserialize(buf, device_offset)?;
        if header.chunk_no != chunk_no {
            return Err(PbfsError::Corruption {
                offset: device_offset,
                detail: format!(
                    "chunk header claims chunk {}, expected {chunk_no}",
                    header.chunk_no
                ),
            });
        }
        let layout = self.layout;
        for kind in MetaKind::ALL {
            let per_chunk = u64::from(layout.slots(kind));
            let base = u64::from(chunk_no) * per_chunk;
            let bitmap_off = layout.bitmap_off(kind) as usize;
            let recs_off = layout.recs_off(kind) as usize;
            let rec_size = kind.record_size();
            for slot in 0..per_chunk {
                if !bitmap_get(&buf[bitmap_off..], slot) {
                    continue;
                }
                let at = recs_off + (slot as usize) * rec_size;
                let record = MetaRecord::deserialize(kind, &buf[at..at + rec_size])?;
                let oid = Oid(base + slot);
                if record.oid() != oid {
                    return Err(PbfsError::Corruption {
                        offset: device_offset,
                        detail: format!(
                            "chunk {chunk_no} {kind:?} slot {slot}: record oid {} mismatch",
                            record.oid()
                        ),
                    });
                }
                let birth = record.birth_time().0;
                if birth >= self.birth_clock {
                    self.birth_clock = birth + 1;
                }
                self.table_mut(kind).set(oid, record);
            }
        }
        if header.checkpoint_txid > self.committed_txid.0 {
            self.set_committed(TxId(header.checkpoint_txid));
        }
        Ok(TxId(header.checkpoint_txid))
    }
}

// Re-exported for callers that only need the record types.
pub use pbfs_ondisk::{BlockTagRec, InodeKind, InodeRec};

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_types::BlockNo;

    pub(crate) fn test_geo() -> Geometry {
        Geometry::new(512, 512, 4096, 64 * 4096).expect("geometry")
    }

    fn store() -> MetaStore {
        MetaStore::new(test_geo(), 2).expect("store")
    }

    fn inode_record(store: &mut MetaStore, ino: u64, kind: InodeKind) -> MetaRecord {
        let birth = store.next_birth();
        MetaRecord::Inode(InodeRec {
            ino: Ino(ino),
            kind,
            size: 0,
            nblocks: 0,
            mtime: 0,
            ctime: 0,
            refcount: 1,
            first_blktag: None,
            parent: Some(Ino::ROOT),
            birth_time: birth,
        })
    }

    #[test]
    fn bitmap_round_trip() {
        let mut bitmap = vec![0_u8; 4];
        assert!(!bitmap_get(&bitmap, 9));
        bitmap_set(&mut bitmap, 9);
        assert!(bitmap_get(&bitmap, 9));
        bitmap_clear(&mut bitmap, 9);
        assert!(!bitmap_get(&bitmap, 9));
        assert_eq!(bitmap_find_free(&bitmap, 32, 0), Some(0));
        for idx in 0..32 {
            bitmap_set(&mut bitmap, idx);
        }
        assert_eq!(bitmap_find_free(&bitmap, 32, 0), None);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bitmap = vec![0_u8; 1];
        bitmap_set(&mut bitmap, 3);
        bitmap_set(&mut bitmap, 4);
        assert_eq!(bitmap_find_free(&bitmap, 8, 3), Some(5));
        bitmap_set(&mut bitmap, 5);
        bitmap_set(&mut bitmap, 6);
        bitmap_set(&mut bitmap, 7);
        assert_eq!(bitmap_find_free(&bitmap, 8, 3), Some(0));
    }

    #[test]
    fn install_and_lookup_dentry() {
        let mut store = store();
        let root = inode_record(&mut store, 0, InodeKind::Dir);
        store.install(root);
        let child = inode_record(&mut store, 1, InodeKind::File);
        store.install(child);
        let birth = store.next_birth();
        store.install(MetaRecord::DirEntry(DirEntryRec {
            oid: Oid(0),
            parent: Ino::ROOT,
            child: Ino(1),
            next: None,
            birth_time: birth,
            name: "x".to_owned(),
        }));

        let found = store.lookup_dentry(Ino::ROOT, "x").expect("found");
        assert_eq!(found.child, Ino(1));
        assert!(store.lookup_dentry(Ino::ROOT, "y").is_none());
        assert_eq!(store.dir_entries(Ino::ROOT).len(), 1);
        assert!(!store.dir_is_empty(Ino::ROOT));

        store.verify_invariants().expect("invariants");

        store.remove(MetaKind::DirEntry, Oid(0));
        assert!(store.lookup_dentry(Ino::ROOT, "x").is_none());
        assert!(store.dir_is_empty(Ino::ROOT));
    }

    #[test]
    fn file_index_orders_tags() {
        let mut store = store();
        let inode = inode_record(&mut store, 3, InodeKind::File);
        store.install(inode);
        for logical in [2_u64, 0, 1] {
            let birth = store.next_birth();
            store.install(MetaRecord::BlockTag(BlockTagRec {
                oid: Oid(logical + 10),
                owner: Ino(3),
                logical: BlockIndex(logical),
                physical: BlockNo(100 + logical),
                next: None,
                birth_time: birth,
            }));
        }
        let tags = store.file_tags(Ino(3));
        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags.iter().map(|t| t.logical.0).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(store.tag_for(Ino(3), BlockIndex(1)).is_some());
        assert!(store.tag_for(Ino(3), BlockIndex(9)).is_none());

        let trailing = store.tags_from(Ino(3), BlockIndex(1));
        assert_eq!(trailing.len(), 2);
        assert_eq!(trailing[0].2, BlockIndex(2));
        assert_eq!(trailing[1].2, BlockIndex(1));
    }

    #[test]
    fn get_checked_detects_stale_birth() {
        let mut store = store();
        let record = inode_record(&mut store, 5, InodeKind::File);
        let birth = record.birth_time();
        store.install(record);
        assert!(store.get_checked(MetaKind::Inode, Oid(5), birth).is_ok());
        assert!(matches!(
            store.get_checked(MetaKind::Inode, Oid(5), BirthTime(birth.0 + 1)),
            Err(PbfsError::Again)
        ));
    }

    #[test]
    fn birth_clock_monotonic_across_reuse() {
        let mut store = store();
        let record = inode_record(&mut store, 7, InodeKind::File);
        let first_birth = record.birth_time();
        store.install(record);
        store.remove(MetaKind::Inode, Oid(7));
        let record = inode_record(&mut store, 7, InodeKind::File);
        let second_birth = record.birth_time();
        assert!(second_birth > first_birth);
        store.install(record);
    }

    #[test]
    fn invariants_catch_dangling_tag() {
        let mut store = store();
        let birth = store.next_birth();
        store.install(MetaRecord::BlockTag(BlockTagRec {
            oid: Oid(0),
            owner: Ino(42),
            logical: BlockIndex(0),
            physical: BlockNo(7),
            next: None,
            birth_time: birth,
        }));
        assert!(matches!(
            store.verify_invariants(),
            Err(PbfsError::Corruption { .. })
        ));
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut store = store();
        let root = inode_record(&mut store, 0, InodeKind::Dir);
        store.install(root);
        let file = inode_record(&mut store, 1, InodeKind::File);
        store.install(file);
        let birth = store.next_birth();
        store.install(MetaRecord::DirEntry(DirEntryRec {
            oid: Oid(0),
            parent: Ino::ROOT,
            child: Ino(1),
            next: None,
            birth_time: birth,
            name: "chk".to_owned(),
        }));
        store.set_committed(TxId(9));

        let mut rebuilt = MetaStore::new(test_geo(), 2).expect("store");
        for chunk in 0..2_u32 {
            let buf = store.encode_chunk_meta(chunk).expect("encode");
            let txid = rebuilt.decode_chunk_meta(chunk, &buf, 0).expect("decode");
            assert_eq!(txid, TxId(9));
        }
        rebuilt.rebuild_indexes();
        assert_eq!(rebuilt.committed_txid(), TxId(9));
        assert!(rebuilt.lookup_dentry(Ino::ROOT, "chk").is_some());
        rebuilt.verify_invariants().expect("invariants");
    }

    #[test]
    fn extend_chunks_grows_tables() {
        let mut store = store();
        let (blocks_before, _, inodes_before, _) = store.space();
        store.extend_chunks(3).expect("extend");
        let (blocks_after, _, inodes_after, _) = store.space();
        assert!(blocks_after > blocks_before);
        assert!(inodes_after > inodes_before);
        assert!(store.extend_chunks(1).is_err());
    }
}
