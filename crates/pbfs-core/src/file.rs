//! File and directory operations.
//!
//! The data path maps file offsets to physical blocks through the BlockTag
//! chain and hands sector alignment to the blkio layer. Writes follow the
//! allocate-then-data discipline: the allocation transaction (including the
//! size update) is durable before any data lands, so a crash leaves
//! zero-filled holes rather than stale bytes. Files are dense: the tag
//! chain always covers `{0..n-1}` with no gaps.

use crate::mount::Mount;
use crate::namei;
use pbfs_blkio::{blkio_read, blkio_write};
use pbfs_error::{PbfsError, Result};
use pbfs_meta::tx::Tx;
use pbfs_meta::MetaStore;
use pbfs_ondisk::{
    BlockTagRec, DirEntryRec, InodeKind, InodeRec, MetaKind, MetaRecord,
};
use pbfs_types::{BirthTime, BlockIndex, BlockNo, Ino, Oid};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Decoded open flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub excl: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }
}

/// What `open` resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedFile {
    pub ino: Ino,
    pub birth: BirthTime,
    pub kind: InodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub ino: u64,
    pub is_dir: bool,
    pub size: u64,
    /// 512-byte units, like `st_blocks`.
    pub blocks: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStat {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// One file→device mapping triple returned by `fmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FmapEntry {
    pub logical_offset: u64,
    pub physical_offset: u64,
    pub length: u64,
}

/// One readdir entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub ino: u64,
    pub is_dir: bool,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn inode_of(store: &MetaStore, ino: Ino) -> Result<InodeRec> {
    Ok(store.get(MetaKind::Inode, Oid(ino.0))?.as_inode()?.clone())
}

fn inode_checked(store: &MetaStore, ino: Ino, birth: BirthTime) -> Result<InodeRec> {
    Ok(store
        .get_checked(MetaKind::Inode, Oid(ino.0), birth)?
        .as_inode()?
        .clone())
}

/// Grow the tag chain of `ino` densely up to `upto` blocks. Returns the
/// newly allocated physical blocks (which the caller must zero before any
/// data read can observe them).
fn ensure_blocks(
    tx: &mut Tx,
    store: &mut MetaStore,
    inode: &mut InodeRec,
    upto: u64,
) -> Result<Vec<BlockNo>> {
    let layout = store.layout();
    let mut chain: Vec<(Oid, BirthTime)> = store
        .file_tags(inode.ino)
        .iter()
        .map(|tag| (tag.oid, tag.birth_time))
        .collect();
    let mut fresh = Vec::new();

    while (chain.len() as u64) < upto {
        let logical = chain.len() as u64;
        let owner = inode.ino;
        let oid = tx.alloc_with(store, MetaKind::BlockTag, |oid, birth| {
            let (chunk, slot) = layout.chunk_slot(MetaKind::BlockTag, oid);
            MetaRecord::BlockTag(BlockTagRec {
                oid,
                owner,
                logical: BlockIndex(logical),
                physical: layout.data_block(chunk, slot),
                next: None,
                birth_time: birth,
            })
        })?;
        let new_tag = store.get(MetaKind::BlockTag, oid)?.as_blocktag()?.clone();
        fresh.push(new_tag.physical);

        // Thread the on-disk chain: predecessor's next, or the inode head.
        if let Some((prev_oid, _)) = chain.last().copied() {
            let mut prev = store.get(MetaKind::BlockTag, prev_oid)?.as_blocktag()?.clone();
            prev.next = Some(oid);
            tx.update(store, MetaRecord::BlockTag(prev))?;
        } else {
            inode.first_blktag = Some(oid);
        }
        chain.push((oid, new_tag.birth_time));
    }
    inode.nblocks = chain.len() as u64;
    Ok(fresh)
}

/// Free the tag chain from logical block `from` up, in reverse order.
fn free_blocks_from(
    tx: &mut Tx,
    store: &mut MetaStore,
    inode: &mut InodeRec,
    from: u64,
) -> Result<()> {
    for (oid, birth, _) in store.tags_from(inode.ino, BlockIndex(from)) {
        tx.free(store, MetaKind::BlockTag, oid, birth)?;
    }
    if from == 0 {
        inode.first_blktag = None;
    } else {
        let last_oid = store
            .tag_for(inode.ino, BlockIndex(from - 1))
            .map(|tag| tag.oid);
        if let Some(last_oid) = last_oid {
            let mut last = store.get(MetaKind::BlockTag, last_oid)?.as_blocktag()?.clone();
            if last.next.is_some() {
                last.next = None;
                tx.update(store, MetaRecord::BlockTag(last))?;
            }
        }
    }
    inode.nblocks = from.min(inode.nblocks);
    Ok(())
}

/// Free an inode and its whole tag chain (deferred unlink release).
fn free_inode_and_chain(tx: &mut Tx, store: &mut MetaStore, ino: Ino) -> Result<()> {
    let tags = store.tags_from(ino, BlockIndex(0));
    for (oid, birth, _) in tags {
        tx.free(store, MetaKind::BlockTag, oid, birth)?;
    }
    let birth = store.get(MetaKind::Inode, Oid(ino.0))?.birth_time();
    tx.free(store, MetaKind::Inode, Oid(ino.0), birth)
}

struct Segment {
    blkno: Option<BlockNo>,
    off_in_block: u32,
    start: usize,
    len: usize,
}

fn plan_segments(
    store: &MetaStore,
    ino: Ino,
    offset: u64,
    len: usize,
) -> (Vec<Segment>, usize) {
    let geo = store.geometry();
    let block = u64::from(geo.block_size());
    let mut segments = Vec::new();
    let mut pos = 0_usize;
    while pos < len {
        let at = offset + pos as u64;
        let logical = at / block;
        let off_in_block = (at % block) as u32;
        let span = ((block - u64::from(off_in_block)) as usize).min(len - pos);
        let blkno = store.tag_for(ino, BlockIndex(logical)).map(|t| t.physical);
        segments.push(Segment {
            blkno,
            off_in_block,
            start: pos,
            len: span,
        });
        pos += span;
    }
    (segments, len)
}

impl Mount {
    /// Resolve and (optionally) create the file at `rel`.
    pub fn open_file(&self, rel: &str, flags: OpenFlags) -> Result<OpenedFile> {
        if flags.write && !self.is_leader() {
            return Err(PbfsError::ReadOnly);
        }
        let resolved = self.resolve(rel)?;
        if let Some(target) = resolved.target {
            if flags.create && flags.excl {
                return Err(PbfsError::Exists);
            }
            if matches!(target.kind, InodeKind::Dir) && flags.write {
                return Err(PbfsError::IsDirectory);
            }
            if flags.truncate && flags.write {
                self.truncate_ino(target.ino, target.birth_time, 0)?;
            }
            return Ok(OpenedFile {
                ino: target.ino,
                birth: target.birth_time,
                kind: target.kind,
            });
        }

        if !flags.create {
            return Err(PbfsError::NotFound(format!("no entry at {rel:?}")));
        }
        DirEntryRec::validate_name(&resolved.final_name)?;

        self.with_tx(|tx, store| {
            // Re-resolve under the write lock: the entry may have appeared.
            let info = namei::resolve(store, rel)?;
            if let Some(target) = info.target {
                if flags.excl {
                    return Err(PbfsError::Exists);
                }
                return Ok(OpenedFile {
                    ino: target.ino,
                    birth: target.birth_time,
                    kind: target.kind,
                });
            }
            let now = unix_now();
            let parent = info.parent;
            let ino_oid = tx.alloc_with(store, MetaKind::Inode, |oid, birth| {
                MetaRecord::Inode(InodeRec {
                    ino: Ino(oid.0),
                    kind: InodeKind::File,
                    size: 0,
                    nblocks: 0,
                    mtime: now,
                    ctime: now,
                    refcount: 1,
                    first_blktag: None,
                    parent: Some(parent),
                    birth_time: birth,
                })
            })?;
            let name = info.final_name.clone();
            tx.alloc_with(store, MetaKind::DirEntry, |oid, birth| {
                MetaRecord::DirEntry(DirEntryRec {
                    oid,
                    parent,
                    child: Ino(ino_oid.0),
                    next: None,
                    birth_time: birth,
                    name,
                })
            })?;
            let birth = store.get(MetaKind::Inode, ino_oid)?.birth_time();
            debug!(
                target: "pbfs::file",
                event = "created",
                path = rel,
                ino = ino_oid.0
            );
            Ok(OpenedFile {
                ino: Ino(ino_oid.0),
                birth,
                kind: InodeKind::File,
            })
        })
    }

    /// Register an open handle for deferred-free bookkeeping.
    pub fn note_open(&self, ino: Ino) {
        *self.open_inos.lock().entry(ino).or_insert(0) += 1;
    }

    /// Drop an open handle; when the last local handle on an unlinked inode
    /// goes away, release the inode and its blocks.
    pub fn note_close(&self, ino: Ino) -> Result<()> {
        let last = {
            let mut open = self.open_inos.lock();
            match open.get_mut(&ino) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    open.remove(&ino);
                    true
                }
                None => false,
            }
        };
        if !last || !self.is_leader() {
            return Ok(());
        }
        let unlinked = {
            let store = self.store.read();
            inode_of(&store, ino).map(|inode| inode.refcount == 0)
        };
        match unlinked {
            Ok(true) => self.with_tx(|tx, store| {
                debug!(target: "pbfs::file", event = "deferred_free", ino = ino.0);
                free_inode_and_chain(tx, store, ino)
            }),
            _ => Ok(()),
        }
    }

    /// Read into `buf` at `offset`. Returns bytes read (clipped at EOF).
    pub fn read_at(&self, ino: Ino, birth: BirthTime, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (segments, len) = {
            let store = self.store.read();
            let inode = inode_checked(&store, ino, birth)?;
            if matches!(inode.kind, InodeKind::Dir) {
                return Err(PbfsError::IsDirectory);
            }
            if offset >= inode.size {
                return Ok(0);
            }
            let len = buf.len().min((inode.size - offset) as usize);
            plan_segments(&store, ino, offset, len)
        };

        let geo = {
            let store = self.store.read();
            store.geometry()
        };
        for segment in &segments {
            let out = &mut buf[segment.start..segment.start + segment.len];
            match segment.blkno {
                Some(blkno) => blkio_read(
                    self.interrupt(),
                    self.dev(),
                    geo,
                    self.chunk_start(),
                    &self.counters,
                    out,
                    blkno,
                    segment.off_in_block,
                )?,
                // A hole can only exist transiently after a crash between
                // allocation and data write; it reads as zeros.
                None => out.fill(0),
            }
        }
        Ok(len)
    }

    /// Write `data` at `offset`, or at EOF when `offset` is `None`
    /// (`O_APPEND`). Returns `(bytes written, end offset)`.
    pub fn write_at(
        &self,
        ino: Ino,
        birth: BirthTime,
        offset: Option<u64>,
        data: &[u8],
    ) -> Result<(usize, u64)> {
        if data.is_empty() {
            let store = self.store.read();
            let inode = inode_checked(&store, ino, birth)?;
            return Ok((0, offset.unwrap_or(inode.size)));
        }

        // Allocation Tx: tags for every covered block, size and times.
        // Durable before any data lands.
        let (start, fresh_blocks) = self.with_tx(|tx, store| {
            let mut inode = inode_checked(store, ino, birth)?;
            if matches!(inode.kind, InodeKind::Dir) {
                return Err(PbfsError::IsDirectory);
            }
            let start = offset.unwrap_or(inode.size);
            let end = start
                .checked_add(data.len() as u64)
                .ok_or(PbfsError::FileTooBig)?;
            let geo = store.geometry();
            let fresh = ensure_blocks(tx, store, &mut inode, geo.blocks_for_size(end))?;
            inode.size = inode.size.max(end);
            inode.mtime = unix_now();
            tx.update(store, MetaRecord::Inode(inode))?;
            Ok((start, fresh))
        })?;

        let geo = {
            let store = self.store.read();
            store.geometry()
        };
        // Zero fresh blocks before data so the uncovered parts never expose
        // recycled bytes.
        for blkno in &fresh_blocks {
            blkio_write(
                self.interrupt(),
                self.dev(),
                geo,
                self.chunk_start(),
                &self.counters,
                None,
                *blkno,
                0,
                geo.block_size() as usize,
            )?;
        }

        let segments = {
            let store = self.store.read();
            plan_segments(&store, ino, start, data.len()).0
        };
        for segment in &segments {
            let blkno = segment.blkno.ok_or_else(|| PbfsError::Corruption {
                offset: 0,
                detail: format!("missing block tag during write to inode {ino}"),
            })?;
            blkio_write(
                self.interrupt(),
                self.dev(),
                geo,
                self.chunk_start(),
                &self.counters,
                Some(&data[segment.start..segment.start + segment.len]),
                blkno,
                segment.off_in_block,
                segment.len,
            )?;
        }
        Ok((data.len(), start + data.len() as u64))
    }

    /// Truncate to `len`: trailing tags are freed on shrink, fresh zeroed
    /// blocks appear on grow.
    pub fn truncate_ino(&self, ino: Ino, birth: BirthTime, len: u64) -> Result<()> {
        let (old_size, fresh_blocks) = self.with_tx(|tx, store| {
            let mut inode = inode_checked(store, ino, birth)?;
            if matches!(inode.kind, InodeKind::Dir) {
                return Err(PbfsError::IsDirectory);
            }
            let geo = store.geometry();
            let old_size = inode.size;
            let keep = geo.blocks_for_size(len);
            let fresh = if len < old_size {
                free_blocks_from(tx, store, &mut inode, keep)?;
                Vec::new()
            } else {
                ensure_blocks(tx, store, &mut inode, keep)?
            };
            inode.size = len;
            inode.mtime = unix_now();
            tx.update(store, MetaRecord::Inode(inode))?;
            Ok((old_size, fresh))
        })?;

        let geo = {
            let store = self.store.read();
            store.geometry()
        };
        for blkno in &fresh_blocks {
            blkio_write(
                self.interrupt(),
                self.dev(),
                geo,
                self.chunk_start(),
                &self.counters,
                None,
                *blkno,
                0,
                geo.block_size() as usize,
            )?;
        }
        // Zero the cut tail of the final partial block so a later re-extend
        // reads zeros, not remnants.
        if len < old_size && len % u64::from(geo.block_size()) != 0 {
            let tail_off = (len % u64::from(geo.block_size())) as u32;
            let tail_len = geo.block_size() - tail_off;
            let logical = len / u64::from(geo.block_size());
            let blkno = {
                let store = self.store.read();
                store.tag_for(ino, BlockIndex(logical)).map(|t| t.physical)
            };
            if let Some(blkno) = blkno {
                blkio_write(
                    self.interrupt(),
                    self.dev(),
                    geo,
                    self.chunk_start(),
                    &self.counters,
                    None,
                    blkno,
                    tail_off,
                    tail_len as usize,
                )?;
            }
        }
        Ok(())
    }

    /// Preallocate blocks covering `[offset, offset + len)`. With
    /// `keep_size` the file size is left untouched (blocks beyond EOF stay
    /// invisible to readers).
    pub fn fallocate_ino(
        &self,
        ino: Ino,
        birth: BirthTime,
        offset: u64,
        len: u64,
        keep_size: bool,
    ) -> Result<()> {
        if len == 0 {
            return Err(PbfsError::Invalid("fallocate length must be positive".to_owned()));
        }
        let fresh_blocks = self.with_tx(|tx, store| {
            let mut inode = inode_checked(store, ino, birth)?;
            if matches!(inode.kind, InodeKind::Dir) {
                return Err(PbfsError::IsDirectory);
            }
            let geo = store.geometry();
            let end = offset.checked_add(len).ok_or(PbfsError::FileTooBig)?;
            let fresh = ensure_blocks(tx, store, &mut inode, geo.blocks_for_size(end))?;
            if !keep_size && end > inode.size {
                inode.size = end;
            }
            inode.mtime = unix_now();
            tx.update(store, MetaRecord::Inode(inode))?;
            Ok(fresh)
        })?;

        let geo = {
            let store = self.store.read();
            store.geometry()
        };
        for blkno in &fresh_blocks {
            blkio_write(
                self.interrupt(),
                self.dev(),
                geo,
                self.chunk_start(),
                &self.counters,
                None,
                *blkno,
                0,
                geo.block_size() as usize,
            )?;
        }
        Ok(())
    }

    /// Current size, for `SEEK_END`.
    pub fn size_of(&self, ino: Ino, birth: BirthTime) -> Result<u64> {
        let store = self.store.read();
        Ok(inode_checked(&store, ino, birth)?.size)
    }

    pub fn stat_ino(&self, ino: Ino) -> Result<FileStat> {
        let store = self.store.read();
        let inode = inode_of(&store, ino)?;
        let block_512s = u64::from(store.geometry().block_size()) / 512;
        Ok(FileStat {
            ino: inode.ino.0,
            is_dir: matches!(inode.kind, InodeKind::Dir),
            size: inode.size,
            blocks: inode.nblocks * block_512s,
            mtime: inode.mtime,
            ctime: inode.ctime,
            nlink: inode.refcount,
        })
    }

    pub fn stat_rel(&self, rel: &str) -> Result<FileStat> {
        let info = self.resolve(rel)?;
        let target = info
            .target
            .ok_or_else(|| PbfsError::NotFound(format!("no entry at {rel:?}")))?;
        self.stat_ino(target.ino)
    }

    pub fn statfs(&self) -> Result<FsStat> {
        let store = self.store.read();
        let (total_blocks, free_blocks, total_inodes, free_inodes) = store.space();
        Ok(FsStat {
            block_size: store.geometry().block_size(),
            total_blocks,
            free_blocks,
            total_inodes,
            free_inodes,
        })
    }

    /// Remove a file's directory entry. Block release is deferred while any
    /// local handle is open.
    pub fn unlink_rel(&self, rel: &str) -> Result<()> {
        let _guard = self.guard.read();
        self.with_tx(|tx, store| {
            let info = namei::resolve(store, rel)?;
            let target = info
                .target
                .ok_or_else(|| PbfsError::NotFound(format!("no entry at {rel:?}")))?;
            if matches!(target.kind, InodeKind::Dir) {
                return Err(PbfsError::IsDirectory);
            }
            let (dentry_oid, dentry_birth) = target
                .dentry
                .ok_or_else(|| PbfsError::Invalid("cannot unlink the root".to_owned()))?;
            tx.free(store, MetaKind::DirEntry, dentry_oid, dentry_birth)?;

            let open_here = self.open_inos.lock().contains_key(&target.ino);
            if open_here {
                let mut inode = inode_of(store, target.ino)?;
                inode.refcount = 0;
                tx.update(store, MetaRecord::Inode(inode))?;
            } else {
                free_inode_and_chain(tx, store, target.ino)?;
            }
            debug!(
                target: "pbfs::file",
                event = "unlinked",
                path = rel,
                ino = target.ino.0,
                deferred = open_here
            );
            Ok(())
        })
    }

    pub fn mkdir_rel(&self, rel: &str) -> Result<Ino> {
        let _guard = self.guard.read();
        self.with_tx(|tx, store| {
            let info = namei::resolve(store, rel)?;
            if info.target.is_some() {
                return Err(PbfsError::Exists);
            }
            DirEntryRec::validate_name(&info.final_name)?;
            let now = unix_now();
            let parent = info.parent;
            let ino_oid = tx.alloc_with(store, MetaKind::Inode, |oid, birth| {
                MetaRecord::Inode(InodeRec {
                    ino: Ino(oid.0),
                    kind: InodeKind::Dir,
                    size: 0,
                    nblocks: 0,
                    mtime: now,
                    ctime: now,
                    refcount: 1,
                    first_blktag: None,
                    parent: Some(parent),
                    birth_time: birth,
                })
            })?;
            let name = info.final_name.clone();
            tx.alloc_with(store, MetaKind::DirEntry, |oid, birth| {
                MetaRecord::DirEntry(DirEntryRec {
                    oid,
                    parent,
                    child: Ino(ino_oid.0),
                    next: None,
                    birth_time: birth,
                    name,
                })
            })?;
            Ok(Ino(ino_oid.0))
        })
    }

    pub fn rmdir_rel(&self, rel: &str) -> Result<()> {
        let _guard = self.guard.read();
        self.with_tx(|tx, store| {
            let info = namei::resolve(store, rel)?;
            let target = info
                .target
                .ok_or_else(|| PbfsError::NotFound(format!("no entry at {rel:?}")))?;
            if !matches!(target.kind, InodeKind::Dir) {
                return Err(PbfsError::NotDirectory);
            }
            let (dentry_oid, dentry_birth) = target
                .dentry
                .ok_or_else(|| PbfsError::Invalid("cannot remove the root".to_owned()))?;
            if !store.dir_is_empty(target.ino) {
                return Err(PbfsError::NotEmpty);
            }
            tx.free(store, MetaKind::DirEntry, dentry_oid, dentry_birth)?;
            tx.free(store, MetaKind::Inode, Oid(target.ino.0), target.birth_time)?;
            Ok(())
        })
    }

    /// Atomic rename. With `noreplace`, an existing destination fails with
    /// `Exists`; otherwise a file destination is replaced and an empty
    /// directory destination is swapped out.
    pub fn rename_rel(&self, src_rel: &str, dst_rel: &str, noreplace: bool) -> Result<()> {
        let _guard = self.guard.read();
        self.with_tx(|tx, store| {
            let src = namei::resolve(store, src_rel)?;
            let src_target = src
                .target
                .ok_or_else(|| PbfsError::NotFound(format!("no entry at {src_rel:?}")))?;
            let (src_dentry_oid, src_dentry_birth) = src_target
                .dentry
                .ok_or_else(|| PbfsError::Invalid("cannot rename the root".to_owned()))?;

            let dst = namei::resolve(store, dst_rel)?;
            if dst.final_name.is_empty() {
                return Err(PbfsError::Invalid("empty rename destination".to_owned()));
            }
            DirEntryRec::validate_name(&dst.final_name)?;

            // Renaming a directory beneath itself would orphan the subtree.
            if matches!(src_target.kind, InodeKind::Dir) {
                let mut cursor = Some(dst.parent);
                while let Some(ino) = cursor {
                    if ino == src_target.ino {
                        return Err(PbfsError::Invalid(
                            "cannot move a directory into itself".to_owned(),
                        ));
                    }
                    cursor = inode_of(store, ino)?.parent;
                }
            }

            if let Some(dst_target) = dst.target {
                if dst_target.ino == src_target.ino {
                    return Ok(());
                }
                if noreplace {
                    return Err(PbfsError::Exists);
                }
                match (src_target.kind, dst_target.kind) {
                    (InodeKind::File, InodeKind::Dir) => return Err(PbfsError::IsDirectory),
                    (InodeKind::Dir, InodeKind::File) => return Err(PbfsError::NotDirectory),
                    (InodeKind::Dir, InodeKind::Dir) => {
                        if !store.dir_is_empty(dst_target.ino) {
                            return Err(PbfsError::NotEmpty);
                        }
                    }
                    (InodeKind::File, InodeKind::File) => {}
                }
                let (dst_dentry_oid, dst_dentry_birth) = dst_target
                    .dentry
                    .ok_or_else(|| PbfsError::Invalid("cannot replace the root".to_owned()))?;
                tx.free(store, MetaKind::DirEntry, dst_dentry_oid, dst_dentry_birth)?;
                match dst_target.kind {
                    InodeKind::Dir => {
                        tx.free(store, MetaKind::Inode, Oid(dst_target.ino.0), dst_target.birth_time)?;
                    }
                    InodeKind::File => {
                        let open_here = self.open_inos.lock().contains_key(&dst_target.ino);
                        if open_here {
                            let mut inode = inode_of(store, dst_target.ino)?;
                            inode.refcount = 0;
                            tx.update(store, MetaRecord::Inode(inode))?;
                        } else {
                            free_inode_and_chain(tx, store, dst_target.ino)?;
                        }
                    }
                }
            }

            tx.free(store, MetaKind::DirEntry, src_dentry_oid, src_dentry_birth)?;
            let parent = dst.parent;
            let name = dst.final_name.clone();
            let child = src_target.ino;
            tx.alloc_with(store, MetaKind::DirEntry, |oid, birth| {
                MetaRecord::DirEntry(DirEntryRec {
                    oid,
                    parent,
                    child,
                    next: None,
                    birth_time: birth,
                    name,
                })
            })?;
            if src.parent != dst.parent {
                let mut inode = inode_of(store, src_target.ino)?;
                inode.parent = Some(dst.parent);
                tx.update(store, MetaRecord::Inode(inode))?;
            }
            debug!(
                target: "pbfs::file",
                event = "renamed",
                src = src_rel,
                dst = dst_rel
            );
            Ok(())
        })
    }

    /// Snapshot a directory's entries for iteration.
    pub fn readdir_ino(&self, ino: Ino) -> Result<Vec<DirEntryInfo>> {
        let store = self.store.read();
        let inode = inode_of(&store, ino)?;
        if !matches!(inode.kind, InodeKind::Dir) {
            return Err(PbfsError::NotDirectory);
        }
        store
            .dir_entries(ino)
            .into_iter()
            .map(|entry| {
                let child = inode_of(&store, entry.child)?;
                Ok(DirEntryInfo {
                    name: entry.name.clone(),
                    ino: entry.child.0,
                    is_dir: matches!(child.kind, InodeKind::Dir),
                })
            })
            .collect()
    }

    /// The file→device mapping, merged into contiguous extents.
    pub fn fmap_ino(&self, ino: Ino, birth: BirthTime) -> Result<Vec<FmapEntry>> {
        let store = self.store.read();
        let inode = inode_checked(&store, ino, birth)?;
        if matches!(inode.kind, InodeKind::Dir) {
            return Err(PbfsError::IsDirectory);
        }
        let geo = store.geometry();
        let block = u64::from(geo.block_size());
        let base = self.chunk_start().0;
        let mut entries: Vec<FmapEntry> = Vec::new();
        for tag in store.file_tags(ino) {
            let logical = tag.logical.0 * block;
            let physical = base + tag.physical.0 * block;
            if let Some(last) = entries.last_mut() {
                if last.logical_offset + last.length == logical
                    && last.physical_offset + last.length == physical
                {
                    last.length += block;
                    continue;
                }
            }
            entries.push(FmapEntry {
                logical_offset: logical,
                physical_offset: physical,
                length: block,
            });
        }
        Ok(entries)
    }

    /// Flush the device write cache. Does NOT flush the metadata journal;
    /// metadata is durable at Tx commit.
    pub fn fsync(&self) -> Result<()> {
        self.dev().flush(self.interrupt())
    }
}
