#![forbid(unsafe_code)]
//! PBFS core: mounts, path resolution, file operations, and the
//! POSIX-shaped facade.
//!
//! All process-wide state lives in an explicitly scoped [`Environment`]
//! (mount table, descriptor tables, working directory); tests construct and
//! destroy several per process. Descriptors are slab slots paired with a
//! generation so a handle that survives an umount/remount cycle is detected
//! as stale instead of touching the wrong mount.

pub mod api;
pub mod file;
pub mod mount;
pub mod namei;

pub use api::Pbfs;
pub use file::{DirEntryInfo, FileStat, FmapEntry, FsStat, OpenFlags, OpenedFile};
pub use mount::{growfs_standalone, mkfs, Mount, MountOptions, MountState};

use parking_lot::{Mutex, RwLock};
use pbfs_dev::DevIo;
use pbfs_error::{PbfsError, Result};
use pbfs_types::{BirthTime, Ino, MAX_NFILE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Seek origin for [`Environment::lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// One open file description.
#[derive(Debug)]
pub struct FileHandle {
    mount: Arc<Mount>,
    mount_slot: usize,
    mount_gen: u64,
    pub ino: Ino,
    pub birth: BirthTime,
    flags: OpenFlags,
    /// Level-5 lock: serializes the shared offset (non-positional I/O and
    /// `O_APPEND`).
    offset: Mutex<u64>,
    /// Level-4 lock: read for I/O, write for close.
    rw: RwLock<()>,
}

/// One open directory stream (snapshot + cursor).
#[derive(Debug)]
struct DirStream {
    entries: Vec<DirEntryInfo>,
    pos: usize,
}

struct MountSlot {
    name: String,
    generation: u64,
    mount: Arc<Mount>,
}

#[derive(Default)]
struct MountTable {
    slots: Vec<Option<MountSlot>>,
    next_generation: u64,
}

/// Explicitly scoped process state: the mount table, descriptor tables,
/// and working directory.
pub struct Environment {
    run_dir: PathBuf,
    /// Level-1 lock.
    mounts: Mutex<MountTable>,
    files: Mutex<Vec<Option<Arc<FileHandle>>>>,
    dirs: Mutex<HashMap<usize, DirStream>>,
    next_dir_id: Mutex<usize>,
    cwd: RwLock<String>,
}

impl Environment {
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            mounts: Mutex::new(MountTable::default()),
            files: Mutex::new(Vec::new()),
            dirs: Mutex::new(HashMap::new()),
            next_dir_id: Mutex::new(1),
            cwd: RwLock::new("/".to_owned()),
        }
    }

    #[must_use]
    pub fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }

    // ── Mount table ─────────────────────────────────────────────────────

    /// Mount a device under `pbd`. A second mount of the same name in this
    /// environment fails with `Busy`.
    pub fn mount(&self, pbd: &str, dev: Arc<dyn DevIo>, mut options: MountOptions) -> Result<()> {
        options.run_dir.clone_from(&self.run_dir);
        let mut table = self.mounts.lock();
        if table
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.name == pbd)
        {
            return Err(PbfsError::Busy);
        }
        let mount = Arc::new(Mount::attach(pbd, dev, options)?);
        table.next_generation += 1;
        let slot = MountSlot {
            name: pbd.to_owned(),
            generation: table.next_generation,
            mount,
        };
        if let Some(idx) = table.slots.iter().position(Option::is_none) {
            table.slots[idx] = Some(slot);
        } else {
            table.slots.push(Some(slot));
        }
        Ok(())
    }

    pub fn umount(&self, pbd: &str, force: bool) -> Result<()> {
        let removed = {
            let mut table = self.mounts.lock();
            let idx = table
                .slots
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|s| s.name == pbd))
                .ok_or_else(|| PbfsError::NotFound(format!("no mount named {pbd:?}")))?;
            table.slots[idx].take().expect("slot just located")
        };
        // Stale descriptors are fenced by the generation check; drop them
        // lazily on next use.
        removed.mount.umount(force)?;
        info!(target: "pbfs::env", event = "umount", pbd, force);
        Ok(())
    }

    /// Look up a mount by name.
    pub fn find_mount(&self, pbd: &str) -> Result<Arc<Mount>> {
        self.mount_entry(pbd).map(|(mount, _, _)| mount)
    }

    fn mount_entry(&self, pbd: &str) -> Result<(Arc<Mount>, usize, u64)> {
        let table = self.mounts.lock();
        table
            .slots
            .iter()
            .enumerate()
            .find_map(|(idx, slot)| {
                slot.as_ref().and_then(|s| {
                    (s.name == pbd).then(|| (Arc::clone(&s.mount), idx, s.generation))
                })
            })
            .ok_or_else(|| PbfsError::NotFound(format!("no mount named {pbd:?}")))
    }

    fn mount_generation_live(&self, slot: usize, generation: u64) -> bool {
        let table = self.mounts.lock();
        table
            .slots
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|s| s.generation == generation)
    }

    pub fn remount_rw(&self, pbd: &str, host: pbfs_types::HostId, force_epoch: bool) -> Result<()> {
        self.find_mount(pbd)?.remount_rw(host, force_epoch)
    }

    pub fn growfs(&self, pbd: &str) -> Result<u32> {
        self.find_mount(pbd)?.growfs()
    }

    /// Resolve `path` (possibly relative to the working directory) into a
    /// mount and a mount-relative remainder.
    pub fn locate(&self, path: &str) -> Result<(Arc<Mount>, String)> {
        let cwd = self.cwd.read().clone();
        let full = namei::absolute(&cwd, path)?;
        let (pbd, rest) = namei::split_device(&full)?;
        let mount = self.find_mount(pbd)?;
        Ok((mount, format!("/{rest}")))
    }

    // ── File descriptors ────────────────────────────────────────────────

    /// Open a file; returns the raw descriptor slot.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<usize> {
        let (mount, rel) = self.locate(path)?;
        let (_, slot_idx, generation) = self.mount_entry(mount.pbd())?;
        let opened = mount.open_file(&rel, flags)?;
        if matches!(opened.kind, pbfs_ondisk::InodeKind::Dir) && flags.write {
            return Err(PbfsError::IsDirectory);
        }

        let mut files = self.files.lock();
        let free = files.iter().position(Option::is_none).unwrap_or(files.len());
        if free >= MAX_NFILE {
            return Err(PbfsError::TooManyFiles);
        }
        mount.note_open(opened.ino);
        let handle = Arc::new(FileHandle {
            mount,
            mount_slot: slot_idx,
            mount_gen: generation,
            ino: opened.ino,
            birth: opened.birth,
            flags,
            offset: Mutex::new(0),
            rw: RwLock::new(()),
        });
        if free == files.len() {
            files.push(Some(handle));
        } else {
            files[free] = Some(handle);
        }
        Ok(free)
    }

    fn handle(&self, fd: usize) -> Result<Arc<FileHandle>> {
        let files = self.files.lock();
        let handle = files
            .get(fd)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(PbfsError::BadFd)?;
        if !self.mount_generation_live(handle.mount_slot, handle.mount_gen) {
            return Err(PbfsError::BadFd);
        }
        Ok(handle)
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        let handle = {
            let mut files = self.files.lock();
            files
                .get_mut(fd)
                .and_then(Option::take)
                .ok_or(PbfsError::BadFd)?
        };
        let _w = handle.rw.write();
        if self.mount_generation_live(handle.mount_slot, handle.mount_gen) {
            handle.mount.note_close(handle.ino)?;
        }
        Ok(())
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle(fd)?;
        if !handle.flags.read {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        let mut offset = handle.offset.lock();
        let n = handle.mount.read_at(handle.ino, handle.birth, *offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    pub fn pread(&self, fd: usize, buf: &mut [u8], offset: u64) -> Result<usize> {
        let handle = self.handle(fd)?;
        if !handle.flags.read {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        handle.mount.read_at(handle.ino, handle.birth, offset, buf)
    }

    pub fn write(&self, fd: usize, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fd)?;
        if !handle.flags.write {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        let mut offset = handle.offset.lock();
        let at = if handle.flags.append {
            None
        } else {
            Some(*offset)
        };
        let (n, end) = handle.mount.write_at(handle.ino, handle.birth, at, data)?;
        *offset = end;
        Ok(n)
    }

    pub fn pwrite(&self, fd: usize, data: &[u8], offset: u64) -> Result<usize> {
        let handle = self.handle(fd)?;
        if !handle.flags.write {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        let (n, _) = handle
            .mount
            .write_at(handle.ino, handle.birth, Some(offset), data)?;
        Ok(n)
    }

    pub fn lseek(&self, fd: usize, offset: i64, whence: Whence) -> Result<u64> {
        let handle = self.handle(fd)?;
        let _r = handle.rw.read();
        let mut cursor = handle.offset.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *cursor,
            Whence::End => {
                // A follower's cached size may be stale; drain the journal
                // tail before answering.
                if !handle.mount.is_leader() {
                    handle.mount.poll()?;
                }
                handle.mount.size_of(handle.ino, handle.birth)?
            }
        };
        let target = if offset < 0 {
            base.checked_sub(offset.unsigned_abs())
        } else {
            base.checked_add(offset as u64)
        }
        .ok_or_else(|| PbfsError::Invalid("seek before start of file".to_owned()))?;
        *cursor = target;
        Ok(target)
    }

    pub fn ftruncate(&self, fd: usize, len: u64) -> Result<()> {
        let handle = self.handle(fd)?;
        if !handle.flags.write {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        handle.mount.truncate_ino(handle.ino, handle.birth, len)
    }

    pub fn fallocate(&self, fd: usize, offset: u64, len: u64, keep_size: bool) -> Result<()> {
        let handle = self.handle(fd)?;
        if !handle.flags.write {
            return Err(PbfsError::BadFd);
        }
        let _mount = handle.mount.io_guard();
        let _r = handle.rw.read();
        handle
            .mount
            .fallocate_ino(handle.ino, handle.birth, offset, len, keep_size)
    }

    pub fn fstat(&self, fd: usize) -> Result<FileStat> {
        let handle = self.handle(fd)?;
        handle.mount.stat_ino(handle.ino)
    }

    pub fn fstatfs(&self, fd: usize) -> Result<FsStat> {
        let handle = self.handle(fd)?;
        handle.mount.statfs()
    }

    pub fn fmap(&self, fd: usize) -> Result<Vec<FmapEntry>> {
        let handle = self.handle(fd)?;
        handle.mount.fmap_ino(handle.ino, handle.birth)
    }

    pub fn fsync(&self, fd: usize) -> Result<()> {
        let handle = self.handle(fd)?;
        handle.mount.fsync()
    }

    // ── Path operations ─────────────────────────────────────────────────

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let (mount, rel) = self.locate(path)?;
        mount.stat_rel(&rel)
    }

    pub fn statfs(&self, path: &str) -> Result<FsStat> {
        let (mount, _) = self.locate(path)?;
        mount.statfs()
    }

    pub fn access(&self, path: &str) -> Result<()> {
        self.stat(path).map(|_| ())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (mount, rel) = self.locate(path)?;
        mount.unlink_rel(&rel)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (mount, rel) = self.locate(path)?;
        mount.mkdir_rel(&rel).map(|_| ())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (mount, rel) = self.locate(path)?;
        mount.rmdir_rel(&rel)
    }

    pub fn rename(&self, src: &str, dst: &str, noreplace: bool) -> Result<()> {
        let (src_mount, src_rel) = self.locate(src)?;
        let (dst_mount, dst_rel) = self.locate(dst)?;
        if !Arc::ptr_eq(&src_mount, &dst_mount) {
            return Err(PbfsError::CrossDevice);
        }
        src_mount.rename_rel(&src_rel, &dst_rel, noreplace)
    }

    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let (mount, rel) = self.locate(path)?;
        let info = mount.resolve(&rel)?;
        let target = info
            .target
            .ok_or_else(|| PbfsError::NotFound(format!("no entry at {path:?}")))?;
        mount.truncate_ino(target.ino, target.birth_time, len)
    }

    pub fn chdir(&self, path: &str) -> Result<()> {
        let (mount, rel) = self.locate(path)?;
        let info = mount.resolve(&rel)?;
        let target = info
            .target
            .ok_or_else(|| PbfsError::NotFound(format!("no entry at {path:?}")))?;
        if !matches!(target.kind, pbfs_ondisk::InodeKind::Dir) {
            return Err(PbfsError::NotDirectory);
        }
        let cwd = self.cwd.read().clone();
        *self.cwd.write() = namei::absolute(&cwd, path)?;
        Ok(())
    }

    #[must_use]
    pub fn getcwd(&self) -> String {
        self.cwd.read().clone()
    }

    // ── Directory streams ───────────────────────────────────────────────

    pub fn opendir(&self, path: &str) -> Result<usize> {
        let (mount, rel) = self.locate(path)?;
        let info = mount.resolve(&rel)?;
        let target = info
            .target
            .ok_or_else(|| PbfsError::NotFound(format!("no entry at {path:?}")))?;
        if !matches!(target.kind, pbfs_ondisk::InodeKind::Dir) {
            return Err(PbfsError::NotDirectory);
        }
        let entries = mount.readdir_ino(target.ino)?;
        let mut next_id = self.next_dir_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.dirs.lock().insert(id, DirStream { entries, pos: 0 });
        Ok(id)
    }

    pub fn readdir(&self, dir: usize) -> Result<Option<DirEntryInfo>> {
        let mut dirs = self.dirs.lock();
        let stream = dirs.get_mut(&dir).ok_or(PbfsError::BadFd)?;
        if stream.pos >= stream.entries.len() {
            return Ok(None);
        }
        let entry = stream.entries[stream.pos].clone();
        stream.pos += 1;
        Ok(Some(entry))
    }

    pub fn closedir(&self, dir: usize) -> Result<()> {
        self.dirs
            .lock()
            .remove(&dir)
            .map(|_| ())
            .ok_or(PbfsError::BadFd)
    }
}
