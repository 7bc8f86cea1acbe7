//! Mount lifecycle.
//!
//! A mount binds one process to one PBD: it loads the superblock and chunk
//! metadata, replays the journal, and (for the leader) holds the fencing
//! epoch and journal cursor. Followers never write; they re-poll the
//! journal tail and fold committed transactions into their store.

use crate::namei;
use parking_lot::{Mutex, RwLock};
use pbfs_blkio::BlkioCounters;
use pbfs_dev::{DevIo, IoFlags};
use pbfs_error::{PbfsError, Result};
use pbfs_journal::fence::{self, FenceRegion};
use pbfs_journal::lockfile::HostLockFile;
use pbfs_journal::{scan_records, Journal, JournalRegion};
use pbfs_meta::tx::Tx;
use pbfs_meta::MetaStore;
use pbfs_ondisk::{compute_layout, ChunkLayout, InodeKind, InodeRec, MetaKind, MetaRecord, Superblock};
use pbfs_types::{
    ByteOffset, Epoch, HostId, Ino, Interrupt, TxId, HOSTID_RANGE_PREPARE, HOSTID_RANGE_TOOL,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Journal occupancy that triggers a leader-side checkpoint.
const CHECKPOINT_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Directory holding the hostid lock files.
    pub run_dir: PathBuf,
    pub host_id: HostId,
    pub read_write: bool,
    /// Usurp an existing lease by outbidding its epoch (remount `-q` path).
    pub force_epoch: bool,
    pub paxos_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/var/run/pbfs"),
            host_id: HostId(0),
            read_write: false,
            force_epoch: false,
            paxos_timeout: fence::DEFAULT_ACQUIRE_TIMEOUT,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Per-host mount state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Init,
    Preparing,
    ReadOnly,
    ReadWrite,
    Umounting,
}

/// One mounted PBD.
pub struct Mount {
    pbd: String,
    dev: Arc<dyn DevIo>,
    layout: ChunkLayout,
    chunk_start: ByteOffset,
    journal_region: JournalRegion,
    fence_region: FenceRegion,
    host_id: HostId,
    options: MountOptions,
    sb: Mutex<Superblock>,
    state: Mutex<MountState>,
    epoch: Mutex<Epoch>,
    /// Level-2 lock: read for I/O, write for umount/remount/growfs.
    pub(crate) guard: RwLock<()>,
    /// Level-3 meta lock.
    pub(crate) store: RwLock<MetaStore>,
    journal: Mutex<Option<Journal>>,
    pub(crate) counters: BlkioCounters,
    interrupt: Interrupt,
    /// Bumped on remount/umount; the channel layer uses it to detect stale
    /// connections.
    mount_epoch: AtomicU64,
    hostid_lock: Mutex<Option<HostLockFile>>,
    /// Local open-handle counts per inode, for deferred free of unlinked
    /// inodes.
    pub(crate) open_inos: Mutex<HashMap<Ino, usize>>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("pbd", &self.pbd)
            .field("host_id", &self.host_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

// ── mkfs / growfs (tool mode) ───────────────────────────────────────────────

/// Format a device: region map, fence and journal extents, empty chunk
/// headers, and the root directory. Serialized against mounts by the
/// tool-mode host lock range.
pub fn mkfs(
    run_dir: &std::path::Path,
    pbd: &str,
    dev: &dyn DevIo,
    geo: pbfs_types::Geometry,
    journal_len: u64,
) -> Result<Superblock> {
    let _tool_lock = HostLockFile::acquire(run_dir, pbd, HOSTID_RANGE_TOOL)?;
    let ir = Interrupt::none();
    let sb = compute_layout(geo, dev.capacity_bytes(), journal_len)?;
    let sector = geo.sector_size() as usize;

    // Zero the fence slots and journal extent so stale leases and records
    // from a previous filesystem cannot resurface.
    let fence_len = pbfs_types::MAX_HOSTS as usize * sector;
    dev.pwrite(&ir, None, ByteOffset(sb.fence_off), fence_len, IoFlags::ZERO)?;
    dev.pwrite(
        &ir,
        None,
        ByteOffset(sb.journal_off),
        usize::try_from(sb.journal_len)
            .map_err(|_| PbfsError::Invalid("journal length exceeds usize".to_owned()))?,
        IoFlags::ZERO,
    )?;

    // Root directory via a real transaction, then checkpoint everything.
    let mut store = MetaStore::new(geo, sb.chunk_count)?;
    let region = JournalRegion::from_superblock(&sb);
    let (mut journal, _) = Journal::open(&ir, dev, region, TxId(0))?;
    let mut tx = Tx::begin();
    let root = tx.alloc_with(&mut store, MetaKind::Inode, |oid, birth| {
        MetaRecord::Inode(InodeRec {
            ino: Ino(oid.0),
            kind: InodeKind::Dir,
            size: 0,
            nblocks: 0,
            mtime: 0,
            ctime: 0,
            refcount: 1,
            first_blktag: None,
            parent: None,
            birth_time: birth,
        })
    })?;
    debug_assert_eq!(root, pbfs_types::Oid(Ino::ROOT.0));
    tx.commit(&ir, dev, &mut journal, &mut store, HostId(0), Epoch(0))?;

    let layout = ChunkLayout::new(geo)?;
    let mut sb = sb;
    sb.checkpoint_txid = store.committed_txid().0;
    for chunk in 0..sb.chunk_count {
        let buf = store.encode_chunk_meta(chunk)?;
        let off = layout.chunk_meta_off(ByteOffset(sb.chunk_start), geo, chunk);
        dev.pwrite(&ir, Some(&buf), ByteOffset(off), buf.len(), IoFlags::empty())?;
    }
    dev.flush(&ir)?;
    let sb_bytes = sb.serialize(sector);
    dev.pwrite(&ir, Some(&sb_bytes), ByteOffset::ZERO, sb_bytes.len(), IoFlags::empty())?;
    dev.flush(&ir)?;
    info!(
        target: "pbfs::mount",
        event = "mkfs",
        pbd,
        chunks = sb.chunk_count,
        journal_len = sb.journal_len
    );
    Ok(sb)
}

/// Tool-mode growfs: append chunks for capacity the device gained since
/// mkfs. The filesystem must not be mounted read-write anywhere.
pub fn growfs_standalone(run_dir: &std::path::Path, pbd: &str, dev: &dyn DevIo) -> Result<u32> {
    let _tool_lock = HostLockFile::acquire(run_dir, pbd, HOSTID_RANGE_TOOL)?;
    let _prepare_lock = HostLockFile::acquire(run_dir, pbd, HOSTID_RANGE_PREPARE)?;
    let ir = Interrupt::none();
    let sb = read_superblock(&ir, dev)?;
    let capacity = dev.refresh_capacity()?;
    extend_chunks_on_disk(&ir, dev, sb, capacity)
}

fn read_superblock(ir: &Interrupt, dev: &dyn DevIo) -> Result<Superblock> {
    let sector = dev.capabilities().sector_size as usize;
    let mut probe = vec![0_u8; sector];
    dev.pread(ir, &mut probe, ByteOffset::ZERO, IoFlags::empty())?;
    Superblock::deserialize(&probe)
}

fn extend_chunks_on_disk(
    ir: &Interrupt,
    dev: &dyn DevIo,
    mut sb: Superblock,
    capacity: u64,
) -> Result<u32> {
    let geo = sb.geometry;
    let layout = ChunkLayout::new(geo)?;
    if capacity <= sb.chunk_start {
        return Err(PbfsError::NoSpace);
    }
    let new_count = u32::try_from((capacity - sb.chunk_start) / geo.chunk_size())
        .map_err(|_| PbfsError::Invalid("chunk count exceeds u32".to_owned()))?;
    if new_count <= sb.chunk_count {
        return Err(PbfsError::Invalid(format!(
            "device holds {new_count} chunks, no growth over {}",
            sb.chunk_count
        )));
    }

    // Fresh, empty headers for the appended chunks.
    let empty = MetaStore::new(geo, new_count)?;
    for chunk in sb.chunk_count..new_count {
        let buf = empty.encode_chunk_meta(chunk)?;
        let off = layout.chunk_meta_off(ByteOffset(sb.chunk_start), geo, chunk);
        dev.pwrite(ir, Some(&buf), ByteOffset(off), buf.len(), IoFlags::empty())?;
    }
    dev.flush(ir)?;

    let old = sb.chunk_count;
    sb.chunk_count = new_count;
    let sb_bytes = sb.serialize(geo.sector_size() as usize);
    dev.pwrite(ir, Some(&sb_bytes), ByteOffset::ZERO, sb_bytes.len(), IoFlags::empty())?;
    dev.flush(ir)?;
    info!(
        target: "pbfs::mount",
        event = "growfs",
        old_chunks = old,
        new_chunks = new_count
    );
    Ok(new_count)
}

// ── Mount lifecycle ─────────────────────────────────────────────────────────

impl Mount {
    /// Mount `pbd` from an open device.
    ///
    /// Acquires the host-local locks, verifies the superblock, runs the
    /// fencing round when mounting read-write, and replays the journal into
    /// the metadata store.
    pub fn attach(pbd: &str, dev: Arc<dyn DevIo>, options: MountOptions) -> Result<Self> {
        let hostid_lock = HostLockFile::acquire(&options.run_dir, pbd, options.host_id.0)?;
        let prepare_lock = HostLockFile::acquire(&options.run_dir, pbd, HOSTID_RANGE_PREPARE)?;

        let interrupt = Interrupt::new();
        let ir = interrupt.with_deadline(options.paxos_timeout.max(Duration::from_secs(60)));
        let sb = read_superblock(&ir, dev.as_ref())?;
        let geo = sb.geometry;
        let layout = ChunkLayout::new(geo)?;
        let journal_region = JournalRegion::from_superblock(&sb);
        let fence_region = FenceRegion::from_superblock(&sb);

        let mut store = MetaStore::new(geo, sb.chunk_count)?;
        load_chunks(&ir, dev.as_ref(), &sb, &layout, &mut store)?;
        store.rebuild_indexes();

        let (epoch, journal) = if options.read_write {
            let epoch = fence::acquire_leadership(
                &ir,
                dev.as_ref(),
                fence_region,
                options.host_id,
                options.force_epoch,
                options.paxos_timeout,
            )?;
            let (journal, records) =
                Journal::open(&ir, dev.as_ref(), journal_region, store.committed_txid())?;
            for record in records {
                store.apply_record(&record)?;
            }
            (epoch, Some(journal))
        } else {
            for record in scan_records(&ir, dev.as_ref(), journal_region, store.committed_txid())? {
                store.apply_record(&record)?;
            }
            (Epoch(0), None)
        };

        store.verify_invariants()?;
        let state = if options.read_write {
            MountState::ReadWrite
        } else {
            MountState::ReadOnly
        };
        info!(
            target: "pbfs::mount",
            event = "mounted",
            pbd,
            host = options.host_id.0,
            rw = options.read_write,
            epoch = epoch.0,
            committed = store.committed_txid().0
        );
        drop(prepare_lock);

        Ok(Self {
            pbd: pbd.to_owned(),
            dev,
            layout,
            chunk_start: ByteOffset(sb.chunk_start),
            journal_region,
            fence_region,
            host_id: options.host_id,
            options,
            sb: Mutex::new(sb),
            state: Mutex::new(state),
            epoch: Mutex::new(epoch),
            guard: RwLock::new(()),
            store: RwLock::new(store),
            journal: Mutex::new(journal),
            counters: BlkioCounters::default(),
            interrupt,
            mount_epoch: AtomicU64::new(1),
            hostid_lock: Mutex::new(Some(hostid_lock)),
            open_inos: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn pbd(&self) -> &str {
        &self.pbd
    }

    #[must_use]
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    #[must_use]
    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state() == MountState::ReadWrite
    }

    #[must_use]
    pub fn mount_epoch(&self) -> u64 {
        self.mount_epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Hold the mount open across an I/O operation (blocks umount/remount).
    /// Callers acquire this before any per-file lock.
    #[must_use]
    pub fn io_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.guard.read()
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.options.poll_interval
    }

    pub(crate) fn dev(&self) -> &dyn DevIo {
        self.dev.as_ref()
    }

    #[must_use]
    pub(crate) fn chunk_start(&self) -> ByteOffset {
        self.chunk_start
    }

    pub(crate) fn require_leader(&self) -> Result<Epoch> {
        if !self.is_leader() {
            return Err(PbfsError::ReadOnly);
        }
        Ok(*self.epoch.lock())
    }

    /// Run `f` inside a single metadata transaction under the meta write
    /// lock, committing on `Ok` and rolling back on `Err`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&mut Tx, &mut MetaStore) -> Result<T>,
    ) -> Result<T> {
        let epoch = self.require_leader()?;
        let mut store = self.store.write();
        let mut journal_guard = self.journal.lock();
        let journal = journal_guard.as_mut().ok_or(PbfsError::ReadOnly)?;

        let mut tx = Tx::begin();
        match f(&mut tx, &mut store) {
            Ok(value) => {
                tx.commit(
                    &self.interrupt,
                    self.dev.as_ref(),
                    journal,
                    &mut store,
                    self.host_id,
                    epoch,
                )?;
                let utilization = journal.utilization();
                drop(journal_guard);
                drop(store);
                if utilization > CHECKPOINT_THRESHOLD {
                    // The transaction is already durable; a failed
                    // checkpoint only delays journal reclamation.
                    if let Err(err) = self.checkpoint() {
                        warn!(
                            target: "pbfs::mount",
                            event = "checkpoint_failed",
                            error = %err
                        );
                    }
                }
                Ok(value)
            }
            Err(err) => {
                tx.abort(&mut store);
                Err(err)
            }
        }
    }

    /// Resolve a mount-relative path under the meta read lock.
    pub fn resolve(&self, rel: &str) -> Result<namei::NameInfo> {
        let store = self.store.read();
        namei::resolve(&store, rel)
    }

    /// Fold the metadata tables back into the chunk headers and advance the
    /// superblock checkpoint, releasing journal space.
    pub fn checkpoint(&self) -> Result<()> {
        self.require_leader()?;
        let ir = &self.interrupt;
        let store = self.store.write();
        let geo = store.geometry();
        let committed = store.committed_txid();
        for chunk in 0..store.chunk_count() {
            let buf = store.encode_chunk_meta(chunk)?;
            let off = self.layout.chunk_meta_off(self.chunk_start, geo, chunk);
            self.dev
                .pwrite(ir, Some(&buf), ByteOffset(off), buf.len(), IoFlags::empty())?;
        }
        self.dev.flush(ir)?;

        let mut sb = self.sb.lock();
        sb.checkpoint_txid = committed.0;
        let bytes = sb.serialize(geo.sector_size() as usize);
        self.dev
            .pwrite(ir, Some(&bytes), ByteOffset::ZERO, bytes.len(), IoFlags::empty())?;
        self.dev.flush(ir)?;
        drop(sb);

        if let Some(journal) = self.journal.lock().as_mut() {
            journal.note_checkpoint();
        }
        info!(
            target: "pbfs::mount",
            event = "checkpoint",
            pbd = %self.pbd,
            txid = committed.0
        );
        Ok(())
    }

    /// Follower: pull newly committed transactions from the journal tail.
    /// Returns the number of records applied.
    pub fn poll(&self) -> Result<usize> {
        let _guard = self.guard.read();
        if self.state() != MountState::ReadOnly {
            return Err(PbfsError::Invalid("poll on a non-follower mount".to_owned()));
        }
        let ir = &self.interrupt;
        let sb = read_superblock(ir, self.dev.as_ref())?;

        let mut store = self.store.write();
        if sb.chunk_count > store.chunk_count() {
            // growfs happened on the leader.
            store.extend_chunks(sb.chunk_count)?;
            *self.sb.lock() = sb;
        }

        if sb.checkpoint_txid > store.committed_txid().0 {
            // The leader checkpointed past us; incremental replay may have
            // been trimmed. Reload from the chunk headers.
            warn!(
                target: "pbfs::mount",
                event = "follower_reload",
                checkpoint = sb.checkpoint_txid,
                applied = store.committed_txid().0
            );
            let layout = ChunkLayout::new(sb.geometry)?;
            let mut fresh = MetaStore::new(sb.geometry, sb.chunk_count)?;
            load_chunks(ir, self.dev.as_ref(), &sb, &layout, &mut fresh)?;
            fresh.rebuild_indexes();
            *store = fresh;
        }

        let records = scan_records(
            ir,
            self.dev.as_ref(),
            self.journal_region,
            store.committed_txid(),
        )?;
        let applied = records.len();
        for record in records {
            store.apply_record(&record)?;
        }
        if applied > 0 {
            debug!(
                target: "pbfs::mount",
                event = "follower_poll",
                applied,
                committed = store.committed_txid().0
            );
        }
        Ok(applied)
    }

    /// RO → RW transition for the same host. Runs the fencing round and
    /// opens the journal cursor; connections observe a new mount epoch.
    pub fn remount_rw(&self, host_id: HostId, force_epoch: bool) -> Result<()> {
        let _guard = self.guard.write();
        if host_id != self.host_id {
            return Err(PbfsError::Invalid(format!(
                "remount host {} does not match mount host {}",
                host_id.0, self.host_id.0
            )));
        }
        if self.state() != MountState::ReadOnly {
            return Err(PbfsError::Invalid("remount requires a read-only mount".to_owned()));
        }

        let ir = &self.interrupt;
        let epoch = fence::acquire_leadership(
            ir,
            self.dev.as_ref(),
            self.fence_region,
            host_id,
            force_epoch,
            self.options.paxos_timeout,
        )?;

        let mut store = self.store.write();
        let (journal, records) = Journal::open(
            ir,
            self.dev.as_ref(),
            self.journal_region,
            store.committed_txid(),
        )?;
        for record in records {
            store.apply_record(&record)?;
        }
        drop(store);

        *self.journal.lock() = Some(journal);
        *self.epoch.lock() = epoch;
        *self.state.lock() = MountState::ReadWrite;
        self.mount_epoch.fetch_add(1, Ordering::AcqRel);
        info!(
            target: "pbfs::mount",
            event = "remounted_rw",
            pbd = %self.pbd,
            epoch = epoch.0
        );
        Ok(())
    }

    /// Whether this leader has been usurped by a remote force-umount. A
    /// deposed leader drops to read-only.
    pub fn verify_leadership(&self) -> Result<bool> {
        let epoch = self.require_leader()?;
        let still = fence::verify_leadership(
            &self.interrupt,
            self.dev.as_ref(),
            self.fence_region,
            self.host_id,
            epoch,
        )?;
        if !still {
            warn!(
                target: "pbfs::mount",
                event = "leadership_lost",
                pbd = %self.pbd,
                epoch = epoch.0
            );
            *self.journal.lock() = None;
            *self.state.lock() = MountState::ReadOnly;
        }
        Ok(still)
    }

    /// Extend the filesystem over capacity the device gained. Leader only;
    /// followers pick the new chunks up on their next poll.
    pub fn growfs(&self) -> Result<u32> {
        let _guard = self.guard.write();
        self.require_leader()?;
        let _prepare = HostLockFile::acquire(&self.options.run_dir, &self.pbd, HOSTID_RANGE_PREPARE)?;
        let capacity = self.dev.refresh_capacity()?;
        let sb = *self.sb.lock();
        let new_count = extend_chunks_on_disk(&self.interrupt, self.dev.as_ref(), sb, capacity)?;
        self.sb.lock().chunk_count = new_count;
        self.store.write().extend_chunks(new_count)?;
        Ok(new_count)
    }

    /// Unmount. `force` aborts in-flight operations at their next
    /// suspension point; a graceful leader unmount checkpoints first.
    pub fn umount(&self, force: bool) -> Result<()> {
        if force {
            self.interrupt.abort();
        }
        let _guard = self.guard.write();
        let was_leader = self.is_leader();
        *self.state.lock() = MountState::Umounting;

        if was_leader && !force {
            self.leader_checkpoint_for_umount()?;
        }
        *self.journal.lock() = None;
        *self.state.lock() = MountState::Init;
        self.mount_epoch.fetch_add(1, Ordering::AcqRel);
        *self.hostid_lock.lock() = None;
        info!(
            target: "pbfs::mount",
            event = "umounted",
            pbd = %self.pbd,
            forced = force
        );
        Ok(())
    }

    /// Checkpoint during umount. Runs on a fresh interrupt so a concurrent
    /// force-umount cannot cancel the final metadata write-back.
    fn leader_checkpoint_for_umount(&self) -> Result<()> {
        let ir = Interrupt::none();
        let store = self.store.write();
        let geo = store.geometry();
        let committed = store.committed_txid();
        for chunk in 0..store.chunk_count() {
            let buf = store.encode_chunk_meta(chunk)?;
            let off = self.layout.chunk_meta_off(self.chunk_start, geo, chunk);
            self.dev
                .pwrite(&ir, Some(&buf), ByteOffset(off), buf.len(), IoFlags::empty())?;
        }
        self.dev.flush(&ir)?;
        let mut sb = self.sb.lock();
        sb.checkpoint_txid = committed.0;
        let bytes = sb.serialize(geo.sector_size() as usize);
        self.dev
            .pwrite(&ir, Some(&bytes), ByteOffset::ZERO, bytes.len(), IoFlags::empty())?;
        self.dev.flush(&ir)
    }
}

fn load_chunks(
    ir: &Interrupt,
    dev: &dyn DevIo,
    sb: &Superblock,
    layout: &ChunkLayout,
    store: &mut MetaStore,
) -> Result<()> {
    let geo = sb.geometry;
    let meta_len = usize::try_from(layout.meta_blocks * u64::from(geo.block_size()))
        .map_err(|_| PbfsError::Invalid("chunk metadata exceeds usize".to_owned()))?;
    let mut buf = vec![0_u8; meta_len];
    for chunk in 0..sb.chunk_count {
        let off = layout.chunk_meta_off(ByteOffset(sb.chunk_start), geo, chunk);
        dev.pread(ir, &mut buf, ByteOffset(off), IoFlags::empty())?;
        store.decode_chunk_meta(chunk, &buf, off)?;
    }
    Ok(())
}
