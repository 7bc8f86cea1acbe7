//! Single-writer metadata transactions.
//!
//! A `Tx` stages slot mutations against the in-memory store while holding
//! the meta write lock, recording an undo entry per step. Commit serializes
//! the staged entries into one journal record and flushes it; if the append
//! fails, or the Tx is abandoned, the undo log rolls the store back in
//! reverse insertion order, leaving no trace on disk or in memory.

use crate::MetaStore;
use pbfs_dev::DevIo;
use pbfs_error::{PbfsError, Result};
use pbfs_journal::{Journal, LogEntry, LogEntryKind};
use pbfs_ondisk::{MetaKind, MetaRecord};
use pbfs_types::{BirthTime, Epoch, HostId, Interrupt, Oid, TxId};
use tracing::{debug, trace};

enum UndoOp {
    /// Reverse an alloc: clear the slot again.
    Unalloc { kind: MetaKind, oid: Oid },
    /// Reverse an update or free: reinstall the prior record.
    Restore { record: MetaRecord },
}

/// One staged metadata transaction. At most one exists per mount at any
/// time; the caller enforces that by staging under the meta write lock.
#[derive(Default)]
pub struct Tx {
    entries: Vec<LogEntry>,
    undo: Vec<UndoOp>,
}

impl Tx {
    #[must_use]
    pub fn begin() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot_of(oid: Oid) -> Result<u32> {
        u32::try_from(oid.0).map_err(|_| PbfsError::Invalid("oid exceeds journal slot width".to_owned()))
    }

    /// Reserve the lowest free slot of `kind`, stamp a fresh birth time, and
    /// install the record produced by `build`.
    pub fn alloc_with(
        &mut self,
        store: &mut MetaStore,
        kind: MetaKind,
        build: impl FnOnce(Oid, BirthTime) -> MetaRecord,
    ) -> Result<Oid> {
        let oid = store.find_free(kind)?;
        let birth = store.next_birth();
        let record = build(oid, birth);
        debug_assert_eq!(record.kind(), kind);
        debug_assert_eq!(record.oid(), oid);
        debug_assert_eq!(record.birth_time(), birth);

        self.entries.push(LogEntry {
            kind: LogEntryKind::Alloc,
            meta_kind: kind,
            slot: Self::slot_of(oid)?,
            birth_time: birth,
            payload: record.serialize(),
        });
        store.install(record);
        self.undo.push(UndoOp::Unalloc { kind, oid });
        trace!(target: "pbfs::tx", event = "stage_alloc", kind = ?kind, oid = oid.0);
        Ok(oid)
    }

    /// Replace an existing record. The birth time is preserved: updating a
    /// record does not invalidate outstanding references to it.
    pub fn update(&mut self, store: &mut MetaStore, record: MetaRecord) -> Result<()> {
        let kind = record.kind();
        let oid = record.oid();
        let old = store.get(kind, oid)?.clone();
        if old.birth_time() != record.birth_time() {
            return Err(PbfsError::Again);
        }

        self.entries.push(LogEntry {
            kind: LogEntryKind::Update,
            meta_kind: kind,
            slot: Self::slot_of(oid)?,
            birth_time: record.birth_time(),
            payload: record.serialize(),
        });
        store.install(record);
        self.undo.push(UndoOp::Restore { record: old });
        trace!(target: "pbfs::tx", event = "stage_update", kind = ?kind, oid = oid.0);
        Ok(())
    }

    /// Free a slot, conditional on the caller's generation stamp; a
    /// mismatch means the reference is stale and the Tx fails with `Again`.
    pub fn free(
        &mut self,
        store: &mut MetaStore,
        kind: MetaKind,
        oid: Oid,
        expected: BirthTime,
    ) -> Result<()> {
        let old = store.get(kind, oid)?.clone();
        if old.birth_time() != expected {
            return Err(PbfsError::Again);
        }

        self.entries.push(LogEntry {
            kind: LogEntryKind::Free,
            meta_kind: kind,
            slot: Self::slot_of(oid)?,
            birth_time: expected,
            payload: Vec::new(),
        });
        store.remove(kind, oid);
        self.undo.push(UndoOp::Restore { record: old });
        trace!(target: "pbfs::tx", event = "stage_free", kind = ?kind, oid = oid.0);
        Ok(())
    }

    /// Commit: append one record to the journal (flushed before return) and
    /// mark the store's committed txid. A journal failure rolls the staged
    /// changes back and surfaces the error.
    pub fn commit(
        self,
        ir: &Interrupt,
        dev: &dyn DevIo,
        journal: &mut Journal,
        store: &mut MetaStore,
        host: HostId,
        epoch: Epoch,
    ) -> Result<TxId> {
        if self.entries.is_empty() {
            return Ok(store.committed_txid());
        }
        let n_entries = self.entries.len();
        match journal.append(ir, dev, host, epoch, self.entries) {
            Ok(record) => {
                store.set_committed(record.txid);
                debug!(
                    target: "pbfs::tx",
                    event = "commit",
                    txid = record.txid.0,
                    entries = n_entries
                );
                debug_assert!(store.verify_invariants().is_ok());
                Ok(record.txid)
            }
            Err(err) => {
                rollback(self.undo, store);
                Err(err)
            }
        }
    }

    /// Abandon the Tx, rolling back in-memory changes in reverse insertion
    /// order.
    pub fn abort(self, store: &mut MetaStore) {
        let n = self.undo.len();
        rollback(self.undo, store);
        debug!(target: "pbfs::tx", event = "abort", undone = n);
    }
}

fn rollback(undo: Vec<UndoOp>, store: &mut MetaStore) {
    for op in undo.into_iter().rev() {
        match op {
            UndoOp::Unalloc { kind, oid } => store.remove(kind, oid),
            UndoOp::Restore { record } => store.install(record),
        }
    }
}
