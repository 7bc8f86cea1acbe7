#![forbid(unsafe_code)]
//! The replicated metadata journal.
//!
//! A circular redo log lives in a reserved extent of the PBD. The leader
//! appends one CRC-protected record per committed transaction; followers
//! (and the next mount) replay the committed prefix to rebuild the metadata
//! store. Records are 4 KiB-aligned; a torn record at the tail fails its
//! trailer CRC and truncates the replay there.
//!
//! The same crate carries the other half of the shared-disk coordination
//! story: hostid fencing (`fence`) and the host-local lock file
//! (`lockfile`).

pub mod fence;
pub mod lockfile;

use pbfs_dev::{DevIo, IoFlags};
use pbfs_error::{PbfsError, Result};
use pbfs_ondisk::MetaKind;
use pbfs_types::{
    read_le_u32, read_le_u64, BirthTime, ByteOffset, Epoch, HostId, Interrupt, TxId,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Journal records are padded to this alignment.
pub const RECORD_ALIGN: u64 = 4096;
pub const RECORD_MAGIC: u32 = 0x5042_4A4C; // "PBJL"

const HEADER_SIZE: usize = 28;
const ENTRY_FIXED: usize = 24;
const TRAILER_SIZE: usize = 4;

/// What a log entry does to its metadata slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryKind {
    Alloc,
    Free,
    Update,
}

impl LogEntryKind {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Alloc => 1,
            Self::Free => 2,
            Self::Update => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Alloc),
            2 => Ok(Self::Free),
            3 => Ok(Self::Update),
            other => Err(PbfsError::Format(format!("unknown log entry kind {other}"))),
        }
    }
}

/// One slot mutation inside a transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogEntryKind,
    pub meta_kind: MetaKind,
    pub slot: u32,
    pub birth_time: BirthTime,
    /// Serialized record bytes; empty for `Free`.
    pub payload: Vec<u8>,
}

impl LogEntry {
    fn encoded_len(&self) -> usize {
        ENTRY_FIXED + self.payload.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.push(self.kind.as_u8());
        buf.push(self.meta_kind.as_u8());
        buf.extend_from_slice(&0_u16.to_le_bytes());
        buf.extend_from_slice(&self.slot.to_le_bytes());
        buf.extend_from_slice(&self.birth_time.0.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32c::crc32c(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
    }

    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let fixed = pbfs_types::ensure_slice(buf, offset, ENTRY_FIXED - 4)?;
        let kind = LogEntryKind::from_u8(fixed[0])?;
        let meta_kind = MetaKind::from_u8(fixed[1])?;
        let slot = read_le_u32(buf, offset + 4)?;
        let birth_time = BirthTime(read_le_u64(buf, offset + 8)?);
        let len = read_le_u32(buf, offset + 16)? as usize;
        let payload = pbfs_types::ensure_slice(buf, offset + 20, len)?.to_vec();
        let body_end = offset + 20 + len;
        let stored_crc = read_le_u32(buf, body_end)?;
        let computed = crc32c::crc32c(&buf[offset..body_end]);
        if computed != stored_crc {
            return Err(PbfsError::Format("log entry crc mismatch".to_owned()));
        }
        Ok((
            Self {
                kind,
                meta_kind,
                slot,
                birth_time,
                payload,
            },
            body_end + 4,
        ))
    }
}

/// One committed transaction: a txid-stamped batch of slot mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub txid: TxId,
    pub host_id: HostId,
    pub epoch: Epoch,
    pub entries: Vec<LogEntry>,
}

impl TxRecord {
    /// Serialized length including 4 KiB padding.
    #[must_use]
    pub fn padded_len(&self) -> u64 {
        let raw = HEADER_SIZE
            + self
                .entries
                .iter()
                .map(LogEntry::encoded_len)
                .sum::<usize>()
            + TRAILER_SIZE;
        (raw as u64).div_ceil(RECORD_ALIGN) * RECORD_ALIGN
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.padded_len() as usize);
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&0_u32.to_le_bytes()); // crc_header, patched below
        buf.extend_from_slice(&self.txid.0.to_le_bytes());
        buf.extend_from_slice(&self.host_id.0.to_le_bytes());
        buf.extend_from_slice(&self.epoch.0.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        let mut header = buf.clone();
        header[4..8].fill(0);
        let crc_header = crc32c::crc32c(&header);
        buf[4..8].copy_from_slice(&crc_header.to_le_bytes());

        for entry in &self.entries {
            entry.encode_into(&mut buf);
        }

        let trailer = crc32c::crc32c(&buf);
        buf.extend_from_slice(&trailer.to_le_bytes());
        buf.resize(self.padded_len() as usize, 0);
        buf
    }

    /// Decode one record starting at `buf[0]`. Returns the record and its
    /// padded length. Any CRC or framing failure is reported as `Format`,
    /// which scanners treat as "no record here".
    pub fn deserialize(buf: &[u8]) -> Result<(Self, u64)> {
        let magic = read_le_u32(buf, 0)?;
        if magic != RECORD_MAGIC {
            return Err(PbfsError::Format("journal record magic mismatch".to_owned()));
        }
        let stored_header_crc = read_le_u32(buf, 4)?;
        let mut header = pbfs_types::ensure_slice(buf, 0, HEADER_SIZE)?.to_vec();
        header[4..8].fill(0);
        if crc32c::crc32c(&header) != stored_header_crc {
            return Err(PbfsError::Format("journal header crc mismatch".to_owned()));
        }
        let txid = TxId(read_le_u64(buf, 8)?);
        let host_id = HostId(read_le_u32(buf, 16)?);
        let epoch = Epoch(read_le_u32(buf, 20)?);
        let n_entries = read_le_u32(buf, 24)? as usize;

        let mut entries = Vec::with_capacity(n_entries);
        let mut offset = HEADER_SIZE;
        for _ in 0..n_entries {
            let (entry, next) = LogEntry::decode(buf, offset)?;
            entries.push(entry);
            offset = next;
        }

        let stored_trailer = read_le_u32(buf, offset)?;
        if crc32c::crc32c(&buf[..offset]) != stored_trailer {
            return Err(PbfsError::Format("journal trailer crc mismatch".to_owned()));
        }

        let record = Self {
            txid,
            host_id,
            epoch,
            entries,
        };
        let padded = record.padded_len();
        Ok((record, padded))
    }
}

/// Journal extent in device byte coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRegion {
    pub off: u64,
    pub len: u64,
}

impl JournalRegion {
    #[must_use]
    pub fn from_superblock(sb: &pbfs_ondisk::Superblock) -> Self {
        Self {
            off: sb.journal_off,
            len: sb.journal_len,
        }
    }
}

/// Scan the whole region and return every record with `txid > after`,
/// in txid order, truncated at the first gap in the txid sequence.
///
/// The scan walks 4 KiB boundaries; a valid record advances the cursor by
/// its padded length, anything else (zeroes, torn writes, stale garbage)
/// advances one alignment step. Because txids are monotonic and records are
/// only overwritten after a checkpoint advances `after`, collecting by txid
/// and cutting at the first gap yields exactly the committed prefix.
pub fn scan_records(
    ir: &Interrupt,
    dev: &dyn DevIo,
    region: JournalRegion,
    after: TxId,
) -> Result<Vec<TxRecord>> {
    ir.checkpoint().map_err(PbfsError::from)?;
    let len = usize::try_from(region.len)
        .map_err(|_| PbfsError::Invalid("journal region exceeds usize".to_owned()))?;
    let mut raw = vec![0_u8; len];
    dev.pread(ir, &mut raw, ByteOffset(region.off), IoFlags::empty())?;

    let mut found: BTreeMap<u64, (TxRecord, u64)> = BTreeMap::new();
    let mut cursor = 0_u64;
    while cursor + RECORD_ALIGN <= region.len {
        ir.checkpoint().map_err(PbfsError::from)?;
        let at = cursor as usize;
        match TxRecord::deserialize(&raw[at..]) {
            Ok((record, padded)) => {
                let txid = record.txid.0;
                if record.txid > after {
                    found.insert(txid, (record, cursor + padded));
                }
                cursor += padded;
            }
            Err(_) => {
                cursor += RECORD_ALIGN;
            }
        }
    }

    // Keep the contiguous run starting right after `after`.
    let mut records = Vec::new();
    let mut expected = after.0 + 1;
    for (txid, (record, _)) in found {
        if txid != expected {
            if records.is_empty() {
                debug!(
                    target: "pbfs::journal",
                    event = "replay_gap",
                    expected,
                    found = txid
                );
            } else {
                warn!(
                    target: "pbfs::journal",
                    event = "replay_truncated",
                    expected,
                    found = txid
                );
            }
            break;
        }
        records.push(record);
        expected += 1;
    }
    Ok(records)
}

/// Leader-side journal cursor.
///
/// Owns the append tail and the used-bytes accounting that prevents the
/// circular log from overwriting records the last checkpoint has not yet
/// covered.
#[derive(Debug)]
pub struct Journal {
    region: JournalRegion,
    /// Region-relative offset of the next append.
    tail: u64,
    /// Bytes appended since the last checkpoint.
    used: u64,
    next_txid: TxId,
    /// Read back and verify the first record appended after mount.
    verify_next: bool,
}

impl Journal {
    /// Open the journal for appending. Scans for records above
    /// `checkpoint_txid`, positions the tail after the newest one, and
    /// returns the records so the caller can replay them.
    pub fn open(
        ir: &Interrupt,
        dev: &dyn DevIo,
        region: JournalRegion,
        checkpoint_txid: TxId,
    ) -> Result<(Self, Vec<TxRecord>)> {
        let records = scan_records(ir, dev, region, checkpoint_txid)?;
        let mut tail = 0_u64;
        let mut used = 0_u64;
        let mut next_txid = TxId(checkpoint_txid.0 + 1);
        if let Some(last) = records.last() {
            next_txid = TxId(last.txid.0 + 1);
            // Recompute the tail by walking the records' padded lengths from
            // wherever the oldest record sits; simplest is a fresh scan of
            // offsets, but the byte count is what wrap protection needs.
            used = records.iter().map(TxRecord::padded_len).sum();
            tail = Self::locate_tail(ir, dev, region, last.txid)?;
        }
        info!(
            target: "pbfs::journal",
            event = "journal_open",
            records = records.len(),
            next_txid = next_txid.0,
            tail
        );
        Ok((
            Self {
                region,
                tail,
                used,
                next_txid,
                verify_next: true,
            },
            records,
        ))
    }

    /// Find the region-relative offset just past the record with `txid`.
    fn locate_tail(
        ir: &Interrupt,
        dev: &dyn DevIo,
        region: JournalRegion,
        txid: TxId,
    ) -> Result<u64> {
        let len = usize::try_from(region.len)
            .map_err(|_| PbfsError::Invalid("journal region exceeds usize".to_owned()))?;
        let mut raw = vec![0_u8; len];
        dev.pread(ir, &mut raw, ByteOffset(region.off), IoFlags::empty())?;
        let mut cursor = 0_u64;
        while cursor + RECORD_ALIGN <= region.len {
            let at = cursor as usize;
            match TxRecord::deserialize(&raw[at..]) {
                Ok((record, padded)) => {
                    if record.txid == txid {
                        return Ok((cursor + padded) % region.len);
                    }
                    cursor += padded;
                }
                Err(_) => cursor += RECORD_ALIGN,
            }
        }
        Ok(0)
    }

    #[must_use]
    pub fn next_txid(&self) -> TxId {
        self.next_txid
    }

    /// Fraction of the region consumed since the last checkpoint.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.region.len == 0 {
            return 1.0;
        }
        self.used as f64 / self.region.len as f64
    }

    /// All record bytes since the last checkpoint are disposable again.
    pub fn note_checkpoint(&mut self) {
        self.used = 0;
    }

    /// Append a record built from `entries`, assigning the next txid.
    /// The record is flushed to stable storage before this returns.
    pub fn append(
        &mut self,
        ir: &Interrupt,
        dev: &dyn DevIo,
        host_id: HostId,
        epoch: Epoch,
        entries: Vec<LogEntry>,
    ) -> Result<TxRecord> {
        ir.checkpoint().map_err(PbfsError::from)?;
        let record = TxRecord {
            txid: self.next_txid,
            host_id,
            epoch,
            entries,
        };
        let bytes = record.serialize();
        let padded = bytes.len() as u64;
        if padded > self.region.len {
            return Err(PbfsError::NoSpace);
        }
        // Bytes the circle would consume: the record plus any skipped gap at
        // the region end if the record has to wrap. Overwriting
        // un-checkpointed records would break replay.
        let mut tail = self.tail;
        let mut skip = 0_u64;
        if tail + padded > self.region.len {
            skip = self.region.len - tail;
            tail = 0;
        }
        if self.used + skip + padded > self.region.len {
            return Err(PbfsError::NoSpace);
        }
        let offset = ByteOffset(self.region.off + tail);
        dev.pwrite(ir, Some(&bytes), offset, bytes.len(), IoFlags::empty())?;
        dev.flush(ir)?;

        if self.verify_next {
            self.verify_next = false;
            let mut back = vec![0_u8; bytes.len()];
            dev.pread(ir, &mut back, offset, IoFlags::empty())?;
            let (verified, _) = TxRecord::deserialize(&back).map_err(|_| PbfsError::Corruption {
                offset: offset.0,
                detail: "journal read-back verification failed".to_owned(),
            })?;
            if verified.txid != record.txid {
                return Err(PbfsError::Corruption {
                    offset: offset.0,
                    detail: "journal read-back returned a different record".to_owned(),
                });
            }
        }

        debug!(
            target: "pbfs::journal",
            event = "append",
            txid = record.txid.0,
            entries = record.entries.len(),
            tail,
            padded
        );
        self.tail = (tail + padded) % self.region.len;
        self.used += skip + padded;
        self.next_txid = TxId(record.txid.0 + 1);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_dev::RamDevice;
    use pbfs_ondisk::MetaKind;

    fn region() -> JournalRegion {
        JournalRegion {
            off: 4096,
            len: 64 * 1024,
        }
    }

    fn dev() -> RamDevice {
        RamDevice::new(128 * 1024, 512)
    }

    fn entry(slot: u32, birth: u64) -> LogEntry {
        LogEntry {
            kind: LogEntryKind::Alloc,
            meta_kind: MetaKind::Inode,
            slot,
            birth_time: BirthTime(birth),
            payload: vec![slot as u8; 80],
        }
    }

    #[test]
    fn record_codec_round_trip() {
        let record = TxRecord {
            txid: TxId(7),
            host_id: HostId(1),
            epoch: Epoch(3),
            entries: vec![
                entry(0, 1),
                LogEntry {
                    kind: LogEntryKind::Free,
                    meta_kind: MetaKind::DirEntry,
                    slot: 9,
                    birth_time: BirthTime(5),
                    payload: Vec::new(),
                },
            ],
        };
        let bytes = record.serialize();
        assert_eq!(bytes.len() as u64 % RECORD_ALIGN, 0);
        let (back, padded) = TxRecord::deserialize(&bytes).expect("deserialize");
        assert_eq!(back, record);
        assert_eq!(padded, bytes.len() as u64);
    }

    #[test]
    fn record_codec_rejects_corruption() {
        let record = TxRecord {
            txid: TxId(1),
            host_id: HostId(0),
            epoch: Epoch(1),
            entries: vec![entry(3, 2)],
        };
        let mut bytes = record.serialize();
        // Flip a payload byte: entry CRC must catch it.
        bytes[HEADER_SIZE + 30] ^= 0x80;
        assert!(TxRecord::deserialize(&bytes).is_err());

        // Header corruption.
        let mut bytes = record.serialize();
        bytes[8] ^= 1;
        assert!(TxRecord::deserialize(&bytes).is_err());
    }

    #[test]
    fn append_then_scan_replays_in_order() {
        let dev = dev();
        let ir = Interrupt::none();
        let (mut journal, replay) = Journal::open(&ir, &dev, region(), TxId(0)).expect("open");
        assert!(replay.is_empty());
        assert_eq!(journal.next_txid(), TxId(1));

        for i in 0..5_u32 {
            journal
                .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(i, u64::from(i))])
                .expect("append");
        }

        let records = scan_records(&ir, &dev, region(), TxId(0)).expect("scan");
        assert_eq!(records.len(), 5);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.txid, TxId(i as u64 + 1));
        }

        // A later checkpoint hides the prefix.
        let records = scan_records(&ir, &dev, region(), TxId(3)).expect("scan");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].txid, TxId(4));
    }

    #[test]
    fn reopen_resumes_txid_sequence() {
        let dev = dev();
        let ir = Interrupt::none();
        let (mut journal, _) = Journal::open(&ir, &dev, region(), TxId(0)).expect("open");
        journal
            .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(1, 1)])
            .expect("append");
        journal
            .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(2, 2)])
            .expect("append");

        let (journal2, replay) = Journal::open(&ir, &dev, region(), TxId(0)).expect("reopen");
        assert_eq!(replay.len(), 2);
        assert_eq!(journal2.next_txid(), TxId(3));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dev = dev();
        let ir = Interrupt::none();
        let (mut journal, _) = Journal::open(&ir, &dev, region(), TxId(0)).expect("open");
        for i in 0..3_u32 {
            journal
                .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(i, u64::from(i))])
                .expect("append");
        }

        // Tear the third record: overwrite part of its payload.
        let reg = region();
        let torn_off = reg.off + 2 * RECORD_ALIGN + 40;
        dev.pwrite(
            &ir,
            Some(&[0xFF_u8; 512]),
            ByteOffset(pbfs_types::align_down(torn_off, 512).unwrap()),
            512,
            IoFlags::empty(),
        )
        .expect("tear");

        let records = scan_records(&ir, &dev, reg, TxId(0)).expect("scan");
        assert_eq!(records.len(), 2);
        assert_eq!(records.last().expect("record").txid, TxId(2));
    }

    #[test]
    fn replay_is_idempotent_over_scan() {
        let dev = dev();
        let ir = Interrupt::none();
        let (mut journal, _) = Journal::open(&ir, &dev, region(), TxId(0)).expect("open");
        for i in 0..4_u32 {
            journal
                .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(i, u64::from(i))])
                .expect("append");
        }
        let first = scan_records(&ir, &dev, region(), TxId(0)).expect("scan");
        let second = scan_records(&ir, &dev, region(), TxId(0)).expect("scan");
        assert_eq!(first, second);
    }

    #[test]
    fn wrap_protection_returns_nospace() {
        let small = JournalRegion {
            off: 4096,
            len: 4 * RECORD_ALIGN,
        };
        let dev = dev();
        let ir = Interrupt::none();
        let (mut journal, _) = Journal::open(&ir, &dev, small, TxId(0)).expect("open");
        for i in 0..4_u32 {
            journal
                .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(i, u64::from(i))])
                .expect("append");
        }
        assert!((journal.utilization() - 1.0).abs() < f64::EPSILON);
        assert!(matches!(
            journal.append(&ir, &dev, HostId(1), Epoch(1), vec![entry(9, 9)]),
            Err(PbfsError::NoSpace)
        ));

        // After a checkpoint the region is reusable and appends wrap.
        journal.note_checkpoint();
        journal
            .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(10, 10)])
            .expect("append after checkpoint");
    }

    #[test]
    fn scan_stops_at_txid_gap() {
        let reg = region();
        let dev = dev();
        let ir = Interrupt::none();
        // Hand-place txid 1 and txid 3 with a hole where txid 2 would be.
        let r1 = TxRecord {
            txid: TxId(1),
            host_id: HostId(1),
            epoch: Epoch(1),
            entries: vec![entry(0, 1)],
        };
        let r3 = TxRecord {
            txid: TxId(3),
            host_id: HostId(1),
            epoch: Epoch(1),
            entries: vec![entry(1, 2)],
        };
        let b1 = r1.serialize();
        let b3 = r3.serialize();
        dev.pwrite(&ir, Some(&b1), ByteOffset(reg.off), b1.len(), IoFlags::empty())
            .expect("write r1");
        dev.pwrite(
            &ir,
            Some(&b3),
            ByteOffset(reg.off + b1.len() as u64),
            b3.len(),
            IoFlags::empty(),
        )
        .expect("write r3");

        let records = scan_records(&ir, &dev, reg, TxId(0)).expect("scan");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid, TxId(1));
    }
}
