//! Journal + fencing recovery over a real file-backed device.
//!
//! Scenarios:
//! 1. Records appended by one journal cursor are replayed by a fresh open
//!    on the same file, in txid order.
//! 2. A leadership round on the same backing file fences a second host.
//! 3. A torn trailing record truncates replay without hiding the committed
//!    prefix.

use pbfs_dev::{DevIo, FileDevice, IoFlags};
use pbfs_error::PbfsError;
use pbfs_journal::fence::{acquire_leadership, observe_leader, FenceRegion};
use pbfs_journal::{scan_records, Journal, JournalRegion, LogEntry, LogEntryKind};
use pbfs_ondisk::MetaKind;
use pbfs_types::{BirthTime, ByteOffset, Epoch, HostId, Interrupt, TxId};
use std::time::Duration;

const DEVICE_LEN: u64 = 1024 * 1024;

fn file_device() -> (tempfile::NamedTempFile, FileDevice) {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    file.as_file().set_len(DEVICE_LEN).expect("set_len");
    let dev = FileDevice::open(file.path(), 512).expect("open device");
    (file, dev)
}

fn journal_region() -> JournalRegion {
    JournalRegion {
        off: 64 * 1024,
        len: 256 * 1024,
    }
}

fn entry(slot: u32) -> LogEntry {
    LogEntry {
        kind: LogEntryKind::Alloc,
        meta_kind: MetaKind::Inode,
        slot,
        birth_time: BirthTime(u64::from(slot) + 1),
        payload: vec![slot as u8; 80],
    }
}

#[test]
fn reopen_replays_committed_records() {
    let (_file, dev) = file_device();
    let ir = Interrupt::none();
    let region = journal_region();

    {
        let (mut journal, replayed) = Journal::open(&ir, &dev, region, TxId(0)).expect("open");
        assert!(replayed.is_empty());
        for slot in 0..8_u32 {
            journal
                .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(slot)])
                .expect("append");
        }
    }

    // A second process (fresh cursor over the same file) sees all eight in
    // order and resumes the txid sequence.
    let (journal, replayed) = Journal::open(&ir, &dev, region, TxId(0)).expect("reopen");
    assert_eq!(replayed.len(), 8);
    for (idx, record) in replayed.iter().enumerate() {
        assert_eq!(record.txid, TxId(idx as u64 + 1));
        assert_eq!(record.entries.len(), 1);
    }
    assert_eq!(journal.next_txid(), TxId(9));
}

#[test]
fn second_host_is_fenced_on_shared_file() {
    let (_file, dev) = file_device();
    let ir = Interrupt::none();
    let region = FenceRegion {
        off: 512,
        sector_size: 512,
    };

    let epoch = acquire_leadership(&ir, &dev, region, HostId(1), false, Duration::from_secs(5))
        .expect("host 1 leads");
    assert_eq!(epoch, Epoch(1));

    let err = acquire_leadership(&ir, &dev, region, HostId(3), false, Duration::from_secs(5))
        .expect_err("host 3 fenced");
    assert!(matches!(err, PbfsError::Fenced(_)));

    let leader = observe_leader(&ir, &dev, region).expect("observe").expect("slot");
    assert_eq!(leader.host_id, HostId(1));
    assert_eq!(leader.epoch, epoch);
}

#[test]
fn torn_tail_preserves_committed_prefix() {
    let (_file, dev) = file_device();
    let ir = Interrupt::none();
    let region = journal_region();

    let (mut journal, _) = Journal::open(&ir, &dev, region, TxId(0)).expect("open");
    let mut offsets = Vec::new();
    for slot in 0..4_u32 {
        let record = journal
            .append(&ir, &dev, HostId(1), Epoch(1), vec![entry(slot)])
            .expect("append");
        offsets.push(record.padded_len());
    }

    // Simulate a torn write of the last record: clobber its first sector.
    let last_start = region.off + offsets[..3].iter().sum::<u64>();
    dev.pwrite(
        &ir,
        Some(&[0xA5_u8; 512]),
        ByteOffset(last_start),
        512,
        IoFlags::empty(),
    )
    .expect("tear");
    dev.flush(&ir).expect("flush");

    let records = scan_records(&ir, &dev, region, TxId(0)).expect("scan");
    assert_eq!(records.len(), 3);
    assert_eq!(records.last().expect("record").txid, TxId(3));
}
