#![forbid(unsafe_code)]
//! Device I/O layer.
//!
//! Provides the [`DevIo`] trait: sector-aligned pread/pwrite with optional
//! deferred completion (`NOWAIT`), device-side zero-fill (`ZERO`), flush, and
//! a capability query. Implementations: [`FileDevice`] over a regular file
//! or raw block device node, and [`RamDevice`] for tests.

use parking_lot::Mutex;
use pbfs_error::{PbfsError, Result};
use pbfs_types::{ByteOffset, Interrupt};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[inline]
fn checkpoint(ir: &Interrupt) -> Result<()> {
    ir.checkpoint().map_err(PbfsError::from)
}

// ── I/O flags ───────────────────────────────────────────────────────────────

/// Per-call I/O flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFlags(u32);

impl IoFlags {
    /// Submit without waiting; completion status is collected by `wait_io`.
    pub const NOWAIT: Self = Self(1);
    /// The caller's buffer is DMA-registered; no bounce copy needed.
    pub const DMABUF: Self = Self(1 << 1);
    /// Device-side zero-fill; no data buffer is supplied.
    pub const ZERO: Self = Self(1 << 2);

    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What a device can do beyond plain aligned I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevCapabilities {
    /// Smallest I/O alignment unit in bytes.
    pub sector_size: u32,
    /// Whether `pwrite(None, .., ZERO)` is supported device-side.
    pub zero_write: bool,
}

/// Aggregate I/O counters for one device.
#[derive(Debug, Default)]
pub struct DevStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub flushes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl DevStats {
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.flushes.load(Ordering::Relaxed),
        )
    }
}

// ── DevIo trait ─────────────────────────────────────────────────────────────

/// Sector-aligned device I/O.
///
/// `offset` and length must be multiples of `capabilities().sector_size`;
/// misaligned calls fail with `Invalid`. Within one device, submissions
/// complete in order unless `NOWAIT` is set, in which case the caller must
/// `wait_io` before interpreting any of them.
pub trait DevIo: Send + Sync {
    /// Total device length in bytes.
    fn capacity_bytes(&self) -> u64;

    fn capabilities(&self) -> DevCapabilities;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn pread(&self, ir: &Interrupt, buf: &mut [u8], offset: ByteOffset, flags: IoFlags)
        -> Result<()>;

    /// Write `len` bytes at `offset`. `buf` is `None` only with `ZERO`,
    /// in which case the device writes zeros without a user buffer.
    fn pwrite(
        &self,
        ir: &Interrupt,
        buf: Option<&[u8]>,
        offset: ByteOffset,
        len: usize,
        flags: IoFlags,
    ) -> Result<()>;

    /// Flush the device write cache.
    fn flush(&self, ir: &Interrupt) -> Result<()>;

    /// Collect completions of earlier `NOWAIT` submissions. Returns the
    /// first deferred error, if any.
    fn wait_io(&self, ir: &Interrupt) -> Result<()>;

    /// Re-query the device size (growfs). Returns the fresh capacity.
    fn refresh_capacity(&self) -> Result<u64> {
        Ok(self.capacity_bytes())
    }
}

fn check_aligned(offset: ByteOffset, len: usize, sector: u32) -> Result<()> {
    let sector = u64::from(sector);
    if !offset.is_aligned(sector) || (len as u64) & (sector - 1) != 0 {
        return Err(PbfsError::Invalid(format!(
            "unaligned device I/O: offset={} len={len} sector={sector}",
            offset.0
        )));
    }
    Ok(())
}

fn check_bounds(offset: ByteOffset, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| PbfsError::Invalid("I/O range overflows u64".to_owned()))?;
    if end.0 > capacity {
        return Err(PbfsError::Invalid(format!(
            "I/O out of bounds: offset={} len={len} capacity={capacity}",
            offset.0
        )));
    }
    Ok(())
}

// ── Aligned bounce buffer ───────────────────────────────────────────────────

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Remains fully safe by keeping the original backing allocation and
/// exposing an aligned subslice.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        let alignment = if alignment <= 1 {
            1
        } else {
            alignment.next_power_of_two()
        };
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let storage = vec![0_u8; size + alignment - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Device over a regular file or block device node, using `pread`/`pwrite`
/// style positioned I/O (`std::os::unix::fs::FileExt`, no shared seek
/// position). `NOWAIT` submissions execute eagerly; their errors are parked
/// until `wait_io`, matching the unordered-completion contract.
#[derive(Debug)]
pub struct FileDevice {
    file: Arc<File>,
    len: AtomicU64,
    sector_size: u32,
    writable: bool,
    stats: DevStats,
    deferred: Mutex<Vec<PbfsError>>,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>, sector_size: u32) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(
            target: "pbfs::dev",
            event = "device_open",
            path = %path.as_ref().display(),
            len,
            writable
        );
        Ok(Self {
            file: Arc::new(file),
            len: AtomicU64::new(len),
            sector_size,
            writable,
            stats: DevStats::default(),
            deferred: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn stats(&self) -> &DevStats {
        &self.stats
    }

    fn write_zeros(&self, offset: ByteOffset, len: usize) -> Result<()> {
        // One fragment-sized zero page, reused across the span.
        let page = vec![0_u8; (self.sector_size as usize * 8).min(len.max(1))];
        let mut off = offset.0;
        let mut left = len;
        while left > 0 {
            let step = left.min(page.len());
            self.file.write_all_at(&page[..step], off)?;
            off += step as u64;
            left -= step;
        }
        Ok(())
    }

    fn park_or_return(&self, err: PbfsError, flags: IoFlags) -> Result<()> {
        if flags.contains(IoFlags::NOWAIT) {
            self.deferred.lock().push(err);
            return Ok(());
        }
        Err(err)
    }
}

impl DevIo for FileDevice {
    fn capacity_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn refresh_capacity(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        self.len.store(len, Ordering::Release);
        Ok(len)
    }

    fn capabilities(&self) -> DevCapabilities {
        DevCapabilities {
            sector_size: self.sector_size,
            zero_write: true,
        }
    }

    fn pread(
        &self,
        ir: &Interrupt,
        buf: &mut [u8],
        offset: ByteOffset,
        flags: IoFlags,
    ) -> Result<()> {
        checkpoint(ir)?;
        check_aligned(offset, buf.len(), self.sector_size)?;
        check_bounds(offset, buf.len(), self.capacity_bytes())?;
        trace!(
            target: "pbfs::dev",
            event = "pread",
            offset = offset.0,
            len = buf.len()
        );
        match self.file.read_exact_at(buf, offset.0) {
            Ok(()) => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => self.park_or_return(PbfsError::Io(err), flags),
        }
    }

    fn pwrite(
        &self,
        ir: &Interrupt,
        buf: Option<&[u8]>,
        offset: ByteOffset,
        len: usize,
        flags: IoFlags,
    ) -> Result<()> {
        checkpoint(ir)?;
        if !self.writable {
            return Err(PbfsError::ReadOnly);
        }
        check_aligned(offset, len, self.sector_size)?;
        check_bounds(offset, len, self.capacity_bytes())?;
        trace!(
            target: "pbfs::dev",
            event = "pwrite",
            offset = offset.0,
            len,
            zero = flags.contains(IoFlags::ZERO)
        );
        let outcome = match buf {
            Some(data) => {
                if data.len() != len {
                    return Err(PbfsError::Invalid(format!(
                        "pwrite buffer length {} does not match len {len}",
                        data.len()
                    )));
                }
                self.file.write_all_at(data, offset.0)
            }
            None => {
                if !flags.contains(IoFlags::ZERO) {
                    return Err(PbfsError::Invalid(
                        "pwrite without a buffer requires the ZERO flag".to_owned(),
                    ));
                }
                self.write_zeros(offset, len).map_err(|err| match err {
                    PbfsError::Io(io) => io,
                    other => std::io::Error::other(other.to_string()),
                })
            }
        };
        match outcome {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(len as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => self.park_or_return(PbfsError::Io(err), flags),
        }
    }

    fn flush(&self, ir: &Interrupt) -> Result<()> {
        checkpoint(ir)?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.file.sync_data()?;
        Ok(())
    }

    fn wait_io(&self, ir: &Interrupt) -> Result<()> {
        checkpoint(ir)?;
        let mut parked = self.deferred.lock();
        if parked.is_empty() {
            return Ok(());
        }
        let first = parked.remove(0);
        parked.clear();
        Err(first)
    }
}

// ── In-memory device (tests) ────────────────────────────────────────────────

/// RAM-backed device used by unit and integration tests. Supports fault
/// injection: after `fail_writes_after(n)`, the n-th subsequent write (and
/// every write after it) fails with `EIO`-style errors.
#[derive(Debug)]
pub struct RamDevice {
    bytes: Mutex<Vec<u8>>,
    sector_size: u32,
    deferred: Mutex<Vec<PbfsError>>,
    writes_left: AtomicU64,
}

impl RamDevice {
    #[must_use]
    pub fn new(len: usize, sector_size: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            sector_size,
            deferred: Mutex::new(Vec::new()),
            writes_left: AtomicU64::new(u64::MAX),
        }
    }

    /// Allow `n` more successful writes, then fail the rest.
    pub fn fail_writes_after(&self, n: u64) {
        self.writes_left.store(n, Ordering::SeqCst);
    }

    /// Raw snapshot of the device contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn take_write_budget(&self) -> bool {
        loop {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return false;
            }
            if left == u64::MAX {
                return true;
            }
            if self
                .writes_left
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl DevIo for RamDevice {
    fn capacity_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn capabilities(&self) -> DevCapabilities {
        DevCapabilities {
            sector_size: self.sector_size,
            zero_write: true,
        }
    }

    fn pread(
        &self,
        ir: &Interrupt,
        buf: &mut [u8],
        offset: ByteOffset,
        _flags: IoFlags,
    ) -> Result<()> {
        checkpoint(ir)?;
        check_aligned(offset, buf.len(), self.sector_size)?;
        let bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let start = offset.0 as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(
        &self,
        ir: &Interrupt,
        buf: Option<&[u8]>,
        offset: ByteOffset,
        len: usize,
        flags: IoFlags,
    ) -> Result<()> {
        checkpoint(ir)?;
        check_aligned(offset, len, self.sector_size)?;
        if !self.take_write_budget() {
            let err = PbfsError::Io(std::io::Error::other("injected write failure"));
            if flags.contains(IoFlags::NOWAIT) {
                self.deferred.lock().push(err);
                return Ok(());
            }
            return Err(err);
        }
        let mut bytes = self.bytes.lock();
        check_bounds(offset, len, bytes.len() as u64)?;
        let start = offset.0 as usize;
        match buf {
            Some(data) => {
                if data.len() != len {
                    return Err(PbfsError::Invalid(format!(
                        "pwrite buffer length {} does not match len {len}",
                        data.len()
                    )));
                }
                bytes[start..start + len].copy_from_slice(data);
            }
            None => {
                if !flags.contains(IoFlags::ZERO) {
                    return Err(PbfsError::Invalid(
                        "pwrite without a buffer requires the ZERO flag".to_owned(),
                    ));
                }
                bytes[start..start + len].fill(0);
            }
        }
        Ok(())
    }

    fn flush(&self, ir: &Interrupt) -> Result<()> {
        checkpoint(ir)
    }

    fn wait_io(&self, ir: &Interrupt) -> Result<()> {
        checkpoint(ir)?;
        let mut parked = self.deferred.lock();
        if parked.is_empty() {
            return Ok(());
        }
        let first = parked.remove(0);
        parked.clear();
        Err(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buf_respects_alignment() {
        for alignment in [1_usize, 512, 4096] {
            let mut buf = AlignedBuf::new(1024, alignment);
            assert_eq!(buf.len(), 1024);
            assert_eq!(buf.as_slice().as_ptr() as usize % alignment.max(1), 0);
            buf.as_mut_slice()[0] = 0xAB;
            assert_eq!(buf.as_slice()[0], 0xAB);
        }
        assert!(AlignedBuf::new(0, 4096).is_empty());
    }

    #[test]
    fn ram_device_round_trip() {
        let dev = RamDevice::new(8192, 512);
        let ir = Interrupt::none();
        let data = vec![0x5A_u8; 1024];
        dev.pwrite(&ir, Some(&data), ByteOffset(512), 1024, IoFlags::empty())
            .expect("write");
        let mut back = vec![0_u8; 1024];
        dev.pread(&ir, &mut back, ByteOffset(512), IoFlags::empty())
            .expect("read");
        assert_eq!(back, data);
    }

    #[test]
    fn misaligned_io_rejected() {
        let dev = RamDevice::new(8192, 512);
        let ir = Interrupt::none();
        let mut buf = vec![0_u8; 512];
        assert!(matches!(
            dev.pread(&ir, &mut buf, ByteOffset(100), IoFlags::empty()),
            Err(PbfsError::Invalid(_))
        ));
        let short = vec![0_u8; 100];
        assert!(matches!(
            dev.pwrite(&ir, Some(&short), ByteOffset(0), 100, IoFlags::empty()),
            Err(PbfsError::Invalid(_))
        ));
    }

    #[test]
    fn zero_write_requires_flag_and_fills() {
        let dev = RamDevice::new(4096, 512);
        let ir = Interrupt::none();
        let data = vec![0xFF_u8; 4096];
        dev.pwrite(&ir, Some(&data), ByteOffset(0), 4096, IoFlags::empty())
            .expect("prime");
        assert!(dev
            .pwrite(&ir, None, ByteOffset(0), 512, IoFlags::empty())
            .is_err());
        dev.pwrite(&ir, None, ByteOffset(0), 512, IoFlags::ZERO)
            .expect("zero");
        let contents = dev.contents();
        assert!(contents[..512].iter().all(|b| *b == 0));
        assert!(contents[512..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn nowait_defers_error_to_wait_io() {
        let dev = RamDevice::new(4096, 512);
        let ir = Interrupt::none();
        dev.fail_writes_after(0);
        let data = vec![0_u8; 512];
        dev.pwrite(&ir, Some(&data), ByteOffset(0), 512, IoFlags::NOWAIT)
            .expect("deferred");
        assert!(dev.wait_io(&ir).is_err());
        // Errors are drained by the first wait.
        assert!(dev.wait_io(&ir).is_ok());
    }

    #[test]
    fn file_device_round_trip() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.as_file().set_len(16 * 1024).expect("set_len");
        let dev = FileDevice::open(tmp.path(), 512).expect("open");
        let ir = Interrupt::none();
        let data = vec![0xC3_u8; 2048];
        dev.pwrite(&ir, Some(&data), ByteOffset(4096), 2048, IoFlags::empty())
            .expect("write");
        dev.flush(&ir).expect("flush");
        let mut back = vec![0_u8; 2048];
        dev.pread(&ir, &mut back, ByteOffset(4096), IoFlags::empty())
            .expect("read");
        assert_eq!(back, data);
        let (reads, writes, flushes) = dev.stats().snapshot();
        assert_eq!((reads, writes, flushes), (1, 1, 1));
    }

    #[test]
    fn file_device_zero_write() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.as_file().set_len(8192).expect("set_len");
        let dev = FileDevice::open(tmp.path(), 512).expect("open");
        let ir = Interrupt::none();
        let ones = vec![0xFF_u8; 8192];
        dev.pwrite(&ir, Some(&ones), ByteOffset(0), 8192, IoFlags::empty())
            .expect("prime");
        dev.pwrite(&ir, None, ByteOffset(512), 1024, IoFlags::ZERO)
            .expect("zero");
        let mut back = vec![0_u8; 8192];
        dev.pread(&ir, &mut back, ByteOffset(0), IoFlags::empty())
            .expect("read");
        assert!(back[..512].iter().all(|b| *b == 0xFF));
        assert!(back[512..1536].iter().all(|b| *b == 0));
        assert!(back[1536..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn aborted_interrupt_stops_io() {
        let dev = RamDevice::new(4096, 512);
        let ir = Interrupt::new();
        ir.abort();
        let mut buf = vec![0_u8; 512];
        assert!(matches!(
            dev.pread(&ir, &mut buf, ByteOffset(0), IoFlags::empty()),
            Err(PbfsError::Cancelled)
        ));
    }
}
