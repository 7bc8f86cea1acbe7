#![forbid(unsafe_code)]
//! Block I/O alignment layer.
//!
//! Translates `(block, offset_in_block, len)` requests into sector-aligned
//! device operations. Unaligned edges are handled by read-modify-write on a
//! single sector through a reusable bounce buffer; aligned spans go to the
//! device directly, up to one fragment per segment. Writes with no source
//! buffer become zero-fill, using the device's hardware zeroing when the
//! capability is advertised.

use pbfs_dev::{AlignedBuf, DevIo, IoFlags};
use pbfs_error::{PbfsError, Result};
use pbfs_types::{BlockNo, ByteOffset, Geometry, Interrupt};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Unaligned-edge counters, one instance per mount.
#[derive(Debug, Default)]
pub struct BlkioCounters {
    pub unaligned_r_4k: AtomicU64,
    pub unaligned_w_4k: AtomicU64,
}

impl BlkioCounters {
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.unaligned_r_4k.load(Ordering::Relaxed),
            self.unaligned_w_4k.load(Ordering::Relaxed),
        )
    }
}

/// One aligned I/O window.
///
/// `io_len` is the sector-aligned device transfer length starting at
/// `aligned_bda`; `op_len` is how many caller bytes the window consumes,
/// starting at the unaligned `bda`. The two differ exactly when a
/// read-modify-write is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AlignWindow {
    aligned_bda: u64,
    io_len: usize,
    op_len: usize,
}

/// Compute the next aligned window for `left` bytes at device address `bda`.
///
/// An unaligned start is served by a single-sector window; an aligned start
/// extends to the fragment boundary, rounded up to the sector size.
fn blkio_align(geo: Geometry, bda: u64, left: usize) -> AlignWindow {
    let sector = u64::from(geo.sector_size());
    let fragment = u64::from(geo.fragment_size());
    let sect_off = bda & (sector - 1);
    let frag_off = bda & (fragment - 1);

    if sect_off != 0 {
        let op_len = ((sector - sect_off) as usize).min(left);
        AlignWindow {
            aligned_bda: bda - sect_off,
            io_len: sector as usize,
            op_len,
        }
    } else {
        let op_len = ((fragment - frag_off) as usize).min(left);
        let io_len = (op_len as u64).div_ceil(sector) as usize * sector as usize;
        AlignWindow {
            aligned_bda: bda,
            io_len,
            op_len,
        }
    }
}

struct BlkioCtx<'a> {
    ir: &'a Interrupt,
    dev: &'a dyn DevIo,
    geo: Geometry,
    counters: &'a BlkioCounters,
    /// Lazily allocated fragment-sized bounce buffer for RMW windows.
    bounce: Option<AlignedBuf>,
    ioflags: IoFlags,
}

impl<'a> BlkioCtx<'a> {
    fn bounce(&mut self) -> &mut AlignedBuf {
        let frag = self.geo.fragment_size() as usize;
        self.bounce.get_or_insert_with(|| AlignedBuf::new(frag, frag))
    }

    fn read_window(&mut self, win: AlignWindow, bda: u64, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), win.op_len);
        if win.io_len != win.op_len {
            self.counters.unaligned_r_4k.fetch_add(1, Ordering::Relaxed);
            let io_len = win.io_len;
            let aligned = win.aligned_bda;
            let skew = (bda - aligned) as usize;
            let ir = self.ir;
            let dev = self.dev;
            let bounce = self.bounce();
            dev.pread(
                ir,
                &mut bounce.as_mut_slice()[..io_len],
                ByteOffset(aligned),
                IoFlags::DMABUF,
            )?;
            out.copy_from_slice(&bounce.as_slice()[skew..skew + win.op_len]);
            return Ok(());
        }

        debug_assert_eq!(win.aligned_bda, bda);
        self.dev
            .pread(self.ir, out, ByteOffset(bda), self.ioflags)
    }

    fn write_window(
        &mut self,
        win: AlignWindow,
        bda: u64,
        data: Option<&[u8]>,
        zero: bool,
    ) -> Result<()> {
        if win.io_len != win.op_len {
            self.counters.unaligned_w_4k.fetch_add(1, Ordering::Relaxed);
            let io_len = win.io_len;
            let aligned = win.aligned_bda;
            let skew = (bda - aligned) as usize;
            let ir = self.ir;
            let dev = self.dev;
            let bounce = self.bounce();
            dev.pread(
                ir,
                &mut bounce.as_mut_slice()[..io_len],
                ByteOffset(aligned),
                IoFlags::DMABUF,
            )?;
            match data {
                Some(src) => bounce.as_mut_slice()[skew..skew + win.op_len]
                    .copy_from_slice(&src[..win.op_len]),
                None => {
                    debug_assert!(zero);
                    bounce.as_mut_slice()[skew..skew + win.op_len].fill(0);
                }
            }
            return dev.pwrite(
                ir,
                Some(&bounce.as_slice()[..io_len]),
                ByteOffset(aligned),
                io_len,
                IoFlags::DMABUF,
            );
        }

        debug_assert_eq!(win.aligned_bda, bda);
        match data {
            Some(src) => self.dev.pwrite(
                self.ir,
                Some(&src[..win.op_len]),
                ByteOffset(bda),
                win.io_len,
                self.ioflags,
            ),
            None => self.dev.pwrite(
                self.ir,
                None,
                ByteOffset(bda),
                win.io_len,
                self.ioflags | IoFlags::ZERO,
            ),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.ioflags.contains(IoFlags::NOWAIT) {
            return self.dev.wait_io(self.ir);
        }
        Ok(())
    }
}

fn check_span(geo: Geometry, off: u32, len: usize) -> Result<()> {
    let end = u64::from(off)
        .checked_add(len as u64)
        .ok_or_else(|| PbfsError::Invalid("block span overflows u64".to_owned()))?;
    if end > u64::from(geo.block_size()) {
        return Err(PbfsError::Invalid(format!(
            "I/O spans past block end: off={off} len={len} block_size={}",
            geo.block_size()
        )));
    }
    Ok(())
}

fn segment_flags(geo: Geometry, len: usize) -> IoFlags {
    if len >= 2 * geo.fragment_size() as usize {
        IoFlags::NOWAIT
    } else {
        IoFlags::empty()
    }
}

/// Read `buf.len()` bytes from `(blkno, off)`. `chunk_start` is the device
/// byte offset of physical block 0.
pub fn blkio_read(
    ir: &Interrupt,
    dev: &dyn DevIo,
    geo: Geometry,
    chunk_start: ByteOffset,
    counters: &BlkioCounters,
    buf: &mut [u8],
    blkno: BlockNo,
    off: u32,
) -> Result<()> {
    check_span(geo, off, buf.len())?;
    let base = geo
        .block_to_byte(chunk_start, blkno)
        .ok_or_else(|| PbfsError::Invalid("block address overflows u64".to_owned()))?;
    trace!(
        target: "pbfs::blkio",
        event = "read",
        block = blkno.0,
        off,
        len = buf.len()
    );

    let mut ctx = BlkioCtx {
        ir,
        dev,
        geo,
        counters,
        bounce: None,
        ioflags: segment_flags(geo, buf.len()),
    };

    let mut bda = base.0 + u64::from(off);
    let mut done = 0_usize;
    while done < buf.len() {
        let left = buf.len() - done;
        let win = blkio_align(geo, bda, left);
        ctx.read_window(win, bda, &mut buf[done..done + win.op_len])?;
        bda += win.op_len as u64;
        done += win.op_len;
    }

    ctx.finish()
}

/// Write `len` bytes at `(blkno, off)`. `data == None` zero-fills the range,
/// via the device `ZERO` capability when available and a zero buffer
/// otherwise.
pub fn blkio_write(
    ir: &Interrupt,
    dev: &dyn DevIo,
    geo: Geometry,
    chunk_start: ByteOffset,
    counters: &BlkioCounters,
    data: Option<&[u8]>,
    blkno: BlockNo,
    off: u32,
    len: usize,
) -> Result<()> {
    check_span(geo, off, len)?;
    if let Some(src) = data {
        if src.len() != len {
            return Err(PbfsError::Invalid(format!(
                "write buffer length {} does not match len {len}",
                src.len()
            )));
        }
    }
    let base = geo
        .block_to_byte(chunk_start, blkno)
        .ok_or_else(|| PbfsError::Invalid("block address overflows u64".to_owned()))?;
    trace!(
        target: "pbfs::blkio",
        event = "write",
        block = blkno.0,
        off,
        len,
        zero = data.is_none()
    );

    // Software zero path: fall back to a zero buffer when the device cannot
    // zero-fill by itself.
    let zero_page;
    let (data, zero) = match data {
        Some(src) => (Some(src), false),
        None if dev.capabilities().zero_write => (None, true),
        None => {
            zero_page = vec![0_u8; len];
            (Some(zero_page.as_slice()), false)
        }
    };

    let mut ctx = BlkioCtx {
        ir,
        dev,
        geo,
        counters,
        bounce: None,
        ioflags: segment_flags(geo, len),
    };

    let mut bda = base.0 + u64::from(off);
    let mut done = 0_usize;
    while done < len {
        let left = len - done;
        let win = blkio_align(geo, bda, left);
        let src = data.map(|d| &d[done..done + win.op_len]);
        ctx.write_window(win, bda, src, zero)?;
        bda += win.op_len as u64;
        done += win.op_len;
    }

    ctx.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_dev::RamDevice;

    fn geo() -> Geometry {
        Geometry::new(512, 4096, 32 * 1024, 64 * 32 * 1024).expect("geometry")
    }

    fn dev_for(geo: Geometry) -> RamDevice {
        RamDevice::new(geo.chunk_size() as usize, geo.sector_size())
    }

    #[test]
    fn align_window_math() {
        let geo = geo();
        // Unaligned start: one sector, shifted left.
        let win = blkio_align(geo, 100, 1000);
        assert_eq!(win.aligned_bda, 0);
        assert_eq!(win.io_len, 512);
        assert_eq!(win.op_len, 412);
        // Aligned start: runs to the fragment boundary.
        let win = blkio_align(geo, 512, 100_000);
        assert_eq!(win.aligned_bda, 512);
        assert_eq!(win.op_len, 4096 - 512);
        assert_eq!(win.io_len, 4096 - 512);
        // Aligned start, short tail: io rounds up to the sector.
        let win = blkio_align(geo, 4096, 100);
        assert_eq!(win.aligned_bda, 4096);
        assert_eq!(win.op_len, 100);
        assert_eq!(win.io_len, 512);
    }

    #[test]
    fn round_trip_arbitrary_offsets() {
        let geo = geo();
        let dev = dev_for(geo);
        let ir = Interrupt::none();
        let counters = BlkioCounters::default();

        for (off, len) in [(0_u32, 26_usize), (100, 412), (511, 2), (4000, 9000), (0, 32 * 1024)] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            blkio_write(
                &ir,
                &dev,
                geo,
                ByteOffset::ZERO,
                &counters,
                Some(&data),
                BlockNo(1),
                off,
                len,
            )
            .expect("write");
            let mut back = vec![0_u8; len];
            blkio_read(
                &ir,
                &dev,
                geo,
                ByteOffset::ZERO,
                &counters,
                &mut back,
                BlockNo(1),
                off,
            )
            .expect("read");
            assert_eq!(back, data, "off={off} len={len}");
        }
    }

    #[test]
    fn rmw_preserves_neighboring_bytes() {
        let geo = geo();
        let dev = dev_for(geo);
        let ir = Interrupt::none();
        let counters = BlkioCounters::default();

        let sector = vec![0xEE_u8; 512];
        blkio_write(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            Some(&sector),
            BlockNo(0),
            0,
            512,
        )
        .expect("prime");

        // Overwrite bytes 100..110 only.
        let patch = vec![0x11_u8; 10];
        blkio_write(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            Some(&patch),
            BlockNo(0),
            100,
            10,
        )
        .expect("patch");

        let mut back = vec![0_u8; 512];
        blkio_read(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            &mut back,
            BlockNo(0),
            0,
        )
        .expect("read");
        assert!(back[..100].iter().all(|b| *b == 0xEE));
        assert!(back[100..110].iter().all(|b| *b == 0x11));
        assert!(back[110..].iter().all(|b| *b == 0xEE));

        let (_, unaligned_w) = counters.snapshot();
        assert!(unaligned_w >= 1);
    }

    #[test]
    fn zero_write_fills_range() {
        let geo = geo();
        let dev = dev_for(geo);
        let ir = Interrupt::none();
        let counters = BlkioCounters::default();

        let ones = vec![0xFF_u8; 8192];
        blkio_write(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            Some(&ones),
            BlockNo(2),
            0,
            8192,
        )
        .expect("prime");
        blkio_write(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            None,
            BlockNo(2),
            300,
            5000,
        )
        .expect("zero");

        let mut back = vec![0_u8; 8192];
        blkio_read(
            &ir,
            &dev,
            geo,
            ByteOffset::ZERO,
            &counters,
            &mut back,
            BlockNo(2),
            0,
        )
        .expect("read");
        assert!(back[..300].iter().all(|b| *b == 0xFF));
        assert!(back[300..5300].iter().all(|b| *b == 0));
        assert!(back[5300..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn span_past_block_end_rejected() {
        let geo = geo();
        let dev = dev_for(geo);
        let ir = Interrupt::none();
        let counters = BlkioCounters::default();
        let mut buf = vec![0_u8; 1024];
        let off = geo.block_size() - 512;
        assert!(matches!(
            blkio_read(
                &ir,
                &dev,
                geo,
                ByteOffset::ZERO,
                &counters,
                &mut buf,
                BlockNo(0),
                off,
            ),
            Err(PbfsError::Invalid(_))
        ));
    }
}
