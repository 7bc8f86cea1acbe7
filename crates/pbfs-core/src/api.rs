//! POSIX-shaped facade.
//!
//! Descriptors handed out here carry the bit-30 tag so callers can
//! distinguish PBFS handles from kernel fds; directory streams additionally
//! set the low bit. Transient `Again` results (version skew against a
//! concurrent follower view) are retried in a bounded loop before being
//! surfaced.

use crate::file::{DirEntryInfo, FileStat, FmapEntry, FsStat, OpenFlags};
use crate::{Environment, Whence};
use pbfs_error::{PbfsError, Result};
use pbfs_types::{fd_is_valid, fd_make, fd_raw};
use tracing::trace;

/// Bounded retry for `EAGAIN`-class version skew.
const MAX_RETRIES: u32 = 100;

/// Directory streams use the low bit of the raw descriptor as a tag.
fn dir_make(raw: usize) -> i32 {
    fd_make(((raw << 1) | 1) as i32)
}

fn dir_raw(fd: i32) -> Result<usize> {
    if !fd_is_valid(fd) || fd_raw(fd) & 1 == 0 {
        return Err(PbfsError::BadFd);
    }
    Ok((fd_raw(fd) >> 1) as usize)
}

fn file_make(raw: usize) -> i32 {
    fd_make((raw << 1) as i32)
}

fn file_raw(fd: i32) -> Result<usize> {
    if !fd_is_valid(fd) || fd_raw(fd) & 1 != 0 {
        return Err(PbfsError::BadFd);
    }
    Ok((fd_raw(fd) >> 1) as usize)
}

fn with_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match f() {
            Err(PbfsError::Again) if attempts < MAX_RETRIES => {
                attempts += 1;
                trace!(target: "pbfs::api", event = "retry", attempts);
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

fn parse_open_flags(oflags: i32) -> Result<OpenFlags> {
    const KNOWN: i32 = libc::O_ACCMODE
        | libc::O_CREAT
        | libc::O_EXCL
        | libc::O_TRUNC
        | libc::O_APPEND
        | libc::O_CLOEXEC;
    if oflags & !KNOWN != 0 {
        return Err(PbfsError::NotSupported);
    }
    let access = oflags & libc::O_ACCMODE;
    let (read, write) = match access {
        libc::O_RDONLY => (true, false),
        libc::O_WRONLY => (false, true),
        libc::O_RDWR => (true, true),
        _ => return Err(PbfsError::Invalid(format!("bad access mode {access:#o}"))),
    };
    if oflags & libc::O_TRUNC != 0 && !write {
        return Err(PbfsError::Invalid("O_TRUNC requires write access".to_owned()));
    }
    Ok(OpenFlags {
        read,
        write,
        create: oflags & libc::O_CREAT != 0,
        excl: oflags & libc::O_EXCL != 0,
        truncate: oflags & libc::O_TRUNC != 0,
        append: oflags & libc::O_APPEND != 0,
    })
}

/// The user-facing API surface. All paths begin with `/<pbd>/...`.
pub struct Pbfs {
    env: Environment,
}

impl Pbfs {
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn open(&self, path: &str, oflags: i32) -> Result<i32> {
        let flags = parse_open_flags(oflags)?;
        let raw = with_retry(|| self.env.open(path, flags))?;
        Ok(file_make(raw))
    }

    /// `creat` is `open(O_CREAT | O_TRUNC | O_WRONLY)`.
    pub fn creat(&self, path: &str) -> Result<i32> {
        self.open(path, libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY)
    }

    pub fn close(&self, fd: i32) -> Result<()> {
        self.env.close(file_raw(fd)?)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let raw = file_raw(fd)?;
        with_retry(|| self.env.read(raw, buf))
    }

    pub fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
        let raw = file_raw(fd)?;
        with_retry(|| self.env.pread(raw, buf, offset))
    }

    /// Scatter read: fills each buffer in turn at the shared offset.
    pub fn readv(&self, fd: i32, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.read(fd, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn preadv(&self, fd: i32, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut total = 0_usize;
        for buf in bufs.iter_mut() {
            let n = self.pread(fd, buf, offset + total as u64)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        let raw = file_raw(fd)?;
        with_retry(|| self.env.write(raw, data))
    }

    pub fn pwrite(&self, fd: i32, data: &[u8], offset: u64) -> Result<usize> {
        let raw = file_raw(fd)?;
        with_retry(|| self.env.pwrite(raw, data, offset))
    }

    pub fn writev(&self, fd: i32, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            total += self.write(fd, buf)?;
        }
        Ok(total)
    }

    pub fn pwritev(&self, fd: i32, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        let mut total = 0_usize;
        for buf in bufs {
            total += self.pwrite(fd, buf, offset + total as u64)?;
        }
        Ok(total)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<u64> {
        let whence = match whence {
            libc::SEEK_SET => Whence::Set,
            libc::SEEK_CUR => Whence::Cur,
            libc::SEEK_END => Whence::End,
            other => {
                return Err(PbfsError::Invalid(format!("unsupported whence {other}")));
            }
        };
        self.env.lseek(file_raw(fd)?, offset, whence)
    }

    pub fn ftruncate(&self, fd: i32, len: u64) -> Result<()> {
        let raw = file_raw(fd)?;
        with_retry(|| self.env.ftruncate(raw, len))
    }

    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        with_retry(|| self.env.truncate(path, len))
    }

    pub fn fallocate(&self, fd: i32, mode: i32, offset: u64, len: u64) -> Result<()> {
        let keep_size = mode == libc::FALLOC_FL_KEEP_SIZE;
        if mode != 0 && !keep_size {
            return Err(PbfsError::NotSupported);
        }
        let raw = file_raw(fd)?;
        with_retry(|| self.env.fallocate(raw, offset, len, keep_size))
    }

    pub fn posix_fallocate(&self, fd: i32, offset: u64, len: u64) -> Result<()> {
        self.fallocate(fd, 0, offset, len)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        with_retry(|| self.env.stat(path))
    }

    pub fn fstat(&self, fd: i32) -> Result<FileStat> {
        self.env.fstat(file_raw(fd)?)
    }

    pub fn statfs(&self, path: &str) -> Result<FsStat> {
        self.env.statfs(path)
    }

    pub fn fstatfs(&self, fd: i32) -> Result<FsStat> {
        self.env.fstatfs(file_raw(fd)?)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        with_retry(|| self.env.unlink(path))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        with_retry(|| self.env.mkdir(path))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        with_retry(|| self.env.rmdir(path))
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        with_retry(|| self.env.rename(src, dst, false))
    }

    /// `rename` with `RENAME_NOREPLACE`.
    pub fn rename_noreplace(&self, src: &str, dst: &str) -> Result<()> {
        with_retry(|| self.env.rename(src, dst, true))
    }

    pub fn opendir(&self, path: &str) -> Result<i32> {
        let raw = with_retry(|| self.env.opendir(path))?;
        Ok(dir_make(raw))
    }

    pub fn readdir(&self, dir: i32) -> Result<Option<DirEntryInfo>> {
        self.env.readdir(dir_raw(dir)?)
    }

    pub fn closedir(&self, dir: i32) -> Result<()> {
        self.env.closedir(dir_raw(dir)?)
    }

    pub fn chdir(&self, path: &str) -> Result<()> {
        self.env.chdir(path)
    }

    pub fn getcwd(&self) -> String {
        self.env.getcwd()
    }

    pub fn access(&self, path: &str) -> Result<()> {
        with_retry(|| self.env.access(path))
    }

    /// Flushes the device write cache only. The metadata journal is flushed
    /// at every Tx commit, so `fsync` here is WEAKER than POSIX fsync: a
    /// crash can lose no committed metadata, but this call adds no metadata
    /// durability of its own.
    pub fn fsync(&self, fd: i32) -> Result<()> {
        self.env.fsync(file_raw(fd)?)
    }

    pub fn fdatasync(&self, fd: i32) -> Result<()> {
        self.fsync(fd)
    }

    /// The file→device block mapping, for databases that address the PBD
    /// directly.
    pub fn fmap(&self, fd: i32) -> Result<Vec<FmapEntry>> {
        self.env.fmap(file_raw(fd)?)
    }

    /// Permission bits are not tracked; succeeds without effect.
    pub fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }

    /// Ownership is not tracked; succeeds without effect.
    pub fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_tags_round_trip() {
        let file = file_make(5);
        assert!(fd_is_valid(file));
        assert_eq!(file_raw(file).expect("file"), 5);
        assert!(dir_raw(file).is_err());

        let dir = dir_make(5);
        assert!(fd_is_valid(dir));
        assert_eq!(dir_raw(dir).expect("dir"), 5);
        assert!(file_raw(dir).is_err());

        // Kernel-looking fds are rejected outright.
        assert!(file_raw(7).is_err());
        assert!(dir_raw(7).is_err());
    }

    #[test]
    fn open_flag_parsing() {
        let flags = parse_open_flags(libc::O_RDWR | libc::O_CREAT).expect("flags");
        assert!(flags.read && flags.write && flags.create);
        assert!(!flags.excl && !flags.truncate && !flags.append);

        let flags = parse_open_flags(libc::O_WRONLY | libc::O_APPEND).expect("flags");
        assert!(!flags.read && flags.write && flags.append);

        assert!(matches!(
            parse_open_flags(libc::O_RDONLY | libc::O_TRUNC),
            Err(PbfsError::Invalid(_))
        ));
        assert!(matches!(
            parse_open_flags(libc::O_RDWR | libc::O_DIRECT),
            Err(PbfsError::NotSupported)
        ));
    }

    #[test]
    fn retry_bounds_again() {
        let mut calls = 0;
        let result: Result<()> = with_retry(|| {
            calls += 1;
            Err(PbfsError::Again)
        });
        assert!(matches!(result, Err(PbfsError::Again)));
        assert_eq!(calls, MAX_RETRIES + 1);

        let mut calls = 0;
        let result = with_retry(|| {
            calls += 1;
            if calls < 3 {
                Err(PbfsError::Again)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("eventually succeeds"), 3);
    }
}
