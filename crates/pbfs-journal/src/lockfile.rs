//! Host-local lock file.
//!
//! Prevents two processes on the same host from claiming the same hostid.
//! Each hostid range of `<run_dir>/<pbd>-hostid` is guarded by an
//! exclusive lock file (`<pbd>-hostid.<range>`) created with `create_new`
//! and holding the owner pid, giving per-host exclusion equivalent to an
//! fcntl byte-range lock over `[host_id * 1024, (host_id + 1) * 1024)`
//! without leaving safe Rust. Two extra ranges exist: `MAX_HOSTS + 1`
//! serializes mount preparation against growfs and `MAX_HOSTS + 2` is
//! reserved for tool-mode mkfs/growfs.

use pbfs_error::{PbfsError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An exclusive host-local lock over one hostid range.
///
/// Released on drop.
#[derive(Debug)]
pub struct HostLockFile {
    path: PathBuf,
    range: u32,
}

impl HostLockFile {
    /// Acquire the lock for `range` (a hostid, or one of the reserved
    /// ranges). Fails with `Busy` when a live process already holds it;
    /// locks abandoned by dead processes are reclaimed.
    pub fn acquire(run_dir: &Path, pbd: &str, range: u32) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(format!("{pbd}-hostid.{range}"));

        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(
                        target: "pbfs::lockfile",
                        event = "acquired",
                        path = %path.display(),
                        range
                    );
                    return Ok(Self { path, range });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && Self::holder_is_dead(&path) {
                        warn!(
                            target: "pbfs::lockfile",
                            event = "stale_lock_reclaimed",
                            path = %path.display()
                        );
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    return Err(PbfsError::Busy);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(PbfsError::Busy)
    }

    fn holder_is_dead(path: &Path) -> bool {
        let Ok(contents) = fs::read_to_string(path) else {
            // Unreadable lock: err on the side of "still held".
            return false;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return false;
        };
        if pid == std::process::id() {
            return false;
        }
        !Path::new(&format!("/proc/{pid}")).exists()
    }

    #[must_use]
    pub fn range(&self) -> u32 {
        self.range
    }
}

impl Drop for HostLockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        debug!(
            target: "pbfs::lockfile",
            event = "released",
            path = %self.path.display(),
            range = self.range
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_types::{HOSTID_RANGE_PREPARE, HOSTID_RANGE_TOOL};

    #[test]
    fn acquire_release_reacquire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = HostLockFile::acquire(dir.path(), "pbd0", 1).expect("acquire");
        assert_eq!(lock.range(), 1);
        drop(lock);
        HostLockFile::acquire(dir.path(), "pbd0", 1).expect("reacquire");
    }

    #[test]
    fn second_acquire_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _lock = HostLockFile::acquire(dir.path(), "pbd0", 1).expect("acquire");
        assert!(matches!(
            HostLockFile::acquire(dir.path(), "pbd0", 1),
            Err(PbfsError::Busy)
        ));
    }

    #[test]
    fn distinct_ranges_do_not_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _a = HostLockFile::acquire(dir.path(), "pbd0", 1).expect("host 1");
        let _b = HostLockFile::acquire(dir.path(), "pbd0", 2).expect("host 2");
        let _c = HostLockFile::acquire(dir.path(), "pbd0", HOSTID_RANGE_PREPARE).expect("prepare");
        let _d = HostLockFile::acquire(dir.path(), "pbd0", HOSTID_RANGE_TOOL).expect("tool");
    }

    #[test]
    fn distinct_pbds_do_not_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _a = HostLockFile::acquire(dir.path(), "pbd0", 1).expect("pbd0");
        let _b = HostLockFile::acquire(dir.path(), "pbd1", 1).expect("pbd1");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pbd0-hostid.1");
        // Pid 0 is never a live userspace process.
        fs::write(&path, "0").expect("plant stale lock");
        // /proc/0 does not exist, so the stale lock is swept.
        HostLockFile::acquire(dir.path(), "pbd0", 1).expect("reclaim");
    }
}
