#![forbid(unsafe_code)]
//! Request/response rings between the client library (L) and the daemon (D).
//!
//! A channel is an array of slots, each owning a request cell, a response
//! cell, and an I/O buffer capped at `MAX_IOSIZE`. Slot ownership follows
//! `FREE → L_OWN → D_OWN → L_OWN → FREE`: the client claims a free slot,
//! writes the request, hands it to the daemon, and sleeps on the slot's
//! condvar; a daemon worker takes the request, writes the response, and
//! hands the slot back.
//!
//! Staleness: every request carries the client's view of the mount epoch;
//! the daemon answers `Stale` on mismatch, and the client refreshes with
//! [`Channel::update_meta`] and retries — invisible to the caller. Slots
//! abandoned by dead client processes are reclaimed by the daemon's
//! supervisor after a grace period.

use parking_lot::{Condvar, Mutex};
use pbfs_core::{DirEntryInfo, FileStat, FmapEntry, FsStat};
use pbfs_error::{PbfsError, Result};
use pbfs_types::{Interrupt, MAX_IOSIZE};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Slots per connection.
pub const CHANNEL_SLOTS: usize = 32;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Remount requests replay the whole journal; they get a far longer leash.
pub const REMOUNT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2000);

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { path: String, oflags: i32 },
    Close { fd: i32 },
    Read { fd: i32, len: u32 },
    Pread { fd: i32, len: u32, offset: u64 },
    /// Payload travels in the slot's iobuf.
    Write { fd: i32 },
    Pwrite { fd: i32, offset: u64 },
    Lseek { fd: i32, offset: i64, whence: i32 },
    Ftruncate { fd: i32, len: u64 },
    Truncate { path: String, len: u64 },
    Fallocate { fd: i32, mode: i32, offset: u64, len: u64 },
    Stat { path: String },
    Fstat { fd: i32 },
    Statfs { path: String },
    Unlink { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Rename { src: String, dst: String, noreplace: bool },
    Opendir { path: String },
    Readdir { dir: i32 },
    Closedir { dir: i32 },
    Chdir { path: String },
    Getcwd,
    Access { path: String },
    Fsync { fd: i32 },
    Fmap { fd: i32 },
    Growfs,
    /// Fetch the daemon's current mount epoch.
    UpdateMeta,
}

/// One daemon response. Read payloads travel back in the slot's iobuf.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Unit,
    Errno(i32),
    Fd(i32),
    Size(u64),
    Stat(FileStat),
    StatFs(FsStat),
    Dirent(Option<DirEntryInfo>),
    Cwd(String),
    Fmap(Vec<FmapEntry>),
    Epoch(u64),
    /// The request carried an outdated mount epoch.
    Stale,
}

impl Response {
    #[must_use]
    pub fn from_err(err: &PbfsError) -> Self {
        Self::Errno(err.to_errno())
    }
}

/// Rebuild a typed error from a wire errno.
#[must_use]
pub fn error_from_errno(errno: i32) -> PbfsError {
    match errno {
        libc::EAGAIN => PbfsError::Again,
        libc::ENOSPC => PbfsError::NoSpace,
        libc::EFBIG => PbfsError::FileTooBig,
        libc::EMFILE => PbfsError::TooManyFiles,
        libc::ENOENT => PbfsError::NotFound("remote".to_owned()),
        libc::EEXIST => PbfsError::Exists,
        libc::ENOTDIR => PbfsError::NotDirectory,
        libc::EISDIR => PbfsError::IsDirectory,
        libc::ENOTEMPTY => PbfsError::NotEmpty,
        libc::ENAMETOOLONG => PbfsError::NameTooLong,
        libc::EBADF => PbfsError::BadFd,
        libc::EROFS => PbfsError::ReadOnly,
        libc::EBUSY => PbfsError::Busy,
        libc::EACCES => PbfsError::Fenced("remote".to_owned()),
        libc::EXDEV => PbfsError::CrossDevice,
        libc::ESTALE => PbfsError::Stale,
        libc::ETIMEDOUT => PbfsError::TimedOut,
        libc::ECANCELED => PbfsError::Cancelled,
        libc::ENOTSUP => PbfsError::NotSupported,
        libc::EINVAL => PbfsError::Invalid("remote".to_owned()),
        other => PbfsError::Io(std::io::Error::from_raw_os_error(other)),
    }
}

// ── Slot ────────────────────────────────────────────────────────────────────

const STATE_FREE: u8 = 0;
/// Claimed by the client, request being written.
const STATE_L_OWN: u8 = 1;
/// Submitted; waiting for a daemon worker.
const STATE_D_OWN: u8 = 2;
/// Response written; back with the client.
const STATE_L_DONE: u8 = 3;
/// A worker is executing the request; the slot must not be recycled.
const STATE_D_BUSY: u8 = 4;

#[derive(Debug)]
struct Slot {
    state: AtomicU8,
    owner_pid: AtomicU32,
    /// Client's mount-epoch view at submit time.
    mount_epoch: AtomicU64,
    claimed_at: Mutex<Option<Instant>>,
    request: Mutex<Option<Request>>,
    response: Mutex<Option<Response>>,
    iobuf: Mutex<Vec<u8>>,
    done_lock: Mutex<bool>,
    done_cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_FREE),
            owner_pid: AtomicU32::new(0),
            mount_epoch: AtomicU64::new(0),
            claimed_at: Mutex::new(None),
            request: Mutex::new(None),
            response: Mutex::new(None),
            iobuf: Mutex::new(Vec::new()),
            done_lock: Mutex::new(false),
            done_cond: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.request.lock() = None;
        *self.response.lock() = None;
        self.iobuf.lock().clear();
        *self.claimed_at.lock() = None;
        self.owner_pid.store(0, Ordering::Release);
        *self.done_lock.lock() = false;
        self.state.store(STATE_FREE, Ordering::Release);
    }
}

// ── Channel ─────────────────────────────────────────────────────────────────

/// One client connection's ring.
#[derive(Debug)]
pub struct Channel {
    pbd: String,
    conn_id: u64,
    shm_path: String,
    slots: Vec<Slot>,
    /// Authoritative mount epoch, maintained by the daemon.
    daemon_epoch: AtomicU64,
    /// The client's cached view, refreshed by `update_meta`.
    client_epoch: AtomicU64,
}

impl Channel {
    #[must_use]
    pub fn new(shm_dir: &Path, pbd: &str, conn_id: u64) -> Self {
        let shm_path = shm_dir
            .join(format!("pbfs-{pbd}-{conn_id}"))
            .to_string_lossy()
            .into_owned();
        Self {
            pbd: pbd.to_owned(),
            conn_id,
            shm_path,
            slots: (0..CHANNEL_SLOTS).map(|_| Slot::new()).collect(),
            daemon_epoch: AtomicU64::new(1),
            client_epoch: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn pbd(&self) -> &str {
        &self.pbd
    }

    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The shm object name backing this connection.
    #[must_use]
    pub fn shm_path(&self) -> &str {
        &self.shm_path
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // ── Client side ─────────────────────────────────────────────────────

    /// Submit one request and wait for its response. On timeout the slot is
    /// released (or left for the zombie sweep if the daemon holds it) and
    /// `TimedOut` is returned with no side effects on the caller.
    pub fn submit(
        &self,
        ir: &Interrupt,
        request: Request,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(Response, Vec<u8>)> {
        if payload.len() > MAX_IOSIZE {
            return Err(PbfsError::Invalid(format!(
                "payload {} exceeds MAX_IOSIZE {MAX_IOSIZE}",
                payload.len()
            )));
        }
        let deadline = Instant::now() + timeout;
        let idx = self.claim_slot(ir, deadline)?;
        let slot = &self.slots[idx];

        slot.owner_pid.store(std::process::id(), Ordering::Release);
        *slot.claimed_at.lock() = Some(Instant::now());
        slot.mount_epoch
            .store(self.client_epoch.load(Ordering::Acquire), Ordering::Release);
        *slot.request.lock() = Some(request);
        *slot.iobuf.lock() = payload;
        slot.state.store(STATE_D_OWN, Ordering::Release);
        trace!(
            target: "pbfs::channel",
            event = "submit",
            conn = self.conn_id,
            slot = idx
        );

        // Sleep until the daemon flips the slot back.
        let mut done = slot.done_lock.lock();
        while !*done {
            if let Err(interrupted) = ir.checkpoint() {
                drop(done);
                let _ = self.abandon_slot(idx);
                return Err(interrupted.into());
            }
            let now = Instant::now();
            if now >= deadline {
                drop(done);
                return self.abandon_slot(idx);
            }
            slot.done_cond.wait_until(&mut done, deadline.min(now + Duration::from_millis(50)));
        }
        drop(done);

        let response = slot
            .response
            .lock()
            .take()
            .unwrap_or(Response::Errno(libc::EIO));
        let data = std::mem::take(&mut *slot.iobuf.lock());
        slot.reset();
        Ok((response, data))
    }

    fn claim_slot(&self, ir: &Interrupt, deadline: Instant) -> Result<usize> {
        loop {
            ir.checkpoint().map_err(PbfsError::from)?;
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot
                    .state
                    .compare_exchange(STATE_FREE, STATE_L_OWN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(idx);
                }
            }
            if Instant::now() >= deadline {
                return Err(PbfsError::TimedOut);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// A timed-out request: if the daemon never took the slot (or already
    /// finished it) the slot is recycled, discarding any late response;
    /// a slot mid-execution is disowned for the zombie sweep instead.
    fn abandon_slot(&self, idx: usize) -> Result<(Response, Vec<u8>)> {
        let slot = &self.slots[idx];
        let reclaimable = slot
            .state
            .compare_exchange(STATE_D_OWN, STATE_L_OWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || slot
                .state
                .compare_exchange(STATE_L_DONE, STATE_L_OWN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if reclaimable {
            slot.reset();
        } else {
            slot.owner_pid.store(0, Ordering::Release);
        }
        warn!(
            target: "pbfs::channel",
            event = "request_timeout",
            conn = self.conn_id,
            slot = idx
        );
        Err(PbfsError::TimedOut)
    }

    /// Submit with transparent staleness recovery: on `Stale`, refresh the
    /// cached mount epoch and retry.
    pub fn call(
        &self,
        ir: &Interrupt,
        request: Request,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(Response, Vec<u8>)> {
        for _ in 0..3 {
            let (response, data) = self.submit(ir, request.clone(), payload.clone(), timeout)?;
            if matches!(response, Response::Stale) {
                debug!(
                    target: "pbfs::channel",
                    event = "stale_retry",
                    conn = self.conn_id
                );
                self.update_meta();
                continue;
            }
            return Ok((response, data));
        }
        Err(PbfsError::Stale)
    }

    /// Refresh the cached mount epoch from the daemon's side of the ring.
    pub fn update_meta(&self) {
        self.client_epoch
            .store(self.daemon_epoch.load(Ordering::Acquire), Ordering::Release);
    }

    /// Reinitialize per-connection state in a forked child. Called before
    /// any other method: in-flight slots belong to the parent and are left
    /// for it (or the zombie sweep) to settle; the child starts with a
    /// fresh epoch view.
    pub fn after_fork_child(&self) {
        self.update_meta();
    }

    // ── Daemon side ─────────────────────────────────────────────────────

    /// Publish the mount epoch clients are validated against.
    pub fn set_daemon_epoch(&self, epoch: u64) {
        self.daemon_epoch.store(epoch, Ordering::Release);
    }

    #[must_use]
    pub fn daemon_epoch(&self) -> u64 {
        self.daemon_epoch.load(Ordering::Acquire)
    }

    /// Worker: take a submitted request from `idx`, if any. Returns the
    /// request, its payload, and the client's mount-epoch view. The slot is
    /// marked busy until [`respond`](Self::respond) hands it back.
    pub fn take_request(&self, idx: usize) -> Option<(Request, Vec<u8>, u64)> {
        let slot = self.slots.get(idx)?;
        if slot
            .state
            .compare_exchange(STATE_D_OWN, STATE_D_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let request = slot.request.lock().take()?;
        let payload = std::mem::take(&mut *slot.iobuf.lock());
        Some((request, payload, slot.mount_epoch.load(Ordering::Acquire)))
    }

    /// Worker: write the response for `idx` and hand the slot back.
    pub fn respond(&self, idx: usize, response: Response, payload: Vec<u8>) {
        let Some(slot) = self.slots.get(idx) else {
            return;
        };
        *slot.response.lock() = Some(response);
        *slot.iobuf.lock() = payload;
        slot.state.store(STATE_L_DONE, Ordering::Release);
        let mut done = slot.done_lock.lock();
        *done = true;
        slot.done_cond.notify_all();
    }

    /// Supervisor: reclaim slots whose owning process died. A slot is only
    /// swept after `grace` has passed since it was claimed, so a live
    /// request isn't yanked out from under a worker.
    pub fn reclaim_dead_slots(&self, grace: Duration) -> usize {
        let mut reclaimed = 0;
        for (idx, slot) in self.slots.iter().enumerate() {
            let state = slot.state.load(Ordering::Acquire);
            // A busy slot is in a worker's hands; it will come back as
            // L_DONE and get swept on a later pass.
            if state == STATE_FREE || state == STATE_D_BUSY {
                continue;
            }
            let pid = slot.owner_pid.load(Ordering::Acquire);
            if pid != 0 && process_alive(pid) {
                continue;
            }
            let expired = slot
                .claimed_at
                .lock()
                .is_none_or(|at| at.elapsed() >= grace);
            if !expired {
                continue;
            }
            warn!(
                target: "pbfs::channel",
                event = "zombie_reclaimed",
                conn = self.conn_id,
                slot = idx,
                pid
            );
            slot.reset();
            reclaimed += 1;
        }
        reclaimed
    }

    /// Release every slot owned by `pid` (client abort / death). Slots a
    /// worker is still executing are left to finish; they return as
    /// `L_DONE` and fall to the next sweep.
    pub fn abort_requests(&self, pid: u32) -> usize {
        let mut released = 0;
        for slot in &self.slots {
            let state = slot.state.load(Ordering::Acquire);
            if slot.owner_pid.load(Ordering::Acquire) == pid
                && state != STATE_FREE
                && state != STATE_D_BUSY
            {
                slot.reset();
                released += 1;
            }
        }
        if released > 0 {
            debug!(
                target: "pbfs::channel",
                event = "abort_requests",
                conn = self.conn_id,
                pid,
                released
            );
        }
        released
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel() -> Channel {
        Channel::new(Path::new("/tmp"), "pbd0", 7)
    }

    #[test]
    fn shm_path_format() {
        let ch = channel();
        assert_eq!(ch.shm_path(), "/tmp/pbfs-pbd0-7");
        assert_eq!(ch.conn_id(), 7);
        assert_eq!(ch.slot_count(), CHANNEL_SLOTS);
    }

    #[test]
    fn request_response_round_trip() {
        let ch = Arc::new(channel());
        let server = Arc::clone(&ch);
        let worker = std::thread::spawn(move || loop {
            for idx in 0..server.slot_count() {
                if let Some((request, payload, _)) = server.take_request(idx) {
                    assert_eq!(request, Request::Getcwd);
                    assert_eq!(payload, b"ping".to_vec());
                    server.respond(idx, Response::Cwd("/".to_owned()), b"pong".to_vec());
                    return;
                }
            }
            std::thread::sleep(Duration::from_micros(100));
        });

        let ir = Interrupt::none();
        let (response, data) = ch
            .submit(&ir, Request::Getcwd, b"ping".to_vec(), Duration::from_secs(5))
            .expect("round trip");
        assert_eq!(response, Response::Cwd("/".to_owned()));
        assert_eq!(data, b"pong".to_vec());
        worker.join().expect("worker");

        // The slot is free again.
        assert!(ch.take_request(0).is_none());
    }

    #[test]
    fn submit_times_out_when_unserved() {
        let ch = channel();
        let ir = Interrupt::none();
        let err = ch
            .submit(&ir, Request::Getcwd, Vec::new(), Duration::from_millis(50))
            .expect_err("no daemon");
        assert!(matches!(err, PbfsError::TimedOut));
        // The abandoned slot was freed (daemon never took it).
        let ir = Interrupt::none();
        let err = ch
            .submit(&ir, Request::Getcwd, Vec::new(), Duration::from_millis(50))
            .expect_err("still no daemon");
        assert!(matches!(err, PbfsError::TimedOut));
    }

    #[test]
    fn oversized_payload_rejected() {
        let ch = channel();
        let ir = Interrupt::none();
        let err = ch
            .submit(
                &ir,
                Request::Write { fd: 3 },
                vec![0_u8; MAX_IOSIZE + 1],
                Duration::from_secs(1),
            )
            .expect_err("too big");
        assert!(matches!(err, PbfsError::Invalid(_)));
    }

    #[test]
    fn stale_epoch_recovers_via_update_meta() {
        let ch = Arc::new(channel());
        // Daemon has moved on to epoch 5; the client still believes 1.
        ch.set_daemon_epoch(5);

        let server = Arc::clone(&ch);
        let worker = std::thread::spawn(move || {
            let mut served = 0;
            while served < 2 {
                for idx in 0..server.slot_count() {
                    if let Some((_, _, client_epoch)) = server.take_request(idx) {
                        if client_epoch != server.daemon_epoch() {
                            server.respond(idx, Response::Stale, Vec::new());
                        } else {
                            server.respond(idx, Response::Unit, Vec::new());
                        }
                        served += 1;
                    }
                }
                std::thread::sleep(Duration::from_micros(100));
            }
        });

        let ir = Interrupt::none();
        let (response, _) = ch
            .call(&ir, Request::Fsync { fd: 3 }, Vec::new(), Duration::from_secs(5))
            .expect("call");
        assert_eq!(response, Response::Unit);
        worker.join().expect("worker");
    }

    #[test]
    fn zombie_slots_reclaimed_after_grace() {
        let ch = channel();
        // Simulate a dead client: claim a slot and stamp a pid that cannot
        // be alive.
        let slot = &ch.slots[0];
        slot.state.store(STATE_D_OWN, Ordering::Release);
        slot.owner_pid.store(0, Ordering::Release);
        *slot.claimed_at.lock() = Some(Instant::now() - Duration::from_secs(60));

        assert_eq!(ch.reclaim_dead_slots(Duration::from_secs(30)), 1);
        assert_eq!(slot.state.load(Ordering::Acquire), STATE_FREE);

        // A live claim is not swept.
        let slot = &ch.slots[1];
        slot.state.store(STATE_D_OWN, Ordering::Release);
        slot.owner_pid.store(std::process::id(), Ordering::Release);
        *slot.claimed_at.lock() = Some(Instant::now());
        assert_eq!(ch.reclaim_dead_slots(Duration::from_secs(30)), 0);
    }

    #[test]
    fn abort_releases_owned_slots() {
        let ch = channel();
        let pid = 4_000_000;
        for idx in [0, 3, 5] {
            let slot = &ch.slots[idx];
            slot.state.store(STATE_D_OWN, Ordering::Release);
            slot.owner_pid.store(pid, Ordering::Release);
        }
        assert_eq!(ch.abort_requests(pid), 3);
        assert_eq!(ch.abort_requests(pid), 0);
    }

    #[test]
    fn errno_round_trip() {
        for err in [
            PbfsError::Again,
            PbfsError::NoSpace,
            PbfsError::Exists,
            PbfsError::Stale,
            PbfsError::TimedOut,
            PbfsError::NotSupported,
        ] {
            let errno = err.to_errno();
            let back = error_from_errno(errno);
            assert_eq!(back.to_errno(), errno);
        }
    }
}
