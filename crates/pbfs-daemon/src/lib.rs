#![forbid(unsafe_code)]
//! Request dispatcher.
//!
//! The daemon owns the mount and serves library clients through channel
//! rings. N worker threads each poll a disjoint subset of slots with a
//! bounded sleep, decode the opcode, call into the core, and write the
//! response. A supervisor thread publishes the mount epoch, reclaims slots
//! abandoned by dead clients, and drives the follower's journal poll.

use pbfs_channel::{Channel, Request, Response};
use pbfs_core::Pbfs;
use pbfs_error::PbfsError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub pollers: usize,
    /// Sleep between empty polls of a worker's slot subset.
    pub poll_sleep: Duration,
    /// How long a dead client's slot is left alone before reclamation.
    pub zombie_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pollers: 1,
            poll_sleep: Duration::from_micros(200),
            zombie_grace: Duration::from_secs(30),
        }
    }
}

/// A running dispatcher; stops and joins on [`shutdown`](Self::shutdown).
pub struct Daemon {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(
        pbfs: Arc<Pbfs>,
        pbd: String,
        channels: Vec<Arc<Channel>>,
        config: DispatcherConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let workers = config.workers.max(1);
        for worker_id in 0..workers {
            let pbfs = Arc::clone(&pbfs);
            let channels = channels.clone();
            let stop = Arc::clone(&stop);
            let sleep = config.poll_sleep;
            let pbd = pbd.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("pbfsd-worker-{worker_id}"))
                    .spawn(move || {
                        worker_loop(&pbfs, &pbd, &channels, worker_id, workers, sleep, &stop);
                    })
                    .expect("spawn worker"),
            );
        }

        for poller_id in 0..config.pollers.max(1) {
            let pbfs = Arc::clone(&pbfs);
            let channels = channels.clone();
            let stop = Arc::clone(&stop);
            let pbd = pbd.clone();
            let grace = config.zombie_grace;
            threads.push(
                std::thread::Builder::new()
                    .name(format!("pbfsd-poller-{poller_id}"))
                    .spawn(move || supervisor_loop(&pbfs, &pbd, &channels, grace, &stop))
                    .expect("spawn poller"),
            );
        }

        info!(
            target: "pbfsd",
            event = "dispatcher_started",
            workers,
            pollers = config.pollers.max(1)
        );
        Self { stop, threads }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Signal every thread to stop and join them.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        for thread in self.threads {
            let _ = thread.join();
        }
        info!(target: "pbfsd", event = "dispatcher_stopped");
    }
}

fn worker_loop(
    pbfs: &Pbfs,
    pbd: &str,
    channels: &[Arc<Channel>],
    worker_id: usize,
    workers: usize,
    sleep: Duration,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        let mut busy = false;
        for channel in channels {
            for idx in (0..channel.slot_count()).filter(|idx| idx % workers == worker_id) {
                let Some((request, payload, client_epoch)) = channel.take_request(idx) else {
                    continue;
                };
                busy = true;
                let (response, data) = if matches!(request, Request::UpdateMeta) {
                    (Response::Epoch(channel.daemon_epoch()), Vec::new())
                } else if client_epoch != channel.daemon_epoch() {
                    debug!(
                        target: "pbfsd",
                        event = "stale_request",
                        slot = idx,
                        client_epoch,
                        daemon_epoch = channel.daemon_epoch()
                    );
                    (Response::Stale, Vec::new())
                } else {
                    dispatch(pbfs, pbd, request, payload)
                };
                channel.respond(idx, response, data);
            }
        }
        if !busy {
            std::thread::sleep(sleep);
        }
    }
}

fn supervisor_loop(
    pbfs: &Pbfs,
    pbd: &str,
    channels: &[Arc<Channel>],
    grace: Duration,
    stop: &AtomicBool,
) {
    let mut last_poll = std::time::Instant::now();
    while !stop.load(Ordering::Acquire) {
        if let Ok(mount) = pbfs.env().find_mount(pbd) {
            for channel in channels {
                channel.set_daemon_epoch(mount.mount_epoch());
            }
            if !mount.is_leader() && last_poll.elapsed() >= mount.poll_interval() {
                last_poll = std::time::Instant::now();
                if let Err(err) = mount.poll() {
                    warn!(
                        target: "pbfsd",
                        event = "follower_poll_failed",
                        error = %err
                    );
                }
            }
        }
        for channel in channels {
            channel.reclaim_dead_slots(grace);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn ok_or_errno<T>(result: Result<T, PbfsError>, map: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => map(value),
        Err(err) => Response::from_err(&err),
    }
}

/// Decode one request into the matching core call.
pub fn dispatch(pbfs: &Pbfs, pbd: &str, request: Request, payload: Vec<u8>) -> (Response, Vec<u8>) {
    match request {
        Request::Open { path, oflags } => (ok_or_errno(pbfs.open(&path, oflags), Response::Fd), Vec::new()),
        Request::Close { fd } => (ok_or_errno(pbfs.close(fd), |()| Response::Unit), Vec::new()),
        Request::Read { fd, len } => {
            let mut buf = vec![0_u8; len as usize];
            match pbfs.read(fd, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    (Response::Size(n as u64), buf)
                }
                Err(err) => (Response::from_err(&err), Vec::new()),
            }
        }
        Request::Pread { fd, len, offset } => {
            let mut buf = vec![0_u8; len as usize];
            match pbfs.pread(fd, &mut buf, offset) {
                Ok(n) => {
                    buf.truncate(n);
                    (Response::Size(n as u64), buf)
                }
                Err(err) => (Response::from_err(&err), Vec::new()),
            }
        }
        Request::Write { fd } => (
            ok_or_errno(pbfs.write(fd, &payload), |n| Response::Size(n as u64)),
            Vec::new(),
        ),
        Request::Pwrite { fd, offset } => (
            ok_or_errno(pbfs.pwrite(fd, &payload, offset), |n| Response::Size(n as u64)),
            Vec::new(),
        ),
        Request::Lseek { fd, offset, whence } => (
            ok_or_errno(pbfs.lseek(fd, offset, whence), Response::Size),
            Vec::new(),
        ),
        Request::Ftruncate { fd, len } => {
            (ok_or_errno(pbfs.ftruncate(fd, len), |()| Response::Unit), Vec::new())
        }
        Request::Truncate { path, len } => {
            (ok_or_errno(pbfs.truncate(&path, len), |()| Response::Unit), Vec::new())
        }
        Request::Fallocate { fd, mode, offset, len } => (
            ok_or_errno(pbfs.fallocate(fd, mode, offset, len), |()| Response::Unit),
            Vec::new(),
        ),
        Request::Stat { path } => (ok_or_errno(pbfs.stat(&path), Response::Stat), Vec::new()),
        Request::Fstat { fd } => (ok_or_errno(pbfs.fstat(fd), Response::Stat), Vec::new()),
        Request::Statfs { path } => (ok_or_errno(pbfs.statfs(&path), Response::StatFs), Vec::new()),
        Request::Unlink { path } => {
            (ok_or_errno(pbfs.unlink(&path), |()| Response::Unit), Vec::new())
        }
        Request::Mkdir { path } => (ok_or_errno(pbfs.mkdir(&path), |()| Response::Unit), Vec::new()),
        Request::Rmdir { path } => (ok_or_errno(pbfs.rmdir(&path), |()| Response::Unit), Vec::new()),
        Request::Rename { src, dst, noreplace } => {
            let result = if noreplace {
                pbfs.rename_noreplace(&src, &dst)
            } else {
                pbfs.rename(&src, &dst)
            };
            (ok_or_errno(result, |()| Response::Unit), Vec::new())
        }
        Request::Opendir { path } => (ok_or_errno(pbfs.opendir(&path), Response::Fd), Vec::new()),
        Request::Readdir { dir } => (ok_or_errno(pbfs.readdir(dir), Response::Dirent), Vec::new()),
        Request::Closedir { dir } => {
            (ok_or_errno(pbfs.closedir(dir), |()| Response::Unit), Vec::new())
        }
        Request::Chdir { path } => (ok_or_errno(pbfs.chdir(&path), |()| Response::Unit), Vec::new()),
        Request::Getcwd => (Response::Cwd(pbfs.getcwd()), Vec::new()),
        Request::Access { path } => {
            (ok_or_errno(pbfs.access(&path), |()| Response::Unit), Vec::new())
        }
        Request::Fsync { fd } => (ok_or_errno(pbfs.fsync(fd), |()| Response::Unit), Vec::new()),
        Request::Fmap { fd } => (ok_or_errno(pbfs.fmap(fd), Response::Fmap), Vec::new()),
        Request::Growfs => (
            ok_or_errno(pbfs.env().growfs(pbd), |chunks| {
                Response::Size(u64::from(chunks))
            }),
            Vec::new(),
        ),
        // Answered by the worker loop with the live epoch; reaching here
        // means a test called dispatch directly.
        Request::UpdateMeta => (Response::Epoch(0), Vec::new()),
    }
}
