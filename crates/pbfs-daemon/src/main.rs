#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use pbfs_channel::Channel;
use pbfs_core::{Environment, MountOptions, Pbfs};
use pbfs_daemon::{Daemon, DispatcherConfig};
use pbfs_dev::FileDevice;
use pbfs_types::HostId;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pbfsd", about = "PBFS daemon — serves library clients over request channels")]
struct Cli {
    /// Run in the foreground (default).
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Daemonize after startup.
    #[arg(short = 'd', long, conflicts_with = "foreground")]
    daemonize: bool,

    /// Worker threads.
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Poller threads.
    #[arg(short = 'r', long, default_value_t = 1)]
    pollers: usize,

    /// PBD name to serve.
    #[arg(short = 'p', long)]
    pbd: String,

    /// Host id of this server.
    #[arg(short = 'e', long, default_value_t = 0)]
    server_id: u32,

    /// Directory for channel shm objects.
    #[arg(short = 'a', long, default_value = "/dev/shm")]
    shm_dir: PathBuf,

    /// Log configuration file holding a tracing filter; reloaded on SIGHUP.
    #[arg(short = 'c', long)]
    log_cfg: Option<PathBuf>,

    /// Auto-increase the fencing epoch when remounting (usurp stale leases).
    #[arg(short = 'q', long)]
    auto_increase_epoch: bool,

    /// Backing block device or image file.
    #[arg(short = 'D', long)]
    device: PathBuf,

    /// Directory for hostid lock files.
    #[arg(long, default_value = "/var/run/pbfs")]
    run_dir: PathBuf,

    /// Mount read-only (follower).
    #[arg(long)]
    read_only: bool,

    /// Device sector size in bytes.
    #[arg(long, default_value_t = 512)]
    sector_size: u32,

    /// Bounded sleep between empty worker polls, in microseconds.
    #[arg(long, default_value_t = 200)]
    usleep: u64,
}

fn read_filter(path: Option<&PathBuf>) -> EnvFilter {
    let spec = path
        .and_then(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "info".to_owned());
    EnvFilter::try_new(&spec).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() {
    if let Err(error) = run() {
        eprintln!("pbfsd: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let (filter, reload_handle) = reload::Layer::new(read_filter(cli.log_cfg.as_ref()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.daemonize {
        // Detaching would orphan the shared request rings; serve in the
        // foreground under a supervisor instead.
        bail!("daemonize mode is not supported; run under a process supervisor with -f");
    }

    let dev = Arc::new(
        FileDevice::open(&cli.device, cli.sector_size)
            .with_context(|| format!("open device {}", cli.device.display()))?,
    );

    let env = Environment::new(&cli.run_dir);
    env.mount(
        &cli.pbd,
        dev,
        MountOptions {
            host_id: HostId(cli.server_id),
            read_write: !cli.read_only,
            force_epoch: cli.auto_increase_epoch,
            ..MountOptions::default()
        },
    )
    .with_context(|| format!("mount {}", cli.pbd))?;
    let pbfs = Arc::new(Pbfs::new(env));

    let channel = Arc::new(Channel::new(&cli.shm_dir, &cli.pbd, 1));
    info!(
        target: "pbfsd",
        event = "serving",
        pbd = %cli.pbd,
        channel = channel.shm_path(),
        workers = cli.workers,
        rw = !cli.read_only
    );

    let daemon = Daemon::start(
        Arc::clone(&pbfs),
        cli.pbd.clone(),
        vec![channel],
        DispatcherConfig {
            workers: cli.workers,
            pollers: cli.pollers,
            poll_sleep: Duration::from_micros(cli.usleep),
            ..DispatcherConfig::default()
        },
    );

    // SIGINT/SIGTERM stop gracefully; SIGHUP reloads the log filter.
    // SIGPIPE is ignored by the Rust runtime already.
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).context("install signal handlers")?;
    for signal in signals.forever() {
        match signal {
            SIGHUP => {
                let fresh = read_filter(cli.log_cfg.as_ref());
                if reload_handle.reload(fresh).is_ok() {
                    info!(target: "pbfsd", event = "log_config_reloaded");
                } else {
                    warn!(target: "pbfsd", event = "log_config_reload_failed");
                }
            }
            _ => {
                info!(target: "pbfsd", event = "stopping", signal);
                break;
            }
        }
    }

    daemon.shutdown();
    pbfs.env().umount(&cli.pbd, false)?;
    Ok(())
}
