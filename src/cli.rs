//! Argument parser (C6): interprets the small flag vector this runtime
//! accepts into the configuration used by stage 2 (`conf_init`). Grounded
//! on `nxt_runtime_conf_read_cmd`, rendered with `clap`'s derive API the
//! way the teacher's own `cli.rs` renders its flag set.

use clap::Parser;
use eyre::{eyre, Result};

use crate::address::SocketAddress;

/// A process-supervisor runtime for a multi-process network service.
#[derive(Parser, Debug, Default)]
#[command(name = "nxtrtd")]
#[command(about = "Process-supervisor runtime: bootstraps sockets, forks workers, owns the pid file")]
#[command(version)]
pub struct Cli {
    /// Controller listen address, in the unix:/ipv6/ipv4 address grammar.
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream name passed through to the controller.
    #[arg(long)]
    pub upstream: Option<String>,

    /// Number of worker processes (must be >= 1).
    #[arg(long)]
    pub workers: Option<i64>,

    /// User to drop privileges to after bind.
    #[arg(long)]
    pub user: Option<String>,

    /// Group to drop privileges to after bind.
    #[arg(long)]
    pub group: Option<String>,

    /// Path to the pid file.
    #[arg(long)]
    pub pid: Option<String>,

    /// Path to the main error log.
    #[arg(long)]
    pub log: Option<String>,

    /// Disable daemonization (stay in the foreground).
    #[arg(long)]
    pub no_daemonize: bool,
}

/// Defaults applied before argument parsing, matching
/// `nxt_runtime_conf_init`'s hardcoded defaults in the source this is
/// grounded on.
#[derive(Debug, Clone)]
pub struct Config {
    pub controller_listen: Option<SocketAddress>,
    pub upstream: Option<String>,
    pub worker_processes: u32,
    pub user: String,
    pub group: Option<String>,
    pub pid: String,
    pub error_log: String,
    pub daemon: bool,
    pub master_process: bool,
    pub engine_connections: u32,
    pub auxiliary_threads: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_listen: None,
            upstream: None,
            worker_processes: 1,
            user: "nobody".to_string(),
            group: None,
            pid: "nginext.pid".to_string(),
            error_log: "error.log".to_string(),
            daemon: true,
            master_process: true,
            engine_connections: 256,
            auxiliary_threads: 2,
        }
    }
}

impl Config {
    /// Applies parsed flags over the defaults. `clap` already rejects
    /// unrecognized flags and flags missing their required argument before
    /// this function runs; `--workers 0` (or negative) is this function's
    /// own check, matching `nxt_runtime_conf_read_cmd`'s `n < 1` guard.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = Config::default();

        if let Some(listen) = cli.listen {
            let sa = SocketAddress::parse(&listen)
                .ok_or_else(|| eyre!("invalid --listen address: \"{}\"", listen))?;
            config.controller_listen = Some(sa);
        }

        if let Some(upstream) = cli.upstream {
            config.upstream = Some(upstream);
        }

        if let Some(workers) = cli.workers {
            if workers < 1 {
                tracing::error!(workers, "invalid number of workers");
                return Err(eyre!("invalid number of workers: \"{}\"", workers));
            }
            config.worker_processes = workers as u32;
        }

        if let Some(user) = cli.user {
            config.user = user;
        }

        if let Some(group) = cli.group {
            config.group = Some(group);
        }

        if let Some(pid) = cli.pid {
            config.pid = pid;
        }

        if let Some(log) = cli.log {
            config.error_log = log;
        }

        if cli.no_daemonize {
            config.daemon = false;
        }

        Ok(config)
    }
}
