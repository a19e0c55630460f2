//! The supervisor (C7): builds the runtime object, drives the staged start
//! sequence, mediates fork, and owns teardown. Grounded on
//! `nxt_runtime_create`/`nxt_runtime_start`/`nxt_runtime_initial_start`/
//! `nxt_runtime_quit` in the source this crate is distilled from. The
//! teacher's own `run_main_loop` in `main.rs` already structures scinit as a
//! `select!` loop reacting to process exit, signals, and timers; this module
//! generalizes that shape into the four-stage/four-state machine below.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{eyre, Context, Result};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid as NixPid};
use tracing::{debug, error, info, warn};

use crate::cli::Config;
use crate::engine::{
    DefaultServiceRegistry, EngineIdAllocator, EventEngine, ServiceRegistry, ThreadPool,
    TokioEventEngine, TokioThreadPool, BOOTSTRAP_POOL_IDLE_TIMEOUT,
};
use crate::listen_socket;
use crate::log_file::LogFileTable;
use crate::pid_file::PidFile;
use crate::registry::{PortRegistry, ProcessRegistry};
use crate::signals::{Monitor, Signal};
use crate::socket_inheritance::{self, ListenSocket};

/// Which of the three shapes this process has taken, mirroring the
/// `rt->type` field the quit-time pid-file deletion check reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Single,
    Master,
    Worker,
}

/// The supervisor's state machine, matching §4.6's diagram exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Starting,
    ModulesInited,
    LogsOpened,
    EngineSwitched,
    Bootstrapped,
    MasterRunning,
    SingleRunning,
    Quitting,
    Drained,
    Exited,
}

const BOOTSTRAP_POOL_WORKERS: usize = 2;
const DEFAULT_ENGINE_CONNECTIONS: u32 = 256;
const HOST_NAME_MAX: usize = 64;

/// The process-wide state container. Owns its children directly rather than
/// through a manual arena: Rust's `Drop` already gives the same O(1) cascade
/// cleanup the original gets from freeing the arena in one call.
pub struct Runtime {
    pub prefix: PathBuf,
    pub hostname: String,
    pub inherited_sockets: Option<Vec<ListenSocket>>,
    pub listen_sockets: Vec<ListenSocket>,
    pub processes: ProcessRegistry,
    pub ports: PortRegistry,
    pub log_files: LogFileTable,
    pub pid_file: Option<PidFile>,
    pub role: ProcessRole,
    pub daemon: bool,
    pub engine_allocator: EngineIdAllocator,
}

impl Runtime {
    /// Resolves the current working directory into the always-trailing-slash
    /// `prefix`, matching `nxt_current_directory`.
    fn discover_prefix() -> Result<PathBuf> {
        let cwd = std::env::current_dir().wrap_err("resolving working directory")?;
        let mut text = cwd.to_string_lossy().into_owned();
        if !text.ends_with('/') {
            text.push('/');
        }
        Ok(PathBuf::from(text))
    }

    /// Discovers the local hostname, truncated to `HOST_NAME_MAX` and
    /// lowercased, matching the original's own truncate-then-lowercase
    /// ordering.
    fn discover_hostname() -> String {
        let raw = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                warn!(error = %e, "gethostname failed, using empty hostname");
                String::new()
            });

        let mut truncated: String = raw.chars().take(HOST_NAME_MAX).collect();
        truncated.make_ascii_lowercase();
        truncated
    }
}

/// Drives the four-stage startup sequence and subsequent run/quit cycle.
pub struct Supervisor {
    pub state: SupervisorState,
    pub runtime: Runtime,
    pub config: Config,
    pub engine: Arc<dyn EventEngine>,
    pub bootstrap_pool: Option<Arc<dyn ThreadPool>>,
    pub app_pool: Option<Arc<dyn ThreadPool>>,
    pub services: Arc<dyn ServiceRegistry>,
    shutting_down: Arc<AtomicBool>,
    workers: Vec<NixPid>,
}

impl Supervisor {
    /// Stage 1 (construct): allocates the runtime, resolves prefix and
    /// hostname, recovers inherited sockets (C2), preallocates the log-file
    /// table (C4), creates the bootstrap event engine and a 2-worker
    /// bootstrap thread pool.
    pub fn construct(config: Config) -> Result<Self> {
        let prefix = Runtime::discover_prefix()?;
        let hostname = Runtime::discover_hostname();
        let pid = std::process::id() as i32;
        let inherited_sockets = socket_inheritance::recover_inherited_sockets(pid);

        let services: Arc<dyn ServiceRegistry> = Arc::new(DefaultServiceRegistry);
        if !services.has_engine_backend("tokio") {
            return Err(eyre!("no \"tokio\" engine backend registered"));
        }

        let engine_allocator = EngineIdAllocator::default();
        let (engine, _handle) = TokioEventEngine::new(&engine_allocator, "tokio", false);

        let bootstrap_pool = TokioThreadPool::new(BOOTSTRAP_POOL_WORKERS, BOOTSTRAP_POOL_IDLE_TIMEOUT);

        let runtime = Runtime {
            prefix: prefix.clone(),
            hostname,
            inherited_sockets,
            listen_sockets: Vec::new(),
            processes: ProcessRegistry::new(),
            ports: PortRegistry::new(),
            log_files: LogFileTable::new(prefix),
            pid_file: None,
            role: ProcessRole::Single,
            daemon: config.daemon,
            engine_allocator,
        };

        info!(state = ?SupervisorState::Created, "runtime constructed");

        Ok(Self {
            state: SupervisorState::Starting,
            runtime,
            config,
            engine,
            bootstrap_pool: Some(bootstrap_pool),
            app_pool: None,
            services,
            shutting_down: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Stage 2 (start, on the event loop): resolves pid-file/log paths,
    /// materializes log files (C4), and switches the engine backend if the
    /// configured one differs — then destroys the bootstrap pool, handing
    /// stage 3 off as its continuation.
    pub async fn start(&mut self) -> Result<()> {
        self.runtime.log_files.set_main(&self.config.error_log);
        self.state = SupervisorState::ModulesInited;

        self.runtime
            .log_files
            .materialize()
            .wrap_err("materializing log files")?;
        self.state = SupervisorState::LogsOpened;

        // The configured backend is always "tokio" in this crate (§1: no
        // real epoll/kqueue backend), so the switch is a no-op identity
        // check rather than a real backend swap.
        if self.engine.backend_name() != "tokio" {
            return Err(eyre!("unknown engine backend requested"));
        }
        self.engine.set_max_connections(DEFAULT_ENGINE_CONNECTIONS);
        self.state = SupervisorState::EngineSwitched;

        if let Some(pool) = self.bootstrap_pool.take() {
            let (tx, rx) = tokio::sync::oneshot::channel();
            pool.destroy(Box::new(move || {
                let _ = tx.send(());
            }));
            rx.await.ok();
        }

        self.state = SupervisorState::Bootstrapped;
        Ok(())
    }

    /// Stage 3 (initial_start, possibly post-fork): daemonizes on a fresh
    /// start, rebuilds the event engine post-fork, creates the pid file,
    /// and either starts the master role (forking workers) or the single
    /// role (binding listen sockets directly).
    pub async fn initial_start(&mut self) -> Result<()> {
        let fresh_start = self.runtime.inherited_sockets.is_none();

        if fresh_start && self.runtime.daemon {
            self.daemonize()?;
            // Poll descriptors and the signal-waiting thread do not survive
            // fork; rebuild the engine on this side.
            let (engine, _handle) =
                TokioEventEngine::new(&self.runtime.engine_allocator, "tokio", false);
            self.engine = engine;
        }

        let pid = std::process::id() as i32;
        self.runtime.pid_file = Some(PidFile::create(&self.config.pid, pid)?);

        self.engine.set_max_connections(self.config.engine_connections);

        if self.config.master_process {
            self.runtime.role = ProcessRole::Master;
            self.start_master()?;
            // A forked worker returns from start_master with role switched
            // to Worker; only the process that stayed master reports
            // MasterRunning.
            if self.runtime.role == ProcessRole::Master {
                self.state = SupervisorState::MasterRunning;
            }
        } else {
            self.runtime.role = ProcessRole::Single;
            self.app_pool = Some(TokioThreadPool::new(
                self.config.auxiliary_threads as usize,
                BOOTSTRAP_POOL_IDLE_TIMEOUT,
            ));
            self.bind_listen_sockets()?;
            self.state = SupervisorState::SingleRunning;
        }

        Ok(())
    }

    fn bind_listen_sockets(&mut self) -> Result<()> {
        let configured: Vec<_> = self
            .config
            .controller_listen
            .iter()
            .cloned()
            .collect();
        let inherited = self.runtime.inherited_sockets.clone().unwrap_or_default();

        let sockets = listen_socket::reconcile(&configured, &inherited)?;
        let engine = Arc::clone(&self.engine);
        listen_socket::enable(&sockets, |ls| {
            debug!(address = %ls.sockaddr.text(), fd = ls.socket_fd, "listen socket enabled");
            let _ = &engine;
        });
        self.runtime.listen_sockets = sockets;
        Ok(())
    }

    /// Forks `worker_processes` children, registers each in the process
    /// registry as it's seen, and returns in the parent. Workers inherit
    /// the bound listen sockets via `fork()`'s fd-table duplication; no
    /// additional IPC is required to hand them over.
    fn start_master(&mut self) -> Result<()> {
        self.bind_listen_sockets()?;

        let master_pid = std::process::id() as i32;
        self.runtime.processes.get_or_new(master_pid);

        for _ in 0..self.config.worker_processes {
            match unsafe { fork() }.wrap_err("forking worker process")? {
                ForkResult::Parent { child } => {
                    info!(pid = child.as_raw(), "worker forked");
                    self.runtime.processes.get_or_new(child.as_raw());
                    self.workers.push(child);
                }
                ForkResult::Child => {
                    self.runtime.role = ProcessRole::Worker;
                    // Poll descriptors and the signal-waiting thread do not
                    // survive fork; rebuild the engine on this side, same as
                    // the daemonize fork above.
                    let (engine, _handle) =
                        TokioEventEngine::new(&self.runtime.engine_allocator, "tokio", false);
                    self.engine = engine;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn daemonize(&self) -> Result<()> {
        match unsafe { fork() }.wrap_err("daemonizing")? {
            ForkResult::Parent { .. } => {
                std::process::exit(0);
            }
            ForkResult::Child => {
                nix::unistd::setsid().wrap_err("starting new session")?;
                Ok(())
            }
        }
    }

    /// Runs until a termination signal or, for the master role, a worker
    /// that needs reaping. Returns once `quit` has driven the process to
    /// `Exited`.
    pub async fn run(mut self) -> Result<()> {
        let shutting_down = Arc::clone(&self.shutting_down);
        let mut monitor = Monitor::new();
        let mut signals = monitor.monitor()?;
        let is_master = self.runtime.role == ProcessRole::Master;

        loop {
            if shutting_down.load(Ordering::SeqCst) {
                break;
            }

            match signals.recv().await {
                Some(Signal::SIGCHLD) if is_master => {
                    self.reap_workers();
                }
                Some(sig @ (Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT)) => {
                    info!(?sig, "termination signal received");
                    break;
                }
                Some(sig) => {
                    debug!(?sig, "ignoring signal");
                }
                None => break,
            }
        }

        self.quit().await
    }

    fn reap_workers(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    info!(pid = pid.as_raw(), code, "worker exited");
                    self.runtime.processes.remove(pid.as_raw(), &self.runtime.ports);
                    self.workers.retain(|&w| w != pid);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!(pid = pid.as_raw(), signal = ?sig, "worker killed by signal");
                    self.runtime.processes.remove(pid.as_raw(), &self.runtime.ports);
                    self.workers.retain(|&w| w != pid);
                }
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Stage 4 (quit): idempotent. Sets the engine's shutdown flag, drains
    /// remaining thread pools, signals workers to stop if acting as master,
    /// closes idle connections, deletes the pid file for roles `<= master`,
    /// and returns once teardown is complete.
    pub async fn quit(&mut self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.state = SupervisorState::Quitting;
        self.engine.request_shutdown();

        if let Some(pool) = self.app_pool.take() {
            let (tx, rx) = tokio::sync::oneshot::channel();
            pool.destroy(Box::new(move || {
                let _ = tx.send(());
            }));
            rx.await.ok();
        }

        if self.runtime.role == ProcessRole::Master {
            for &pid in &self.workers {
                if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                    warn!(pid = pid.as_raw(), error = %e, "failed to signal worker");
                }
            }
            for &pid in &self.workers {
                let _ = waitpid(pid, None);
            }
        }

        self.engine.close_idle_connections();
        self.state = SupervisorState::Drained;

        if matches!(self.runtime.role, ProcessRole::Single | ProcessRole::Master) {
            if let Some(pid_file) = &self.runtime.pid_file {
                pid_file.remove()?;
            }
        }

        self.state = SupervisorState::Exited;
        info!("supervisor exited cleanly");
        Ok(())
    }
}
