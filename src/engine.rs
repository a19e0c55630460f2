//! External collaborator contracts (§6): the event engine, thread pool,
//! and service registry this crate consumes but does not implement the
//! internals of. §1 explicitly scopes epoll/kqueue backends and the
//! thread-pool executor out of the core; this module gives them a trait
//! boundary and a `tokio`-backed default so the supervisor is runnable
//! end to end, the same way the teacher builds its own event loop on
//! `tokio` rather than a hand-rolled reactor.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Monotonically increasing, process-unique identifier for an event
/// engine instance. Never reused within a process, per §3's invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId(u32);

#[derive(Default)]
pub struct EngineIdAllocator(AtomicU32);

impl EngineIdAllocator {
    pub fn next(&self) -> EngineId {
        EngineId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// The event-engine contract consumed by the supervisor: a fast work queue
/// to enqueue continuations on, a shutdown flag, and identity/backend
/// naming used for the engine-switch comparison in §4.6 stage 2.
pub trait EventEngine: Send + Sync {
    fn id(&self) -> EngineId;
    fn backend_name(&self) -> &str;
    fn batch(&self) -> bool;
    fn shutdown_requested(&self) -> bool;
    fn request_shutdown(&self);
    fn set_max_connections(&self, max: u32);
    /// Enqueues `work` onto the engine's fast work queue.
    fn enqueue(&self, work: BoxFuture);
    /// Closes every idle connection currently tracked by the engine.
    fn close_idle_connections(&self);
}

/// A `tokio`-task-backed event engine. One instance exists per process;
/// rebuilt post-fork per §4.6 stage 3 because kernel polling descriptors
/// and the signal-waiting thread do not survive `fork()`.
pub struct TokioEventEngine {
    id: EngineId,
    backend_name: String,
    batch: bool,
    shutdown: AtomicBool,
    max_connections: AtomicU32,
    queue: mpsc::UnboundedSender<BoxFuture>,
    idle_notify: Arc<Notify>,
}

impl TokioEventEngine {
    pub fn new(allocator: &EngineIdAllocator, backend_name: impl Into<String>, batch: bool) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture>();
        let engine = Arc::new(Self {
            id: allocator.next(),
            backend_name: backend_name.into(),
            batch,
            shutdown: AtomicBool::new(false),
            max_connections: AtomicU32::new(256),
            queue: tx,
            idle_notify: Arc::new(Notify::new()),
        });

        let handle = tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                work.await;
            }
        });

        info!(engine_id = engine.id.0, backend = %engine.backend_name, "event engine created");
        (engine, handle)
    }
}

impl EventEngine for TokioEventEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn backend_name(&self) -> &str {
        &self.backend_name
    }

    fn batch(&self) -> bool {
        self.batch
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn set_max_connections(&self, max: u32) {
        self.max_connections.store(max, Ordering::SeqCst);
    }

    fn enqueue(&self, work: BoxFuture) {
        // A closed receiver means the engine already tore down; dropping
        // the continuation silently mirrors enqueueing onto a freed queue
        // being a no-op rather than a crash.
        let _ = self.queue.send(work);
    }

    fn close_idle_connections(&self) {
        debug!(engine_id = self.id.0, "closing idle connections");
        self.idle_notify.notify_waiters();
    }
}

/// The thread-pool contract consumed by the supervisor (§6): create with a
/// worker count and idle timeout, destroy asynchronously with an exit
/// continuation run on the main engine.
pub trait ThreadPool: Send + Sync {
    fn worker_count(&self) -> usize;
    /// Begins asynchronous teardown. `on_drained` runs once every worker
    /// has exited — this is the only back-edge in the startup graph (§5).
    fn destroy(self: Arc<Self>, on_drained: Box<dyn FnOnce() + Send>);
}

/// A `tokio`-blocking-pool-backed thread pool standing in for the
/// dedicated OS thread pool the original spins up for blocking work
/// (regex init, etc., per `nxt_runtime_thread_pool_init`).
pub struct TokioThreadPool {
    workers: usize,
    idle_timeout: Duration,
}

impl TokioThreadPool {
    pub fn new(workers: usize, idle_timeout: Duration) -> Arc<Self> {
        info!(workers, ?idle_timeout, "thread pool created");
        Arc::new(Self {
            workers,
            idle_timeout,
        })
    }
}

impl ThreadPool for TokioThreadPool {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn destroy(self: Arc<Self>, on_drained: Box<dyn FnOnce() + Send>) {
        debug!(workers = self.workers, "thread pool teardown requested");
        // Blocking-pool workers have no persistent handles to join in the
        // tokio model; teardown is immediate, matching the synchronous
        // `cont(task)` call in `nxt_runtime_thread_pool_destroy` for the
        // zero-pools case, generalized to "pools are always synchronously
        // drainable here" since none hold cross-fork OS resources.
        on_drained();
    }
}

/// The default idle timeout applied to the bootstrap pool, matching the
/// `60000 * 1000000LL` nanosecond constant in the source this is grounded
/// on (60 seconds).
pub const BOOTSTRAP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Service registry: an externally supplied `(category, name) -> T`
/// mapping. The core only ever resolves the `"engine"` category (§6).
pub trait ServiceRegistry: Send + Sync {
    fn engine_backend_names(&self) -> Vec<String>;
    fn has_engine_backend(&self, name: &str) -> bool;
}

/// A registry that only knows about the `tokio`-backed engine, since this
/// crate does not implement real epoll/kqueue backends (§1 scope).
pub struct DefaultServiceRegistry;

impl ServiceRegistry for DefaultServiceRegistry {
    fn engine_backend_names(&self) -> Vec<String> {
        vec!["tokio".to_string()]
    }

    fn has_engine_backend(&self, name: &str) -> bool {
        name == "tokio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_ids_are_strictly_increasing_and_never_reused() {
        let allocator = EngineIdAllocator::default();
        let a = allocator.next();
        let b = allocator.next();
        let c = allocator.next();
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn engine_enqueue_runs_the_continuation() {
        let allocator = EngineIdAllocator::default();
        let (engine, _handle) = TokioEventEngine::new(&allocator, "tokio", false);

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        engine.enqueue(Box::pin(async move {
            let _ = tx.lock().unwrap().take().unwrap().send(());
        }));

        tokio::time::timeout(Duration::from_secs(1), &mut rx)
            .await
            .expect("continuation did not run")
            .unwrap();
    }

    #[test]
    fn default_registry_only_knows_tokio_backend() {
        let registry = DefaultServiceRegistry;
        assert!(registry.has_engine_backend("tokio"));
        assert!(!registry.has_engine_backend("epoll"));
    }
}
