//! Runtime and per-thread contexts
//!
//! `StmRuntime` is created once per process (or per test) and shared through
//! an `Arc`. Each worker thread registers with `thread_enter`, receives a
//! `ThreadContext` that owns its transaction descriptor, and runs
//! transactions through it. When the context is dropped the thread is
//! unregistered and its counters are folded into the runtime metrics.
//!
//! ## Retry loop
//!
//! ```text
//! loop {
//!     [serial gate, if the contention manager says so]
//!     begin -> body -> commit
//!     Ok                  => return
//!     Err(Conflict)       => abort, back off, loop
//!     Err(anything else)  => abort, return the error
//! }
//! ```

use crate::config::StmConfig;
use crate::contention::ContentionManager;
use crate::heap::{Heap, HeapStats};
use crate::manager::TransactionManager;
use crate::metrics::{MetricsCollector, ThreadStats, TransactionMetrics};
use crate::transaction::{Transaction, TransactionDescriptor};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stm_core::{StmResult, ThreadId};
use tracing::{debug, info, warn};

/// Bookkeeping for one registered thread
#[derive(Debug, Clone)]
pub struct ThreadRegistration {
    /// OS thread name at registration, if any
    pub name: Option<String>,
    /// When the thread registered
    pub registered_at: Instant,
}

/// The transactional memory runtime
///
/// # Example
///
/// ```ignore
/// let runtime = StmRuntime::startup(StmConfig::default())?;
/// let mut ctx = runtime.thread_enter();
/// let counter = ctx.atomically(|tx| tx.allocate(1))?;
/// ctx.atomically(|tx| {
///     let n = tx.read_i64(counter)?;
///     tx.write_i64(counter, n + 1);
///     Ok(())
/// })?;
/// drop(ctx);
/// let metrics = runtime.shutdown();
/// ```
pub struct StmRuntime {
    config: StmConfig,
    manager: TransactionManager,
    threads: DashMap<ThreadId, ThreadRegistration>,
    next_thread_id: AtomicU64,
    metrics: MetricsCollector,
    shut_down: AtomicBool,
}

impl StmRuntime {
    /// Validate `config` and build the shared engine state
    ///
    /// # Errors
    /// `StmError::InvalidConfig` if any config value is out of bounds.
    pub fn startup(config: StmConfig) -> StmResult<Arc<Self>> {
        config.validate()?;
        info!(
            target: "stm::runtime",
            orecs = 1usize << config.orec_bits,
            heap_words = config.heap_capacity_words(),
            serial_after = ?config.serial_after,
            "stm runtime starting"
        );
        Ok(Arc::new(StmRuntime {
            manager: TransactionManager::new(&config),
            config,
            threads: DashMap::new(),
            next_thread_id: AtomicU64::new(1),
            metrics: MetricsCollector::new(),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Stop accepting work and return the final metrics
    ///
    /// Panics if called twice. Threads still registered are reported and
    /// their counters are lost.
    pub fn shutdown(&self) -> TransactionMetrics {
        let already = self.shut_down.swap(true, Ordering::AcqRel);
        assert!(!already, "stm runtime shut down twice");
        if !self.threads.is_empty() {
            warn!(
                target: "stm::runtime",
                registered = self.threads.len(),
                "shutdown with threads still registered"
            );
        }
        let metrics = self.metrics.snapshot();
        info!(
            target: "stm::runtime",
            committed = metrics.total_committed,
            aborted = metrics.total_aborted,
            clock = self.manager.clock().sample(),
            "stm runtime shut down"
        );
        metrics
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) {
        assert!(!self.is_shut_down(), "stm runtime used after shutdown");
    }

    /// Register the calling thread
    pub fn thread_enter(self: &Arc<Self>) -> ThreadContext {
        self.ensure_running();
        let id = ThreadId::new(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let name = std::thread::current().name().map(str::to_owned);
        debug!(target: "stm::runtime", thread = %id, name = ?name, "thread registered");
        self.threads.insert(
            id,
            ThreadRegistration {
                name,
                registered_at: Instant::now(),
            },
        );
        ThreadContext {
            runtime: Arc::clone(self),
            id,
            state: ThreadState {
                desc: TransactionDescriptor::new(id),
                stats: ThreadStats::default(),
                contention: ContentionManager::new(
                    self.config.backoff,
                    self.config.serial_after,
                    id.as_u64(),
                ),
            },
            exited: false,
        }
    }

    /// Configuration the runtime was started with
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Engine state
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Transactional heap, for sequential setup and teardown
    pub fn heap(&self) -> &Heap {
        self.manager.heap()
    }

    /// Heap counters
    pub fn heap_stats(&self) -> HeapStats {
        self.manager.heap().stats()
    }

    /// Current value of the version clock
    pub fn clock_now(&self) -> u64 {
        self.manager.clock().sample()
    }

    /// Number of currently registered threads
    pub fn registered_threads(&self) -> usize {
        self.threads.len()
    }

    /// Registration details of a thread
    pub fn registration(&self, id: ThreadId) -> Option<ThreadRegistration> {
        self.threads.get(&id).map(|entry| entry.value().clone())
    }

    /// Metrics of every thread that has exited so far
    pub fn metrics(&self) -> TransactionMetrics {
        self.metrics.snapshot()
    }

    fn unregister(&self, id: ThreadId, stats: &ThreadStats) {
        self.metrics.absorb(stats);
        if self.threads.remove(&id).is_none() {
            warn!(target: "stm::runtime", thread = %id, "exit of an unregistered thread");
        }
        debug!(
            target: "stm::runtime",
            thread = %id,
            committed = stats.committed,
            aborted = stats.aborted(),
            "thread exited"
        );
    }
}

impl std::fmt::Debug for StmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StmRuntime")
            .field("config", &self.config)
            .field("threads", &self.threads.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ============================================================================
// Thread Context
// ============================================================================

#[derive(Debug)]
struct ThreadState {
    desc: TransactionDescriptor,
    stats: ThreadStats,
    contention: ContentionManager,
}

/// A registered thread's handle to the runtime
///
/// Holds the thread's transaction descriptor. Only one transaction can be
/// active per context at a time; the borrow checker enforces this for
/// handles obtained from `begin`.
#[derive(Debug)]
pub struct ThreadContext {
    runtime: Arc<StmRuntime>,
    id: ThreadId,
    state: ThreadState,
    exited: bool,
}

impl ThreadContext {
    /// Identity used as lock owner
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Runtime this context belongs to
    pub fn runtime(&self) -> &Arc<StmRuntime> {
        &self.runtime
    }

    /// Counters of this thread so far
    pub fn stats(&self) -> ThreadStats {
        self.state.stats
    }

    /// Begin a read-write transaction
    ///
    /// The caller drives commit with `Transaction::end` and handles conflicts
    /// itself; `atomically` does both.
    pub fn begin(&mut self) -> Transaction<'_> {
        self.begin_with(false)
    }

    /// Begin a read-only transaction
    ///
    /// Writes and deallocations inside it panic.
    pub fn begin_read_only(&mut self) -> Transaction<'_> {
        self.begin_with(true)
    }

    fn begin_with(&mut self, read_only: bool) -> Transaction<'_> {
        self.runtime.ensure_running();
        let state = &mut self.state;
        Transaction::begin(
            &self.runtime.manager,
            &mut state.desc,
            &mut state.stats,
            read_only,
            false,
        )
    }

    /// Run `body` as a read-write transaction until it commits
    ///
    /// Conflicts re-execute the body from the start with a fresh snapshot, so
    /// the body must not have side effects outside the transaction. Any other
    /// error aborts the attempt and is returned as is.
    pub fn atomically<T, F>(&mut self, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> StmResult<T>,
    {
        self.run(false, body)
    }

    /// Run `body` as a read-only transaction until it commits
    pub fn atomically_read_only<T, F>(&mut self, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> StmResult<T>,
    {
        self.run(true, body)
    }

    fn run<T, F>(&mut self, read_only: bool, mut body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction<'_>) -> StmResult<T>,
    {
        self.runtime.ensure_running();
        let runtime = Arc::clone(&self.runtime);
        let manager = &runtime.manager;

        loop {
            let serial = self.state.contention.should_serialize();
            let exclusive = if serial {
                debug!(
                    target: "stm::txn",
                    thread = %self.id,
                    failures = self.state.contention.consecutive_failures(),
                    "entering serial mode"
                );
                Some(manager.serial_gate().write())
            } else {
                None
            };

            let outcome = {
                let state = &mut self.state;
                let mut tx = Transaction::begin(
                    manager,
                    &mut state.desc,
                    &mut state.stats,
                    read_only,
                    serial,
                );
                match body(&mut tx) {
                    Ok(value) => tx.commit().map(|_| value),
                    Err(e) => {
                        tx.abandon(&e);
                        Err(e)
                    }
                }
            };
            drop(exclusive);

            match outcome {
                Ok(value) => {
                    self.state.contention.on_commit();
                    return Ok(value);
                }
                Err(e) if e.is_conflict() => {
                    self.state.contention.backoff();
                }
                Err(e) => {
                    self.state.contention.on_commit();
                    return Err(e);
                }
            }
        }
    }

    /// Unregister the thread and fold its counters into the runtime
    ///
    /// Also runs on drop.
    pub fn thread_exit(mut self) {
        self.exit();
    }

    fn exit(&mut self) {
        if !self.exited {
            self.exited = true;
            self.runtime.unregister(self.id, &self.state.stats);
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.exit();
    }
}
