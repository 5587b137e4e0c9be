//! Transaction descriptor and barrier handle
//!
//! `TransactionDescriptor` is the per-thread record of the current attempt:
//! start timestamp, read log, write log and allocation record. It lives as
//! long as the thread context and is reset, not reallocated, on every begin.
//!
//! `Transaction` is the borrowed handle a transaction body works through.
//! Every shared read and write goes through its barriers.
//!
//! # Read-Your-Writes Semantics
//!
//! A read checks, in order:
//! 1. **write log**: returns this attempt's pending value, no read-log entry
//! 2. **heap**: consistent load under the location's ownership record,
//!    logged with the observed version
//!
//! # Lifecycle
//!
//! ```text
//! Inactive -> Active (begin) -> Committed | Aborted (end) -> Active (next begin)
//!                  \-> Aborted -> Active (restart)
//! ```

use crate::manager::TransactionManager;
use crate::metrics::ThreadStats;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use stm_core::{Addr, ConflictKind, StmError, StmResult, ThreadId, Word};

/// Status of a transaction descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No attempt has begun yet
    Inactive,
    /// Attempt is executing, can read and write
    Active,
    /// Attempt committed
    Committed,
    /// Attempt was abandoned
    Aborted,
}

/// One read-log entry: a location and the version observed when reading it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEntry {
    /// Location read
    pub addr: Addr,
    /// Version of the guarding record at read time
    pub version: u64,
}

// ============================================================================
// Allocation Record
// ============================================================================

/// Heap blocks allocated and freed by the current attempt
///
/// On commit, deferred frees are executed and allocations are kept. On abort,
/// allocations are returned to the heap and deferred frees are dropped.
/// Deferred frees form a set: releasing a block twice in one attempt frees it
/// once.
#[derive(Debug, Default)]
pub struct AllocationRecord {
    pub(crate) allocated: Vec<Addr>,
    pub(crate) deferred_frees: FxHashSet<Addr>,
}

impl AllocationRecord {
    /// Blocks allocated by this attempt, oldest first
    pub fn allocated(&self) -> &[Addr] {
        &self.allocated
    }

    /// Blocks this attempt will free at commit
    pub fn deferred_frees(&self) -> &FxHashSet<Addr> {
        &self.deferred_frees
    }

    /// Whether nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty() && self.deferred_frees.is_empty()
    }

    fn clear(&mut self) {
        self.allocated.clear();
        self.deferred_frees.clear();
    }
}

// ============================================================================
// Transaction Descriptor
// ============================================================================

/// Per-thread transaction state
#[derive(Debug)]
pub struct TransactionDescriptor {
    thread: ThreadId,
    status: TransactionStatus,
    start_version: u64,
    read_only: bool,
    serial: bool,
    doomed: Option<ConflictKind>,
    read_log: Vec<ReadEntry>,
    write_log: BTreeMap<Addr, u64>,
    pub(crate) allocations: AllocationRecord,
}

impl TransactionDescriptor {
    /// Create an inactive descriptor owned by `thread`
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            status: TransactionStatus::Inactive,
            start_version: 0,
            read_only: false,
            serial: false,
            doomed: None,
            read_log: Vec::new(),
            write_log: BTreeMap::new(),
            allocations: AllocationRecord::default(),
        }
    }

    /// Owning thread
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether an attempt is executing
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Panic unless an attempt is executing
    pub fn ensure_active(&self) {
        assert!(
            self.is_active(),
            "transactional access outside an active transaction (status {:?})",
            self.status
        );
    }

    /// Clock value sampled at begin
    pub fn start_version(&self) -> u64 {
        self.start_version
    }

    /// Whether the attempt was begun read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the attempt holds the exclusive serial gate
    pub fn is_serial(&self) -> bool {
        self.serial
    }

    /// Conflict already observed by this attempt, if any
    pub fn doomed(&self) -> Option<ConflictKind> {
        self.doomed
    }

    /// Reads logged so far
    pub fn read_log(&self) -> &[ReadEntry] {
        &self.read_log
    }

    /// Pending writes in address order
    pub fn write_log(&self) -> &BTreeMap<Addr, u64> {
        &self.write_log
    }

    /// Allocation record of the current attempt
    pub fn allocations(&self) -> &AllocationRecord {
        &self.allocations
    }

    /// Start a fresh attempt, keeping log capacity
    ///
    /// Panics if an attempt is already active: transactions do not nest.
    pub fn reset(&mut self, start_version: u64, read_only: bool, serial: bool) {
        assert!(
            !self.is_active(),
            "nested transaction: begin while an attempt is active on {}",
            self.thread
        );
        self.read_log.clear();
        self.write_log.clear();
        self.allocations.clear();
        self.doomed = None;
        self.start_version = start_version;
        self.read_only = read_only;
        self.serial = serial;
        self.status = TransactionStatus::Active;
    }

    /// Pending value written by this attempt
    #[inline]
    pub fn pending(&self, addr: Addr) -> Option<u64> {
        self.write_log.get(&addr).copied()
    }

    /// Append to the read log
    #[inline]
    pub fn record_read(&mut self, addr: Addr, version: u64) {
        self.read_log.push(ReadEntry { addr, version });
    }

    /// Buffer a write; the last write to a location wins
    pub fn buffer_write(&mut self, addr: Addr, value: u64) {
        self.ensure_active();
        assert!(
            !self.read_only,
            "write to {} inside a read-only transaction",
            addr
        );
        self.write_log.insert(addr, value);
    }

    /// Remember a conflict so the attempt cannot commit
    pub fn doom(&mut self, kind: ConflictKind) {
        self.doomed.get_or_insert(kind);
    }

    /// Active -> Committed
    pub fn mark_committed(&mut self) {
        self.ensure_active();
        self.allocations.clear();
        self.status = TransactionStatus::Committed;
    }

    /// Active -> Aborted, discarding the logs
    pub fn mark_aborted(&mut self) {
        self.ensure_active();
        self.read_log.clear();
        self.write_log.clear();
        self.allocations.clear();
        self.status = TransactionStatus::Aborted;
    }
}

// ============================================================================
// Transaction handle (barrier layer)
// ============================================================================

/// Handle to the active attempt of one thread
///
/// Obtained from `ThreadContext::begin` or passed to an `atomically` body.
/// Dropping a handle whose attempt is still active aborts the attempt.
///
/// # Example
///
/// ```ignore
/// let total = ctx.atomically(|tx| {
///     let balance = tx.read_i64(account)?;
///     tx.write_i64(account, balance + 10);
///     Ok(balance + 10)
/// })?;
/// ```
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    desc: &'a mut TransactionDescriptor,
    stats: &'a mut ThreadStats,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        manager: &'a TransactionManager,
        desc: &'a mut TransactionDescriptor,
        stats: &'a mut ThreadStats,
        read_only: bool,
        serial: bool,
    ) -> Self {
        manager.begin(desc, read_only, serial);
        stats.record_start();
        if serial {
            stats.record_serial();
        }
        Transaction {
            manager,
            desc,
            stats,
        }
    }

    // === Read barriers ===

    /// Read one word
    pub fn read<W: Word>(&mut self, addr: Addr) -> StmResult<W> {
        self.manager.read(self.desc, addr).map(W::from_word)
    }

    /// Read a raw word
    pub fn read_word(&mut self, addr: Addr) -> StmResult<u64> {
        self.read(addr)
    }

    /// Read a signed integer
    pub fn read_i64(&mut self, addr: Addr) -> StmResult<i64> {
        self.read(addr)
    }

    /// Read a heap pointer
    pub fn read_addr(&mut self, addr: Addr) -> StmResult<Addr> {
        self.read(addr)
    }

    /// Read a float
    pub fn read_f64(&mut self, addr: Addr) -> StmResult<f64> {
        self.read(addr)
    }

    /// Read a flag
    pub fn read_bool(&mut self, addr: Addr) -> StmResult<bool> {
        self.read(addr)
    }

    // === Write barriers ===

    /// Write one word; visible to other threads only after commit
    pub fn write<W: Word>(&mut self, addr: Addr, value: W) {
        self.desc.buffer_write(addr, value.into_word());
    }

    /// Write a raw word
    pub fn write_word(&mut self, addr: Addr, value: u64) {
        self.write(addr, value);
    }

    /// Write a signed integer
    pub fn write_i64(&mut self, addr: Addr, value: i64) {
        self.write(addr, value);
    }

    /// Write a heap pointer
    pub fn write_addr(&mut self, addr: Addr, value: Addr) {
        self.write(addr, value);
    }

    /// Write a float
    pub fn write_f64(&mut self, addr: Addr, value: f64) {
        self.write(addr, value);
    }

    /// Write a flag
    pub fn write_bool(&mut self, addr: Addr, value: bool) {
        self.write(addr, value);
    }

    // === Allocation ===

    /// Allocate a block of `words` words
    ///
    /// The block is returned to the heap if this attempt aborts. Its contents
    /// are unspecified until written.
    pub fn allocate(&mut self, words: usize) -> StmResult<Addr> {
        self.manager.allocate(self.desc, words)
    }

    /// Free a block once this attempt commits
    pub fn deallocate(&mut self, addr: Addr) {
        self.manager.deallocate(self.desc, addr);
    }

    // === Control ===

    /// Error that makes the enclosing retry loop re-execute the body
    ///
    /// ```ignore
    /// if seats == 0 {
    ///     return tx.retry();
    /// }
    /// ```
    pub fn retry<T>(&self) -> StmResult<T> {
        Err(StmError::restart())
    }

    /// Abandon the current attempt and start over with a fresh timestamp
    ///
    /// For callers driving `begin`/`end` by hand; `atomically` bodies should
    /// return `retry()` instead.
    pub fn restart(&mut self) {
        self.abandon(&StmError::restart());
        let (read_only, serial) = (self.desc.is_read_only(), self.desc.is_serial());
        self.manager.begin(self.desc, read_only, serial);
        self.stats.record_start();
    }

    /// Commit the attempt
    ///
    /// # Returns
    /// - `Ok(commit_version)` on success (the start version for commits
    ///   that installed nothing)
    /// - `Err(StmError::Conflict)` if the attempt had to be aborted
    pub fn end(mut self) -> StmResult<u64> {
        self.commit()
    }

    pub(crate) fn commit(&mut self) -> StmResult<u64> {
        match self.manager.commit(self.desc) {
            Ok(outcome) => {
                self.stats.record_commit(outcome.writes == 0);
                Ok(outcome.version)
            }
            Err(e) => {
                self.stats.record_failure(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn abandon(&mut self, err: &StmError) {
        if self.desc.is_active() {
            self.manager.abort(self.desc);
            self.stats.record_failure(err);
        }
    }

    // === Introspection ===

    /// Clock value this attempt started from
    pub fn start_version(&self) -> u64 {
        self.desc.start_version()
    }

    /// Whether the attempt is read-only
    pub fn is_read_only(&self) -> bool {
        self.desc.is_read_only()
    }

    /// Whether the attempt runs in serial mode
    pub fn is_serial(&self) -> bool {
        self.desc.is_serial()
    }

    /// Number of logged reads
    pub fn read_count(&self) -> usize {
        self.desc.read_log().len()
    }

    /// Number of distinct locations written
    pub fn write_count(&self) -> usize {
        self.desc.write_log().len()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.desc.is_active() {
            self.manager.abort(self.desc);
            self.stats.record_abandoned();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("thread", &self.desc.thread())
            .field("start_version", &self.desc.start_version())
            .field("read_only", &self.desc.is_read_only())
            .field("reads", &self.read_count())
            .field("writes", &self.write_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TransactionDescriptor {
        TransactionDescriptor::new(ThreadId::new(1))
    }

    #[test]
    fn test_new_descriptor_is_inactive() {
        let desc = descriptor();
        assert_eq!(desc.status(), TransactionStatus::Inactive);
        assert!(!desc.is_active());
        assert!(desc.allocations().is_empty());
    }

    #[test]
    fn test_reset_activates_and_clears() {
        let mut desc = descriptor();
        desc.reset(4, false, false);
        desc.record_read(Addr::new(1), 3);
        desc.buffer_write(Addr::new(2), 9);
        desc.doom(ConflictKind::ExplicitRestart);
        desc.mark_aborted();

        desc.reset(7, false, false);
        assert!(desc.is_active());
        assert_eq!(desc.start_version(), 7);
        assert!(desc.read_log().is_empty());
        assert!(desc.write_log().is_empty());
        assert_eq!(desc.doomed(), None);
    }

    #[test]
    fn test_last_write_wins() {
        let mut desc = descriptor();
        desc.reset(0, false, false);
        desc.buffer_write(Addr::new(5), 1);
        desc.buffer_write(Addr::new(5), 2);
        assert_eq!(desc.pending(Addr::new(5)), Some(2));
        assert_eq!(desc.write_log().len(), 1);
    }

    #[test]
    fn test_write_log_is_address_ordered() {
        let mut desc = descriptor();
        desc.reset(0, false, false);
        for addr in [9, 2, 7, 4] {
            desc.buffer_write(Addr::new(addr), addr);
        }
        let order: Vec<u64> = desc.write_log().keys().map(|a| a.index()).collect();
        assert_eq!(order, vec![2, 4, 7, 9]);
    }

    #[test]
    fn test_first_doom_sticks() {
        let mut desc = descriptor();
        desc.reset(0, false, false);
        desc.doom(ConflictKind::ReadInconsistent { addr: Addr::new(1) });
        desc.doom(ConflictKind::ExplicitRestart);
        assert_eq!(
            desc.doomed(),
            Some(ConflictKind::ReadInconsistent { addr: Addr::new(1) })
        );
    }

    #[test]
    fn test_commit_transition() {
        let mut desc = descriptor();
        desc.reset(0, false, false);
        desc.mark_committed();
        assert_eq!(desc.status(), TransactionStatus::Committed);
        desc.reset(1, true, false);
        assert!(desc.is_read_only());
    }

    #[test]
    #[should_panic(expected = "nested transaction")]
    fn test_nested_begin_panics() {
        let mut desc = descriptor();
        desc.reset(0, false, false);
        desc.reset(0, false, false);
    }

    #[test]
    #[should_panic(expected = "read-only transaction")]
    fn test_write_in_read_only_panics() {
        let mut desc = descriptor();
        desc.reset(0, true, false);
        desc.buffer_write(Addr::new(1), 1);
    }

    #[test]
    #[should_panic(expected = "outside an active transaction")]
    fn test_write_outside_transaction_panics() {
        let mut desc = descriptor();
        desc.buffer_write(Addr::new(1), 1);
    }
}
