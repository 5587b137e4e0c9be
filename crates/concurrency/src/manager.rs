//! Transaction manager: barriers and the commit protocol
//!
//! Owns the shared engine state (version clock, ownership records, heap and
//! serial gate) and implements everything a descriptor does against it.
//!
//! Per the serializability invariant:
//! - All-or-nothing commit: an attempt's writes are installed together or not at all
//! - Every read of an attempt is consistent with its start timestamp
//! - Commit order equals clock-advance order
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. take the serial gate's shared side (skipped by serial attempts)
//! 2. lock the record of every written location, in address order
//! 3. IF a lock is busy: release acquired records, abort
//! 4. commit_version = clock.advance()
//! 5. validate the read log (skipped if nobody committed since begin)
//! 6. IF invalid: release acquired records, abort
//! 7. install pending values
//! 8. stamp commit_version on every acquired record and unlock it
//! 9. execute deferred frees, mark committed
//! ```
//!
//! An attempt with an empty write log runs step 5 only: no locks, no clock
//! advance.

use crate::clock::VersionClock;
use crate::config::StmConfig;
use crate::heap::Heap;
use crate::orec::OrecTable;
use crate::transaction::TransactionDescriptor;
use crate::validation::validate_read_log;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use stm_core::{Addr, ConflictKind, StmError, StmResult};
use tracing::trace;

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Commit version, or the start version for write-free commits
    pub version: u64,
    /// Locations installed
    pub writes: usize,
}

/// Shared engine state and the protocol that runs against it
pub struct TransactionManager {
    clock: VersionClock,
    orecs: OrecTable,
    heap: Heap,
    /// Exclusive side held by serial attempts, shared side by committers
    gate: RwLock<()>,
}

impl TransactionManager {
    /// Create a manager sized by `config`
    pub fn new(config: &StmConfig) -> Self {
        TransactionManager {
            clock: VersionClock::new(0),
            orecs: OrecTable::new(config.orec_bits),
            heap: Heap::new(config.heap_segment_bits, config.heap_segments),
            gate: RwLock::new(()),
        }
    }

    /// Global version clock
    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }

    /// Ownership-record table
    pub fn orecs(&self) -> &OrecTable {
        &self.orecs
    }

    /// Transactional heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Gate that serial-mode attempts hold exclusively
    pub fn serial_gate(&self) -> &RwLock<()> {
        &self.gate
    }

    /// Begin an attempt on `desc`
    pub fn begin(&self, desc: &mut TransactionDescriptor, read_only: bool, serial: bool) {
        desc.reset(self.clock.sample(), read_only, serial);
        trace!(
            target: "stm::txn",
            thread = %desc.thread(),
            start_version = desc.start_version(),
            read_only,
            serial,
            "begin"
        );
    }

    /// Read barrier
    ///
    /// # Errors
    /// `StmError::Conflict` if the location is being committed by another
    /// thread, changed during the load, or is newer than the attempt's
    /// snapshot. The descriptor is doomed either way.
    pub fn read(&self, desc: &mut TransactionDescriptor, addr: Addr) -> StmResult<u64> {
        desc.ensure_active();
        if let Some(value) = desc.pending(addr) {
            return Ok(value);
        }

        let record = self.orecs.for_addr(addr);
        let before = record.snapshot();
        let value = self.heap.word(addr).load(Ordering::Acquire);
        let after = record.snapshot();

        let conflict = if before.is_locked() {
            Some(ConflictKind::LockedOnRead { addr })
        } else if before != after {
            Some(ConflictKind::ReadInconsistent { addr })
        } else if before.version() > desc.start_version() {
            Some(ConflictKind::StaleRead {
                addr,
                version: before.version(),
                start_version: desc.start_version(),
            })
        } else {
            None
        };

        match conflict {
            Some(kind) => {
                trace!(target: "stm::txn", thread = %desc.thread(), conflict = kind.label(), %addr, "read conflict");
                desc.doom(kind);
                Err(kind.into())
            }
            None => {
                desc.record_read(addr, before.version());
                Ok(value)
            }
        }
    }

    /// Allocate a block owned by the attempt until it commits
    pub fn allocate(&self, desc: &mut TransactionDescriptor, words: usize) -> StmResult<Addr> {
        desc.ensure_active();
        let addr = self.heap.allocate(words)?;
        desc.allocations.allocated.push(addr);
        trace!(target: "stm::heap", thread = %desc.thread(), %addr, words, "transactional allocate");
        Ok(addr)
    }

    /// Schedule a block to be freed when the attempt commits
    pub fn deallocate(&self, desc: &mut TransactionDescriptor, addr: Addr) {
        desc.ensure_active();
        assert!(
            !desc.is_read_only(),
            "deallocate of {} inside a read-only transaction",
            addr
        );
        assert!(!addr.is_null(), "deallocate of the null address");
        desc.allocations.deferred_frees.insert(addr);
    }

    /// Commit the attempt, or abort it and report why
    pub fn commit(&self, desc: &mut TransactionDescriptor) -> StmResult<CommitOutcome> {
        desc.ensure_active();
        if let Some(kind) = desc.doomed() {
            self.abort(desc);
            return Err(kind.into());
        }
        if desc.write_log().is_empty() {
            return self.commit_read_only(desc);
        }

        let me = desc.thread();
        let shared = if desc.is_serial() {
            None
        } else {
            Some(self.gate.read())
        };

        // Lock phase
        let mut acquired: SmallVec<[usize; 16]> = SmallVec::new();
        let mut busy = None;
        for &addr in desc.write_log().keys() {
            let index = self.orecs.index_of(addr);
            if !self.orecs.get(index).try_lock(me) {
                busy = Some(addr);
                break;
            }
            // words sharing a stripe lock it once
            if !acquired.contains(&index) {
                acquired.push(index);
            }
        }
        if let Some(addr) = busy {
            self.release(&acquired);
            trace!(target: "stm::commit", thread = %me, %addr, "lock busy");
            self.abort(desc);
            return Err(ConflictKind::LockBusy { addr }.into());
        }

        let commit_version = self.clock.advance();

        // Validation phase. If the clock moved by exactly our own advance,
        // no other commit happened since begin and every read is still current.
        if commit_version != desc.start_version() + 1 {
            if let Some(kind) = validate_read_log(desc.read_log(), &self.orecs, me) {
                self.release(&acquired);
                trace!(target: "stm::commit", thread = %me, conflict = kind.label(), "validation failed");
                self.abort(desc);
                return Err(kind.into());
            }
        }

        // Install phase
        for (&addr, &value) in desc.write_log() {
            self.heap.word(addr).store(value, Ordering::Release);
        }
        for &index in &acquired {
            self.orecs.get(index).set_version_and_unlock(commit_version);
        }
        drop(shared);

        let writes = desc.write_log().len();
        for addr in desc.allocations.deferred_frees.drain() {
            self.heap.free(addr);
        }
        desc.mark_committed();
        trace!(target: "stm::commit", thread = %me, commit_version, writes, "committed");
        Ok(CommitOutcome {
            version: commit_version,
            writes,
        })
    }

    fn commit_read_only(&self, desc: &mut TransactionDescriptor) -> StmResult<CommitOutcome> {
        if let Some(kind) = validate_read_log(desc.read_log(), &self.orecs, desc.thread()) {
            self.abort(desc);
            return Err(kind.into());
        }
        for addr in desc.allocations.deferred_frees.drain() {
            self.heap.free(addr);
        }
        let version = desc.start_version();
        desc.mark_committed();
        Ok(CommitOutcome { version, writes: 0 })
    }

    /// Abort the attempt: release its allocations and discard its logs
    pub fn abort(&self, desc: &mut TransactionDescriptor) {
        desc.ensure_active();
        // Reverse order so a retry pops the same addresses in the same order
        for addr in desc.allocations.allocated.drain(..).rev() {
            self.heap.free(addr);
        }
        desc.allocations.deferred_frees.clear();
        desc.mark_aborted();
        trace!(target: "stm::txn", thread = %desc.thread(), "aborted");
    }

    fn release(&self, acquired: &[usize]) {
        for &index in acquired {
            self.orecs.get(index).unlock();
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("clock", &self.clock.sample())
            .field("orecs", &self.orecs)
            .field("heap", &self.heap)
            .finish()
    }
}
