//! Transaction metrics
//!
//! Each thread counts into a private `ThreadStats`; the counts are folded
//! into the runtime-wide `MetricsCollector` when the thread exits.
//!
//! # Memory Ordering
//!
//! The collector's counters use Relaxed ordering. They are observational only
//! and do not synchronize any other memory operations.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use stm_core::{ConflictKind, StmError};

const KINDS: usize = 6;

fn kind_index(kind: ConflictKind) -> usize {
    match kind {
        ConflictKind::LockedOnRead { .. } => 0,
        ConflictKind::StaleRead { .. } => 1,
        ConflictKind::ReadInconsistent { .. } => 2,
        ConflictKind::LockBusy { .. } => 3,
        ConflictKind::ValidationFailed { .. } => 4,
        ConflictKind::ExplicitRestart => 5,
    }
}

/// Abort counts broken down by cause
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortBreakdown {
    /// Read found the record locked by another thread
    pub locked_on_read: u64,
    /// Read found a version newer than the start timestamp
    pub stale_read: u64,
    /// Record changed while the word was being read
    pub read_inconsistent: u64,
    /// Commit could not lock a written location
    pub lock_busy: u64,
    /// Read-log validation failed at commit
    pub validation_failed: u64,
    /// Body asked for a restart
    pub explicit_restart: u64,
    /// Attempt left the retry loop with a non-conflict error
    pub abandoned: u64,
}

impl AbortBreakdown {
    fn from_counts(counts: [u64; KINDS], abandoned: u64) -> Self {
        Self {
            locked_on_read: counts[0],
            stale_read: counts[1],
            read_inconsistent: counts[2],
            lock_busy: counts[3],
            validation_failed: counts[4],
            explicit_restart: counts[5],
            abandoned,
        }
    }

    /// Sum over every cause
    pub fn total(&self) -> u64 {
        self.locked_on_read
            + self.stale_read
            + self.read_inconsistent
            + self.lock_busy
            + self.validation_failed
            + self.explicit_restart
            + self.abandoned
    }
}

// ============================================================================
// Per-thread counters
// ============================================================================

/// Counters owned by one thread context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Attempts begun
    pub started: u64,
    /// Attempts committed
    pub committed: u64,
    /// Commits that took the read-only path
    pub read_only_commits: u64,
    /// Attempts that ran in serial mode
    pub serial_entries: u64,
    conflicts: [u64; KINDS],
    abandoned: u64,
}

impl ThreadStats {
    /// Count a begun attempt
    pub fn record_start(&mut self) {
        self.started += 1;
    }

    /// Count a commit
    pub fn record_commit(&mut self, read_only: bool) {
        self.committed += 1;
        if read_only {
            self.read_only_commits += 1;
        }
    }

    /// Count a failed attempt
    pub fn record_failure(&mut self, err: &StmError) {
        match err.conflict_kind() {
            Some(kind) => self.conflicts[kind_index(kind)] += 1,
            None => self.abandoned += 1,
        }
    }

    /// Count an attempt dropped without commit or error
    pub fn record_abandoned(&mut self) {
        self.abandoned += 1;
    }

    /// Count a serial-mode attempt
    pub fn record_serial(&mut self) {
        self.serial_entries += 1;
    }

    /// Total failed attempts
    pub fn aborted(&self) -> u64 {
        self.conflicts.iter().sum::<u64>() + self.abandoned
    }

    /// Abort breakdown for this thread
    pub fn aborts(&self) -> AbortBreakdown {
        AbortBreakdown::from_counts(self.conflicts, self.abandoned)
    }
}

// ============================================================================
// Runtime-wide collector
// ============================================================================

/// Runtime-wide counters, fed from exiting threads
#[derive(Debug, Default)]
pub struct MetricsCollector {
    threads: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    read_only_commits: AtomicU64,
    serial_entries: AtomicU64,
    conflicts: [AtomicU64; KINDS],
    abandoned: AtomicU64,
}

impl MetricsCollector {
    /// Create a zeroed collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one thread's counters in
    pub fn absorb(&self, stats: &ThreadStats) {
        self.threads.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(stats.started, Ordering::Relaxed);
        self.committed.fetch_add(stats.committed, Ordering::Relaxed);
        self.read_only_commits
            .fetch_add(stats.read_only_commits, Ordering::Relaxed);
        self.serial_entries
            .fetch_add(stats.serial_entries, Ordering::Relaxed);
        for (total, count) in self.conflicts.iter().zip(stats.conflicts.iter()) {
            total.fetch_add(*count, Ordering::Relaxed);
        }
        self.abandoned.fetch_add(stats.abandoned, Ordering::Relaxed);
    }

    /// Snapshot of everything absorbed so far
    pub fn snapshot(&self) -> TransactionMetrics {
        let mut counts = [0u64; KINDS];
        for (slot, total) in counts.iter_mut().zip(self.conflicts.iter()) {
            *slot = total.load(Ordering::Relaxed);
        }
        let aborts = AbortBreakdown::from_counts(counts, self.abandoned.load(Ordering::Relaxed));
        let started = self.started.load(Ordering::Relaxed);
        let committed = self.committed.load(Ordering::Relaxed);

        TransactionMetrics {
            threads: self.threads.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            read_only_commits: self.read_only_commits.load(Ordering::Relaxed),
            total_aborted: aborts.total(),
            aborts,
            serial_entries: self.serial_entries.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Counts are per attempt: a transaction that commits on its third try
/// contributes three starts, two aborts and one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    /// Thread contexts that have exited and been folded in
    pub threads: u64,
    /// Total attempts started
    pub total_started: u64,
    /// Total attempts committed
    pub total_committed: u64,
    /// Commits that installed no writes
    pub read_only_commits: u64,
    /// Total attempts aborted
    pub total_aborted: u64,
    /// Aborts by cause
    pub aborts: AbortBreakdown,
    /// Attempts that ran in serial mode
    pub serial_entries: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total attempts that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
