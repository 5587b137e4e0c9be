//! Location metadata: versioned ownership records
//!
//! Every heap word maps onto one ownership record of a striped table
//! (`addr & mask`), so several words can share a record. A record holds:
//! - the version stamped by the last commit that wrote any of its words
//! - a lock bit, set while a committing transaction owns the record
//! - the owning thread while locked
//!
//! ## Encoding
//!
//! ```text
//! lock word: [ version (63 bits) | locked (1 bit) ]
//! owner:     thread id, 0 when unowned
//! ```
//!
//! The version survives locking unchanged, so validation can compare it even
//! while the record is held by the validating thread itself.

use std::sync::atomic::{AtomicU64, Ordering};
use stm_core::{Addr, ThreadId};

const LOCK_BIT: u64 = 1;
const NO_OWNER: u64 = 0;

/// Point-in-time view of a record's lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrecSnapshot(u64);

impl OrecSnapshot {
    /// Committed version at the time of the snapshot
    #[inline]
    pub fn version(self) -> u64 {
        self.0 >> 1
    }

    /// Whether the record was locked
    #[inline]
    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }
}

/// One versioned ownership record
#[derive(Debug, Default)]
#[repr(C)]
pub struct OwnershipRecord {
    word: AtomicU64,
    owner: AtomicU64,
}

impl OwnershipRecord {
    /// Unlocked record at version 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the lock word
    #[inline]
    pub fn snapshot(&self) -> OrecSnapshot {
        OrecSnapshot(self.word.load(Ordering::Acquire))
    }

    /// Current committed version
    #[inline]
    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Thread currently holding the lock, if any
    ///
    /// Between a successful lock CAS and the owner store this can briefly
    /// report `None` for a locked record; callers treat that as "someone else".
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(ThreadId::new(id)),
        }
    }

    /// Whether the record is locked by a thread other than `me`
    #[inline]
    pub fn is_locked_by_other(&self, snapshot: OrecSnapshot, me: ThreadId) -> bool {
        snapshot.is_locked() && self.owner.load(Ordering::Acquire) != me.as_u64()
    }

    /// Whether `me` currently holds the lock
    #[inline]
    pub fn is_held_by(&self, me: ThreadId) -> bool {
        self.snapshot().is_locked() && self.owner.load(Ordering::Acquire) == me.as_u64()
    }

    /// Try to acquire the write lock without blocking
    ///
    /// Fails if another thread holds the record. Re-locking a record already
    /// held by `me` succeeds, which covers two written words that share a
    /// stripe.
    pub fn try_lock(&self, me: ThreadId) -> bool {
        let current = self.word.load(Ordering::Acquire);
        if current & LOCK_BIT != 0 {
            return self.owner.load(Ordering::Acquire) == me.as_u64();
        }
        match self.word.compare_exchange(
            current,
            current | LOCK_BIT,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                self.owner.store(me.as_u64(), Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Release the lock, keeping the version
    pub fn unlock(&self) {
        let current = self.word.load(Ordering::Relaxed);
        debug_assert!(current & LOCK_BIT != 0, "unlock of an unlocked record");
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.word.store(current & !LOCK_BIT, Ordering::Release);
    }

    /// Stamp a new version while keeping the lock
    pub fn set_version(&self, version: u64) {
        debug_assert!(self.snapshot().is_locked(), "set_version without the lock");
        self.word.store((version << 1) | LOCK_BIT, Ordering::Release);
    }

    /// Stamp a new version and release the lock in one store
    pub fn set_version_and_unlock(&self, version: u64) {
        debug_assert!(self.snapshot().is_locked(), "set_version without the lock");
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.word.store(version << 1, Ordering::Release);
    }
}

/// Striped table of ownership records
pub struct OrecTable {
    records: Box<[OwnershipRecord]>,
    mask: u64,
}

impl OrecTable {
    /// Create a table of `1 << bits` records
    pub fn new(bits: u32) -> Self {
        let len = 1usize << bits;
        let records = (0..len).map(|_| OwnershipRecord::new()).collect::<Vec<_>>();
        OrecTable {
            records: records.into_boxed_slice(),
            mask: (len as u64) - 1,
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records (never true for a constructed table)
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stripe index guarding `addr`
    #[inline]
    pub fn index_of(&self, addr: Addr) -> usize {
        (addr.index() & self.mask) as usize
    }

    /// Record at a stripe index
    #[inline]
    pub fn get(&self, index: usize) -> &OwnershipRecord {
        &self.records[index]
    }

    /// Record guarding `addr`
    #[inline]
    pub fn for_addr(&self, addr: Addr) -> &OwnershipRecord {
        self.get(self.index_of(addr))
    }

    /// Number of currently locked records
    ///
    /// Linear scan; meant for diagnostics and tests, not hot paths.
    pub fn locked_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.snapshot().is_locked())
            .count()
    }
}

impl std::fmt::Debug for OrecTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrecTable")
            .field("len", &self.records.len())
            .finish()
    }
}
