//! Global version clock
//!
//! A single monotonic counter shared by every thread:
//! - `sample()` gives a starting transaction its snapshot timestamp
//! - `advance()` hands a committing transaction its commit version
//!
//! Only read-write commits advance the clock, and only while they hold the
//! write locks for every location they are about to install.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global version clock
///
/// # Memory Ordering
///
/// `advance()` uses AcqRel and `sample()` uses Acquire, so a sample that
/// happens-after an advance observes the incremented value, and everything
/// the committer did before advancing is visible to the sampler.
#[derive(Debug, Default)]
pub struct VersionClock {
    now: AtomicU64,
}

impl VersionClock {
    /// Create a clock starting at `initial`
    pub fn new(initial: u64) -> Self {
        VersionClock {
            now: AtomicU64::new(initial),
        }
    }

    /// Current value, without advancing
    #[inline]
    pub fn sample(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Atomically increment and return the new value
    #[inline]
    pub fn advance(&self) -> u64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }
}
