//! Contention management for the retry loop
//!
//! After a failed attempt the retrying thread waits a randomized, exponentially
//! growing delay before re-executing the transaction body. Optionally, a thread
//! that fails `serial_after` times in a row runs its next attempt in serial
//! mode, holding the runtime's exclusive gate so no other commit can interfere.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use stm_core::{StmError, StmResult};

/// Delays at or below this are spun rather than slept
const SPIN_LIMIT: Duration = Duration::from_micros(20);

// ============================================================================
// Backoff Policy
// ============================================================================

/// Bounded randomized exponential backoff
///
/// # Example
/// ```ignore
/// let policy = BackoffPolicy::default()
///     .with_base_micros(2)
///     .with_max_micros(500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in microseconds (0 disables backoff)
    pub base_micros: u64,
    /// Upper bound on any single delay, in microseconds
    pub max_micros: u64,
    /// Randomize each delay within `[nominal / 2, nominal]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_micros: 1,
            max_micros: 1024,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Policy that retries immediately
    pub fn none() -> Self {
        Self {
            base_micros: 0,
            max_micros: 0,
            jitter: false,
        }
    }

    /// Set the first-retry delay
    pub fn with_base_micros(mut self, base_micros: u64) -> Self {
        self.base_micros = base_micros;
        self
    }

    /// Set the delay cap
    pub fn with_max_micros(mut self, max_micros: u64) -> Self {
        self.max_micros = max_micros;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check bounds
    pub fn validate(&self) -> StmResult<()> {
        if self.base_micros > self.max_micros {
            return Err(StmError::invalid_config(
                "backoff.base_micros",
                format!(
                    "base delay {}us exceeds the cap {}us",
                    self.base_micros, self.max_micros
                ),
            ));
        }
        Ok(())
    }

    /// Nominal (unjittered) delay after `attempt` consecutive failures
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // Cap the shift to prevent overflow
        let shift = (attempt - 1).min(63);
        let micros = self
            .base_micros
            .saturating_mul(1u64 << shift)
            .min(self.max_micros);
        Duration::from_micros(micros)
    }
}

// ============================================================================
// Contention Manager
// ============================================================================

/// Per-thread retry state
#[derive(Debug)]
pub struct ContentionManager {
    policy: BackoffPolicy,
    serial_after: Option<u32>,
    consecutive_failures: u32,
    rng: StdRng,
}

impl ContentionManager {
    /// Create a manager seeded deterministically (typically by thread id)
    pub fn new(policy: BackoffPolicy, serial_after: Option<u32>, seed: u64) -> Self {
        Self {
            policy,
            serial_after,
            consecutive_failures: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Failed attempts since the last commit
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the next attempt must run in serial mode
    pub fn should_serialize(&self) -> bool {
        matches!(self.serial_after, Some(limit) if self.consecutive_failures >= limit)
    }

    /// Record a successful commit
    pub fn on_commit(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed attempt and return how long to wait before retrying
    pub fn on_abort(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let nominal = self.policy.nominal_delay(self.consecutive_failures);
        if !self.policy.jitter || nominal.is_zero() {
            return nominal;
        }
        let max = nominal.as_micros() as u64;
        Duration::from_micros(self.rng.gen_range(max / 2..=max))
    }

    /// Record a failure and wait out the resulting delay
    pub fn backoff(&mut self) -> Duration {
        let delay = self.on_abort();
        pause(delay);
        delay
    }
}

fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    if delay <= SPIN_LIMIT {
        let start = Instant::now();
        while start.elapsed() < delay {
            std::hint::spin_loop();
        }
    } else {
        std::thread::sleep(delay);
    }
}
