//! Runtime configuration
//!
//! `StmConfig` sizes the ownership-record table and the transactional heap and
//! carries the contention-management policy. Values are checked once, at
//! `StmRuntime::startup`.

use crate::contention::BackoffPolicy;
use serde::{Deserialize, Serialize};
use stm_core::{StmError, StmResult};

/// Largest accepted ownership-record table (`1 << 26` records)
pub const MAX_OREC_BITS: u32 = 26;
/// Smallest accepted heap segment (`1 << 4` words)
pub const MIN_SEGMENT_BITS: u32 = 4;
/// Largest accepted heap segment (`1 << 30` words)
pub const MAX_SEGMENT_BITS: u32 = 30;
/// Largest accepted number of heap segments
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Configuration for an `StmRuntime`
///
/// # Example
///
/// ```toml
/// orec_bits = 20
/// heap_segment_bits = 20
/// heap_segments = 64
/// serial_after = 32
///
/// [backoff]
/// base_micros = 1
/// max_micros = 1024
/// jitter = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    /// log2 of the number of ownership records
    pub orec_bits: u32,
    /// log2 of the words per heap segment
    pub heap_segment_bits: u32,
    /// Number of heap segments (materialized lazily)
    pub heap_segments: usize,
    /// Delay policy between retries
    pub backoff: BackoffPolicy,
    /// Consecutive failures after which an attempt runs serially
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_after: Option<u32>,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            orec_bits: 20,
            heap_segment_bits: 20,
            heap_segments: 64,
            backoff: BackoffPolicy::default(),
            serial_after: None,
        }
    }
}

impl StmConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Small tables for unit and integration tests
    pub fn for_testing() -> Self {
        Self {
            orec_bits: 10,
            heap_segment_bits: 14,
            heap_segments: 16,
            backoff: BackoffPolicy::default().with_max_micros(64),
            serial_after: None,
        }
    }

    /// Set the ownership-record table size
    pub fn with_orec_bits(mut self, orec_bits: u32) -> Self {
        self.orec_bits = orec_bits;
        self
    }

    /// Set the heap segment size
    pub fn with_heap_segment_bits(mut self, heap_segment_bits: u32) -> Self {
        self.heap_segment_bits = heap_segment_bits;
        self
    }

    /// Set the number of heap segments
    pub fn with_heap_segments(mut self, heap_segments: usize) -> Self {
        self.heap_segments = heap_segments;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable serial fallback after `failures` consecutive aborts
    pub fn with_serial_after(mut self, failures: Option<u32>) -> Self {
        self.serial_after = failures;
        self
    }

    /// Heap capacity in words
    pub fn heap_capacity_words(&self) -> usize {
        self.heap_segments << self.heap_segment_bits
    }

    /// Check every field against its bounds
    pub fn validate(&self) -> StmResult<()> {
        if self.orec_bits == 0 || self.orec_bits > MAX_OREC_BITS {
            return Err(StmError::invalid_config(
                "orec_bits",
                format!("must be in 1..={}, got {}", MAX_OREC_BITS, self.orec_bits),
            ));
        }
        if !(MIN_SEGMENT_BITS..=MAX_SEGMENT_BITS).contains(&self.heap_segment_bits) {
            return Err(StmError::invalid_config(
                "heap_segment_bits",
                format!(
                    "must be in {}..={}, got {}",
                    MIN_SEGMENT_BITS, MAX_SEGMENT_BITS, self.heap_segment_bits
                ),
            ));
        }
        if self.heap_segments == 0 || self.heap_segments > MAX_SEGMENTS {
            return Err(StmError::invalid_config(
                "heap_segments",
                format!("must be in 1..={}, got {}", MAX_SEGMENTS, self.heap_segments),
            ));
        }
        if self.serial_after == Some(0) {
            return Err(StmError::invalid_config(
                "serial_after",
                "must be at least 1 when set",
            ));
        }
        self.backoff.validate()
    }
}
