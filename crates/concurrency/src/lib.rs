//! Word-based software transactional memory engine
//!
//! This crate implements a TL2-style STM with:
//! - VersionClock: global commit timestamp
//! - OrecTable: striped versioned ownership records
//! - Heap: segmented word memory with a transaction-aware allocator
//! - Transaction: read/write barriers with read-your-writes
//! - TransactionManager: lock, validate, install commit protocol
//! - StmRuntime / ThreadContext: startup, thread registration, retry loop
//!
//! Conflicts are detected optimistically: reads are checked against the
//! attempt's start timestamp as they happen, and the read log is validated
//! once more at commit while the written locations are locked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod contention;
pub mod heap;
pub mod manager;
pub mod metrics;
pub mod orec;
pub mod runtime;
pub mod transaction;
pub mod validation;

pub use clock::VersionClock;
pub use config::StmConfig;
pub use contention::{BackoffPolicy, ContentionManager};
pub use heap::{Heap, HeapStats};
pub use manager::{CommitOutcome, TransactionManager};
pub use metrics::{AbortBreakdown, ThreadStats, TransactionMetrics};
pub use orec::{OrecSnapshot, OrecTable, OwnershipRecord};
pub use runtime::{StmRuntime, ThreadContext, ThreadRegistration};
pub use transaction::{
    AllocationRecord, ReadEntry, Transaction, TransactionDescriptor, TransactionStatus,
};
pub use validation::validate_read_log;
