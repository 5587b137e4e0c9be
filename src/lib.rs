//! vacation-stm - word-based software transactional memory with the vacation
//! reservation benchmark
//!
//! # Quick Start
//!
//! ```ignore
//! use vacation_stm::{StmConfig, StmRuntime};
//!
//! let runtime = StmRuntime::startup(StmConfig::default())?;
//! let mut ctx = runtime.thread_enter();
//!
//! let counter = ctx.atomically(|tx| {
//!     let block = tx.allocate(1)?;
//!     tx.write_i64(block, 0);
//!     Ok(block)
//! })?;
//!
//! ctx.atomically(|tx| {
//!     let n = tx.read_i64(counter)?;
//!     tx.write_i64(counter, n + 1);
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `stm-core`: addresses, word conversions, the error taxonomy
//! - `stm-concurrency`: clock, ownership records, heap, barriers, commit
//!   protocol, runtime
//! - `vacation`: the reservation tables, clients and benchmark driver

pub use stm_concurrency::{
    BackoffPolicy, CommitOutcome, Heap, HeapStats, StmConfig, StmRuntime, ThreadContext,
    Transaction, TransactionMetrics,
};
pub use stm_core::{Addr, ConflictKind, StmError, StmResult, ThreadId, Word};

/// The reservation benchmark
pub mod bench {
    pub use vacation::*;
}
