//! Core types for the STM runtime
//!
//! This crate defines the foundational types used throughout the system:
//! - Addr: word address in the transactional heap
//! - ThreadId: owner identity stored in ownership records
//! - Word: typed view over raw transactional words
//! - StmError / ConflictKind: error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{ConflictKind, StmError, StmResult};
pub use types::{Addr, ThreadId, Word};
