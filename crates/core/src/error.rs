//! Error types for the STM runtime
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - **Conflict**: a transaction attempt cannot be committed. Always recovered
//!   internally by re-executing the transaction body; never surfaced from
//!   `atomically`.
//! - **Resource exhaustion**: the transactional heap cannot satisfy a request.
//!   Fatal to the run.
//! - **Configuration**: a config value is outside its accepted bounds.
//! - **Aborted**: application-level abandonment of a transaction body.
//!
//! Misuse of the API (accessing memory outside an active transaction, nesting
//! `begin`) is not represented here: it panics.

use crate::types::Addr;
use thiserror::Error;

/// Result type alias for STM operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Why a transaction attempt had to be abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    /// A read found the location's ownership record locked by another thread
    #[error("location {addr} is locked by a committing transaction")]
    LockedOnRead {
        /// Location that was read
        addr: Addr,
    },

    /// A read observed a version committed after the transaction started
    #[error("location {addr} has version {version}, newer than snapshot {start_version}")]
    StaleRead {
        /// Location that was read
        addr: Addr,
        /// Version found on the ownership record
        version: u64,
        /// Start timestamp of the reading transaction
        start_version: u64,
    },

    /// The ownership record changed while the word was being loaded
    #[error("location {addr} changed while being read")]
    ReadInconsistent {
        /// Location that was read
        addr: Addr,
    },

    /// Commit could not acquire the write lock for a location
    #[error("write lock for {addr} is held by another transaction")]
    LockBusy {
        /// Location whose record could not be locked
        addr: Addr,
    },

    /// Read-set validation at commit found a changed or foreign-locked location
    #[error("read of {addr} at version {observed} is no longer valid (now {current})")]
    ValidationFailed {
        /// Location that failed validation
        addr: Addr,
        /// Version recorded in the read log
        observed: u64,
        /// Version found at validation time
        current: u64,
    },

    /// The transaction body asked to be re-executed
    #[error("explicit restart")]
    ExplicitRestart,
}

impl ConflictKind {
    /// Short stable label, used as a metrics and log key
    pub fn label(&self) -> &'static str {
        match self {
            ConflictKind::LockedOnRead { .. } => "locked_on_read",
            ConflictKind::StaleRead { .. } => "stale_read",
            ConflictKind::ReadInconsistent { .. } => "read_inconsistent",
            ConflictKind::LockBusy { .. } => "lock_busy",
            ConflictKind::ValidationFailed { .. } => "validation_failed",
            ConflictKind::ExplicitRestart => "explicit_restart",
        }
    }
}

/// Error types for the STM runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// Transaction attempt conflicted and must be re-executed
    #[error("transaction conflict: {0}")]
    Conflict(#[from] ConflictKind),

    /// The transactional heap has no room for the requested block
    #[error("transactional heap exhausted: requested {requested} words, capacity {capacity} words")]
    HeapExhausted {
        /// Words requested (including the block header)
        requested: usize,
        /// Total heap capacity in words
        capacity: usize,
    },

    /// A single block cannot exceed one heap segment
    #[error("block of {requested} words exceeds the maximum block size of {max} words")]
    BlockTooLarge {
        /// Words requested
        requested: usize,
        /// Largest block the heap can hand out
        max: usize,
    },

    /// A configuration value is outside its accepted bounds
    #[error("invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The transaction body gave up without committing
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl StmError {
    /// Create an explicit-restart conflict
    pub fn restart() -> Self {
        StmError::Conflict(ConflictKind::ExplicitRestart)
    }

    /// Create a configuration error
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        StmError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the retry loop should re-execute the transaction
    pub fn is_conflict(&self) -> bool {
        matches!(self, StmError::Conflict(_))
    }

    /// The conflict kind, if this is a conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StmError::Conflict(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Whether this error means the heap ran out of memory
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            StmError::HeapExhausted { .. } | StmError::BlockTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_conflict() {
        let err = StmError::from(ConflictKind::LockBusy { addr: Addr::new(7) });
        let msg = err.to_string();
        assert!(msg.contains("transaction conflict"));
        assert!(msg.contains("@7"));
    }

    #[test]
    fn test_error_display_stale_read() {
        let err = StmError::Conflict(ConflictKind::StaleRead {
            addr: Addr::new(3),
            version: 12,
            start_version: 10,
        });
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_error_display_heap_exhausted() {
        let err = StmError::HeapExhausted {
            requested: 9,
            capacity: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("heap exhausted"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_error_display_invalid_config() {
        let err = StmError::invalid_config("clients", "must be at least 1");
        let msg = err.to_string();
        assert!(msg.contains("clients"));
        assert!(msg.contains("must be at least 1"));
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(StmError::restart().is_conflict());
        assert!(StmError::from(ConflictKind::ReadInconsistent { addr: Addr::new(1) }).is_conflict());
        assert!(!StmError::Aborted("no seats".into()).is_conflict());
        assert!(!StmError::HeapExhausted {
            requested: 1,
            capacity: 1
        }
        .is_conflict());
    }

    #[test]
    fn test_resource_exhaustion_classification() {
        assert!(StmError::BlockTooLarge {
            requested: 10,
            max: 8
        }
        .is_resource_exhausted());
        assert!(!StmError::restart().is_resource_exhausted());
    }

    #[test]
    fn test_conflict_labels_are_distinct() {
        let kinds = [
            ConflictKind::LockedOnRead { addr: Addr::NULL },
            ConflictKind::StaleRead {
                addr: Addr::NULL,
                version: 0,
                start_version: 0,
            },
            ConflictKind::ReadInconsistent { addr: Addr::NULL },
            ConflictKind::LockBusy { addr: Addr::NULL },
            ConflictKind::ValidationFailed {
                addr: Addr::NULL,
                observed: 0,
                current: 0,
            },
            ConflictKind::ExplicitRestart,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.label()).collect();
        assert_eq!(labels.len(), kinds.len());
    }

    #[test]
    fn test_conflict_kind_roundtrip() {
        let err = StmError::restart();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::ExplicitRestart));
        assert_eq!(StmError::Aborted("x".into()).conflict_kind(), None);
    }
}
