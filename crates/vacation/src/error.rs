//! Error types for the reservation benchmark

use std::path::PathBuf;
use stm_core::StmError;
use thiserror::Error;

/// Result type alias for benchmark operations
pub type VacationResult<T> = std::result::Result<T, VacationError>;

/// Errors surfaced by the benchmark driver
#[derive(Debug, Error)]
pub enum VacationError {
    /// The STM runtime failed (heap exhaustion, bad runtime config)
    #[error(transparent)]
    Stm(#[from] StmError),

    /// A benchmark parameter is out of range
    #[error("invalid parameter '{field}': {reason}")]
    Config {
        /// Parameter name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// A configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A configuration file is not valid TOML for `VacationConfig`
    #[error("failed to parse config file {path}: {reason}")]
    Parse {
        /// File that was being parsed
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The tables violate a reservation invariant
    #[error("tables are inconsistent: {0}")]
    Inconsistent(String),
}

impl VacationError {
    /// Create a parameter error
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        VacationError::Config {
            field,
            reason: reason.into(),
        }
    }
}
