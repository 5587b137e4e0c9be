//! Benchmark configuration
//!
//! Parameters come from defaults, an optional `vacation.toml`, and command
//! line flags, in that order of precedence (flags win).

use crate::error::{VacationError, VacationResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stm_concurrency::StmConfig;

/// Largest accepted client count
pub const MAX_CLIENTS: usize = 1024;
/// Largest accepted number of relations per table
pub const MAX_RELATIONS: u64 = 1 << 24;

/// Parameters of one benchmark run
///
/// # Example
///
/// ```toml
/// clients = 4
/// queries = 10
/// query_percent = 90
/// relations = 65536
/// transactions = 4194304
/// user_percent = 80
/// seed = 0
///
/// [stm]
/// orec_bits = 20
/// serial_after = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacationConfig {
    /// Number of client threads
    pub clients: usize,
    /// Maximum queries per client transaction
    pub queries: u64,
    /// Percentage of each table's ids clients touch
    pub query_percent: u64,
    /// Number of ids per table at population time
    pub relations: u64,
    /// Transactions across all clients
    pub transactions: u64,
    /// Percentage of transactions that make reservations
    pub user_percent: u64,
    /// Seed for population and client random streams
    pub seed: u64,
    /// STM runtime settings
    pub stm: StmConfig,
}

impl Default for VacationConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            queries: 10,
            query_percent: 90,
            relations: 1 << 16,
            transactions: 1 << 26,
            user_percent: 80,
            seed: 0,
            stm: StmConfig::default(),
        }
    }
}

impl VacationConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Small run with a test-sized runtime
    pub fn for_testing() -> Self {
        Self {
            clients: 2,
            queries: 4,
            query_percent: 90,
            relations: 64,
            transactions: 512,
            user_percent: 80,
            seed: 7,
            stm: StmConfig::for_testing(),
        }
    }

    /// Set the number of client threads
    pub fn with_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    /// Set the maximum queries per transaction
    pub fn with_queries(mut self, queries: u64) -> Self {
        self.queries = queries;
        self
    }

    /// Set the percentage of ids queried
    pub fn with_query_percent(mut self, query_percent: u64) -> Self {
        self.query_percent = query_percent;
        self
    }

    /// Set the number of ids per table
    pub fn with_relations(mut self, relations: u64) -> Self {
        self.relations = relations;
        self
    }

    /// Set the total number of transactions
    pub fn with_transactions(mut self, transactions: u64) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the percentage of reservation transactions
    pub fn with_user_percent(mut self, user_percent: u64) -> Self {
        self.user_percent = user_percent;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the STM runtime config
    pub fn with_stm(mut self, stm: StmConfig) -> Self {
        self.stm = stm;
        self
    }

    /// Transactions each client runs, rounded to nearest
    pub fn transactions_per_client(&self) -> u64 {
        (self.transactions as f64 / self.clients.max(1) as f64 + 0.5) as u64
    }

    /// Ids `1..=query_range` are the ones clients touch
    pub fn query_range(&self) -> u64 {
        (self.query_percent as f64 / 100.0 * self.relations as f64 + 0.5) as u64
    }

    /// Check every parameter against its bounds
    ///
    /// # Errors
    ///
    /// Returns the first parameter that is out of range.
    pub fn validate(&self) -> VacationResult<()> {
        if self.clients == 0 || self.clients > MAX_CLIENTS {
            return Err(VacationError::config(
                "clients",
                format!("must be in 1..={}, got {}", MAX_CLIENTS, self.clients),
            ));
        }
        if self.queries == 0 {
            return Err(VacationError::config("queries", "must be at least 1"));
        }
        if self.query_percent == 0 || self.query_percent > 100 {
            return Err(VacationError::config(
                "query_percent",
                format!("must be in 1..=100, got {}", self.query_percent),
            ));
        }
        if self.relations == 0 || self.relations > MAX_RELATIONS {
            return Err(VacationError::config(
                "relations",
                format!("must be in 1..={}, got {}", MAX_RELATIONS, self.relations),
            ));
        }
        if self.user_percent > 100 {
            return Err(VacationError::config(
                "user_percent",
                format!("must be at most 100, got {}", self.user_percent),
            ));
        }
        if self.query_range() == 0 {
            return Err(VacationError::config(
                "query_percent",
                format!(
                    "{}% of {} relations leaves no ids to query",
                    self.query_percent, self.relations
                ),
            ));
        }
        self.stm.validate()?;
        Ok(())
    }

    /// Default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# vacation benchmark configuration
#
# Command line flags override every value here.

# Number of client threads
clients = 1
# Maximum queries per client transaction
queries = 10
# Percentage of each table's ids that clients touch
query_percent = 90
# Ids per table at population time
relations = 65536
# Transactions across all clients
transactions = 67108864
# Percentage of transactions that make reservations
user_percent = 80
# Seed for population and client random streams
seed = 0

# STM runtime settings
[stm]
# log2 of the number of ownership records
orec_bits = 20
# log2 of words per heap segment, and number of segments
heap_segment_bits = 20
heap_segments = 64
# Run an attempt serially after this many consecutive conflicts
# serial_after = 64

[stm.backoff]
base_micros = 1
max_micros = 1024
jitter = true
"#
    }

    /// Read, parse and validate a config file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds
    /// out-of-range values.
    pub fn from_file(path: &Path) -> VacationResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| VacationError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: VacationConfig = toml::from_str(&content).map_err(|e| VacationError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}
