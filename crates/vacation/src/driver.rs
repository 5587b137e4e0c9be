//! Benchmark driver
//!
//! Lifecycle of one run:
//! 1. `setup`: start the STM runtime, create the tables and populate them
//!    sequentially
//! 2. `run`: one scoped thread per client, each registered with the runtime
//! 3. `check`: scan the tables for invariant violations
//! 4. `teardown`: empty every table, release the tables and shut the runtime
//!    down
//!
//! Population and teardown run single-threaded through [`Sequential`].

use crate::client::{Client, ClientStats};
use crate::config::VacationConfig;
use crate::error::{VacationError, VacationResult};
use crate::manager::{ConsistencyReport, Manager};
use crate::map::TxMap;
use crate::memory::Sequential;
use crate::reservation::ReservationKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stm_concurrency::{HeapStats, StmRuntime, TransactionMetrics};
use stm_core::{StmError, StmResult};
use tracing::{info, warn};

/// Outcome of the client phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Client threads run
    pub clients: usize,
    /// Transactions each client ran
    pub transactions_per_client: u64,
    /// Wall-clock time of the client phase
    pub elapsed: Duration,
    /// Counters summed over every client
    pub clients_total: ClientStats,
    /// Per-client counters, by client id
    pub per_client: Vec<ClientStats>,
    /// STM counters at the end of the phase
    pub metrics: TransactionMetrics,
}

impl RunReport {
    /// Committed client transactions per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.clients_total.transactions() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Outcome of teardown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Final STM counters
    pub metrics: TransactionMetrics,
    /// Heap blocks still allocated after the tables were released
    pub leaked_blocks: usize,
}

/// One benchmark instance: a runtime and its populated tables
pub struct Benchmark {
    config: VacationConfig,
    runtime: Arc<StmRuntime>,
    manager: Manager,
}

impl Benchmark {
    /// Validate `config`, start the runtime and populate the tables
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range parameters or when the heap is too
    /// small for the requested number of relations.
    pub fn setup(config: VacationConfig) -> VacationResult<Self> {
        config.validate()?;
        let runtime = StmRuntime::startup(config.stm.clone())?;

        let buckets =
            TxMap::bucket_count_for(config.relations as usize, runtime.heap().max_block_words());
        let manager = {
            let mut m = Sequential::new(runtime.heap());
            let manager = Manager::create(&mut m, buckets)?;
            populate(&mut m, &manager, &config)?;
            manager
        };

        info!(
            target: "vacation::manager",
            relations = config.relations,
            buckets,
            live_blocks = runtime.heap().live_blocks(),
            "tables populated"
        );
        Ok(Benchmark {
            config,
            runtime,
            manager,
        })
    }

    /// The run's parameters
    pub fn config(&self) -> &VacationConfig {
        &self.config
    }

    /// The STM runtime
    pub fn runtime(&self) -> &Arc<StmRuntime> {
        &self.runtime
    }

    /// The tables
    pub fn manager(&self) -> Manager {
        self.manager
    }

    /// Current heap counters
    pub fn heap_stats(&self) -> HeapStats {
        self.runtime.heap_stats()
    }

    /// Run every client to completion
    ///
    /// # Errors
    ///
    /// Returns the first client error; the other clients still finish.
    pub fn run(&self) -> VacationResult<RunReport> {
        let clients = self.config.clients;
        info!(
            target: "vacation::client",
            clients,
            transactions_per_client = self.config.transactions_per_client(),
            query_range = self.config.query_range(),
            "starting clients"
        );

        let start = Instant::now();
        let results: Vec<StmResult<ClientStats>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..clients)
                .map(|id| {
                    let runtime = &self.runtime;
                    let mut client = Client::new(id, self.manager, &self.config);
                    thread::Builder::new()
                        .name(format!("vacation-client-{}", id))
                        .spawn_scoped(scope, move || {
                            let mut ctx = runtime.thread_enter();
                            let result = client.run(&mut ctx);
                            ctx.thread_exit();
                            result
                        })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => match handle.join() {
                        Ok(result) => result,
                        Err(panic) => std::panic::resume_unwind(panic),
                    },
                    Err(e) => Err(StmError::Aborted(format!(
                        "failed to spawn client thread: {}",
                        e
                    ))),
                })
                .collect()
        });
        let elapsed = start.elapsed();

        let mut per_client = Vec::with_capacity(clients);
        let mut clients_total = ClientStats::default();
        for result in results {
            let stats = result?;
            clients_total.merge(&stats);
            per_client.push(stats);
        }

        let report = RunReport {
            clients,
            transactions_per_client: self.config.transactions_per_client(),
            elapsed,
            clients_total,
            per_client,
            metrics: self.runtime.metrics(),
        };
        info!(
            target: "vacation::client",
            elapsed_ms = report.elapsed.as_millis() as u64,
            throughput = report.throughput(),
            aborts = report.metrics.total_aborted,
            "clients finished"
        );
        Ok(report)
    }

    /// Scan the tables for invariant violations
    ///
    /// Call only while no client is running.
    ///
    /// # Errors
    ///
    /// Returns `VacationError::Inconsistent` listing the violations.
    pub fn check(&self) -> VacationResult<ConsistencyReport> {
        let mut m = Sequential::new(self.runtime.heap());
        let report = self.manager.check_consistency(&mut m)?;
        if report.is_consistent() {
            Ok(report)
        } else {
            Err(VacationError::Inconsistent(report.violations.join("; ")))
        }
    }

    /// Empty every table, release the tables and shut the runtime down
    pub fn teardown(self) -> VacationResult<TeardownReport> {
        let relations = self.config.relations as i64;
        let heap = self.runtime.heap();
        let manager = self.manager;
        let mut m = Sequential::new(heap);

        for id in 1..=relations {
            manager.delete_customer(&mut m, id)?;
        }
        for id in 1..=relations {
            let cars = manager.query_free(&mut m, ReservationKind::Car, id)?;
            manager.delete_car(&mut m, id, cars)?;
            manager.delete_flight(&mut m, id)?;
            let rooms = manager.query_free(&mut m, ReservationKind::Room, id)?;
            manager.delete_room(&mut m, id, rooms)?;
        }
        manager.destroy(&mut m)?;

        let leaked_blocks = heap.live_blocks();
        if leaked_blocks != 0 {
            warn!(
                target: "vacation::manager",
                leaked_blocks,
                "heap blocks still allocated after teardown"
            );
        }
        let metrics = self.runtime.shutdown();
        Ok(TeardownReport {
            metrics,
            leaked_blocks,
        })
    }
}

impl std::fmt::Debug for Benchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Benchmark")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

/// Fill the three reservation tables and the customer table
///
/// Each table gets ids `1..=relations` inserted in a freshly shuffled order,
/// with `100..=500` units at a price of `50..=90`.
fn populate(m: &mut Sequential<'_>, manager: &Manager, config: &VacationConfig) -> StmResult<()> {
    let relations = config.relations as usize;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut ids: Vec<i64> = (1..=relations as i64).collect();

    for table in 0..=ReservationKind::ALL.len() {
        for _ in 0..relations {
            let x = rng.gen_range(0..relations);
            let y = rng.gen_range(0..relations);
            ids.swap(x, y);
        }

        for &id in &ids {
            let num = (rng.gen_range(0..5) + 1) * 100;
            let price = rng.gen_range(0..5) * 10 + 50;
            let added = match ReservationKind::ALL.get(table) {
                Some(&kind) => manager.add_reservation(m, kind, id, num, price)?,
                None => manager.add_customer(m, id)?,
            };
            debug_assert!(added, "duplicate id {} during population", id);
        }
    }
    Ok(())
}
