//! Client workload
//!
//! Each client thread runs a fixed number of transactions, choosing one of
//! three actions per transaction:
//! - make a reservation: query a few resources, register the customer, and
//!   reserve the priciest one of each kind seen
//! - delete a customer, cancelling everything they hold
//! - update tables: add or remove units of random resources
//!
//! All random choices for a transaction are drawn before it starts, so a
//! re-executed body repeats exactly the same work.

use crate::config::VacationConfig;
use crate::manager::Manager;
use crate::reservation::ReservationKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use stm_concurrency::ThreadContext;
use stm_core::StmResult;
use tracing::debug;

/// Units added or removed per table update
pub const UPDATE_UNITS: i64 = 100;

/// What a client transaction does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Query resources and reserve the priciest of each kind
    MakeReservation,
    /// Remove a customer and release their reservations
    DeleteCustomer,
    /// Add or remove resource units
    UpdateTables,
}

impl Action {
    /// Map a percentile draw to an action
    ///
    /// Draws below `user_percent` make reservations; the rest split evenly
    /// between deleting customers (odd draws) and updating tables.
    pub fn select(draw: u64, user_percent: u64) -> Self {
        if draw < user_percent {
            Action::MakeReservation
        } else if draw & 1 == 1 {
            Action::DeleteCustomer
        } else {
            Action::UpdateTables
        }
    }
}

/// Per-client outcome counters
///
/// Counted from committed transactions only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Reservation transactions run
    pub make_reservation: u64,
    /// Customer deletion transactions run
    pub delete_customer: u64,
    /// Table update transactions run
    pub update_tables: u64,
    /// Units successfully reserved
    pub reservations_made: u64,
    /// Customers removed
    pub customers_deleted: u64,
    /// Table updates that took effect
    pub updates_applied: u64,
}

impl ClientStats {
    /// Transactions run
    pub fn transactions(&self) -> u64 {
        self.make_reservation + self.delete_customer + self.update_tables
    }

    /// Add another client's counters
    pub fn merge(&mut self, other: &ClientStats) {
        self.make_reservation += other.make_reservation;
        self.delete_customer += other.delete_customer;
        self.update_tables += other.update_tables;
        self.reservations_made += other.reservations_made;
        self.customers_deleted += other.customers_deleted;
        self.updates_applied += other.updates_applied;
    }
}

#[derive(Debug, Clone, Copy)]
struct Query {
    kind: ReservationKind,
    id: i64,
}

#[derive(Debug, Clone, Copy)]
struct Update {
    kind: ReservationKind,
    id: i64,
    // price for an add, None for a delete
    add_price: Option<i64>,
}

/// One client thread's workload
#[derive(Debug)]
pub struct Client {
    id: usize,
    manager: Manager,
    rng: StdRng,
    transactions: u64,
    queries: u64,
    query_range: u64,
    user_percent: u64,
    stats: ClientStats,
}

impl Client {
    /// Create client `id` over `manager`
    ///
    /// Its random stream is derived from the run seed and the client id.
    pub fn new(id: usize, manager: Manager, config: &VacationConfig) -> Self {
        Client {
            id,
            manager,
            rng: StdRng::seed_from_u64(client_seed(config.seed, id)),
            transactions: config.transactions_per_client(),
            queries: config.queries,
            query_range: config.query_range(),
            user_percent: config.user_percent,
            stats: ClientStats::default(),
        }
    }

    /// Client index
    pub fn id(&self) -> usize {
        self.id
    }

    /// Counters so far
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Run every transaction of this client
    ///
    /// # Errors
    ///
    /// Only unrecoverable runtime errors (heap exhaustion) stop the client;
    /// conflicts are retried inside each transaction.
    pub fn run(&mut self, ctx: &mut ThreadContext) -> StmResult<ClientStats> {
        debug!(
            target: "vacation::client",
            client = self.id,
            thread = %ctx.id(),
            transactions = self.transactions,
            "client started"
        );
        for _ in 0..self.transactions {
            self.step(ctx)?;
        }
        debug!(
            target: "vacation::client",
            client = self.id,
            reservations = self.stats.reservations_made,
            customers_deleted = self.stats.customers_deleted,
            updates = self.stats.updates_applied,
            "client finished"
        );
        Ok(self.stats)
    }

    /// Run one transaction
    pub fn step(&mut self, ctx: &mut ThreadContext) -> StmResult<Action> {
        let action = Action::select(self.rng.gen_range(0..100), self.user_percent);
        match action {
            Action::MakeReservation => {
                let made = self.make_reservation(ctx)?;
                self.stats.make_reservation += 1;
                self.stats.reservations_made += made;
            }
            Action::DeleteCustomer => {
                let deleted = self.delete_customer(ctx)?;
                self.stats.delete_customer += 1;
                self.stats.customers_deleted += deleted as u64;
            }
            Action::UpdateTables => {
                let applied = self.update_tables(ctx)?;
                self.stats.update_tables += 1;
                self.stats.updates_applied += applied;
            }
        }
        Ok(action)
    }

    fn random_id(&mut self) -> i64 {
        self.rng.gen_range(1..=self.query_range) as i64
    }

    fn random_kind(&mut self) -> ReservationKind {
        ReservationKind::ALL[self.rng.gen_range(0..ReservationKind::ALL.len())]
    }

    fn make_reservation(&mut self, ctx: &mut ThreadContext) -> StmResult<u64> {
        let count = self.rng.gen_range(1..=self.queries);
        let customer_id = self.random_id();
        let queries: Vec<Query> = (0..count)
            .map(|_| Query {
                kind: self.random_kind(),
                id: self.random_id(),
            })
            .collect();

        let manager = self.manager;
        ctx.atomically(|tx| {
            let mut max_prices = [-1i64; 3];
            let mut max_ids = [-1i64; 3];
            let mut found = false;

            for query in &queries {
                let mut price = -1;
                if manager.query_free(tx, query.kind, query.id)? >= 0 {
                    price = manager.query_price(tx, query.kind, query.id)?;
                }
                let slot = query.kind.index();
                if price > max_prices[slot] {
                    max_prices[slot] = price;
                    max_ids[slot] = query.id;
                    found = true;
                }
            }

            if found {
                manager.add_customer(tx, customer_id)?;
            }

            let mut made = 0;
            for kind in ReservationKind::ALL {
                let id = max_ids[kind.index()];
                if id > 0 && manager.reserve(tx, kind, customer_id, id)? {
                    made += 1;
                }
            }
            Ok(made)
        })
    }

    fn delete_customer(&mut self, ctx: &mut ThreadContext) -> StmResult<bool> {
        let customer_id = self.random_id();
        let manager = self.manager;
        ctx.atomically(|tx| {
            if manager.query_customer_bill(tx, customer_id)? >= 0 {
                manager.delete_customer(tx, customer_id)
            } else {
                Ok(false)
            }
        })
    }

    fn update_tables(&mut self, ctx: &mut ThreadContext) -> StmResult<u64> {
        let count = self.rng.gen_range(1..=self.queries);
        let updates: Vec<Update> = (0..count)
            .map(|_| {
                let kind = self.random_kind();
                let id = self.random_id();
                let add_price = if self.rng.gen_bool(0.5) {
                    Some(self.rng.gen_range(0..5) * 10 + 50)
                } else {
                    None
                };
                Update {
                    kind,
                    id,
                    add_price,
                }
            })
            .collect();

        let manager = self.manager;
        ctx.atomically(|tx| {
            let mut applied = 0;
            for update in &updates {
                let done = match (update.add_price, update.kind) {
                    (Some(price), kind) => {
                        manager.add_reservation(tx, kind, update.id, UPDATE_UNITS, price)?
                    }
                    (None, ReservationKind::Car) => {
                        manager.delete_car(tx, update.id, UPDATE_UNITS)?
                    }
                    (None, ReservationKind::Flight) => manager.delete_flight(tx, update.id)?,
                    (None, ReservationKind::Room) => {
                        manager.delete_room(tx, update.id, UPDATE_UNITS)?
                    }
                };
                applied += done as u64;
            }
            Ok(applied)
        })
    }
}

/// Seed of client `id`'s random stream
pub fn client_seed(seed: u64, id: usize) -> u64 {
    seed ^ (id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Sequential;
    use stm_concurrency::{StmConfig, StmRuntime};

    #[test]
    fn test_select_action() {
        assert_eq!(Action::select(0, 80), Action::MakeReservation);
        assert_eq!(Action::select(79, 80), Action::MakeReservation);
        assert_eq!(Action::select(81, 80), Action::DeleteCustomer);
        assert_eq!(Action::select(80, 80), Action::UpdateTables);
        assert_eq!(Action::select(0, 0), Action::UpdateTables);
        assert_eq!(Action::select(99, 100), Action::MakeReservation);
    }

    #[test]
    fn test_client_seeds_differ() {
        assert_ne!(client_seed(0, 0), client_seed(0, 1));
        assert_ne!(client_seed(1, 0), client_seed(2, 0));
    }

    #[test]
    fn test_stats_merge() {
        let mut a = ClientStats {
            make_reservation: 2,
            reservations_made: 3,
            ..Default::default()
        };
        let b = ClientStats {
            delete_customer: 1,
            update_tables: 4,
            updates_applied: 2,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.transactions(), 7);
        assert_eq!(a.reservations_made, 3);
        assert_eq!(a.updates_applied, 2);
    }

    #[test]
    fn test_single_client_keeps_tables_consistent() {
        let config = VacationConfig::for_testing()
            .with_clients(1)
            .with_transactions(200);
        let rt = StmRuntime::startup(StmConfig::for_testing()).unwrap();
        let manager = {
            let mut m = Sequential::new(rt.heap());
            let manager = Manager::create(&mut m, 16).unwrap();
            for id in 1..=config.relations as i64 {
                for kind in ReservationKind::ALL {
                    manager.add_reservation(&mut m, kind, id, 100, 50).unwrap();
                }
                manager.add_customer(&mut m, id).unwrap();
            }
            manager
        };

        let mut ctx = rt.thread_enter();
        let mut client = Client::new(0, manager, &config);
        let stats = client.run(&mut ctx).unwrap();
        assert_eq!(stats.transactions(), 200);
        assert_eq!(client.stats(), stats);

        let report = ctx
            .atomically_read_only(|tx| manager.check_consistency(tx))
            .unwrap();
        assert!(report.is_consistent(), "{:?}", report.violations);
    }

    #[test]
    fn test_same_seed_same_work() {
        let config = VacationConfig::for_testing().with_transactions(50);
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let rt = StmRuntime::startup(StmConfig::for_testing()).unwrap();
            let mut m = Sequential::new(rt.heap());
            let manager = Manager::create(&mut m, 16).unwrap();
            for id in 1..=config.relations as i64 {
                manager.add_car(&mut m, id, 100, 50).unwrap();
                manager.add_customer(&mut m, id).unwrap();
            }
            let mut ctx = rt.thread_enter();
            let mut client = Client::new(3, manager, &config);
            let mut actions = Vec::new();
            for _ in 0..50 {
                actions.push(client.step(&mut ctx).unwrap());
            }
            outcomes.push((actions, client.stats()));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }
}
