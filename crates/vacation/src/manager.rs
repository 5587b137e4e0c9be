//! Reservation manager
//!
//! Four tables keyed by id: cars, flights, rooms and customers. Every
//! operation is generic over [`Memory`] so the same code serves client
//! transactions and the sequential population and teardown phases.
//!
//! Operations report business failures ("no such customer", "sold out") as
//! `Ok(false)` or `-1`, the way a client expects them; `Err` is reserved for
//! STM conflicts and heap exhaustion.

use crate::customer::{Customer, ReservationInfo};
use crate::map::TxMap;
use crate::memory::Memory;
use crate::reservation::{Reservation, ReservationKind, ReservationSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stm_core::{Addr, StmResult};
use tracing::debug;

/// Handles to the four tables
///
/// The table headers never move, so the manager itself is plain data shared
/// by every client thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manager {
    reservations: [TxMap; 3],
    customers: TxMap,
}

/// Result of a full table scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Reservation records per table, in `ReservationKind::ALL` order
    pub reservations: [usize; 3],
    /// Customer records
    pub customers: usize,
    /// Units held by customers across all tables
    pub reserved_units: i64,
    /// Every invariant violation found
    pub violations: Vec<String>,
}

impl ConsistencyReport {
    /// Whether no violation was found
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

impl Manager {
    /// Allocate four empty tables of `buckets` buckets each
    pub fn create<M: Memory>(m: &mut M, buckets: usize) -> StmResult<Self> {
        let manager = Manager {
            reservations: [
                TxMap::create(m, buckets)?,
                TxMap::create(m, buckets)?,
                TxMap::create(m, buckets)?,
            ],
            customers: TxMap::create(m, buckets)?,
        };
        debug!(target: "vacation::manager", buckets, "tables created");
        Ok(manager)
    }

    /// Table holding reservations of `kind`
    pub fn table(&self, kind: ReservationKind) -> TxMap {
        self.reservations[kind.index()]
    }

    /// Table holding customers
    pub fn customer_table(&self) -> TxMap {
        self.customers
    }

    fn find_reservation<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
    ) -> StmResult<Option<Reservation>> {
        Ok(self.table(kind).find(m, id)?.map(Reservation::from_addr))
    }

    fn find_customer<M: Memory>(&self, m: &mut M, id: i64) -> StmResult<Option<Customer>> {
        Ok(self.customers.find(m, id)?.map(Customer::from_addr))
    }

    // ========================================================================
    // Administrative operations
    // ========================================================================

    /// Add `num` units of resource `id` at `price`, or remove them when `num`
    /// is negative
    ///
    /// A missing resource is created when `num >= 1` and `price >= 0`. An
    /// existing one whose total drops to zero is removed and freed; otherwise
    /// its price is updated (a negative price leaves it unchanged).
    ///
    /// # Returns
    /// - `Ok(false)` if the resource is missing and cannot be created, or if
    ///   removing `-num` units would take reserved ones
    pub fn add_reservation<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
        num: i64,
        price: i64,
    ) -> StmResult<bool> {
        let table = self.table(kind);
        let reservation = match self.find_reservation(m, kind, id)? {
            Some(reservation) => reservation,
            None => {
                if num < 1 || price < 0 {
                    return Ok(false);
                }
                let created = Reservation::create(m, id, num, price)?;
                if !table.insert(m, id, created.addr())? {
                    return m.restart();
                }
                return Ok(true);
            }
        };

        if !reservation.add_to_total(m, num)? {
            return Ok(false);
        }
        if reservation.total(m)? == 0 {
            if !table.remove(m, id)? {
                return m.restart();
            }
            reservation.free(m);
        } else {
            reservation.update_price(m, price)?;
        }
        Ok(true)
    }

    /// Add `num` cars with id `id`
    pub fn add_car<M: Memory>(
        &self,
        m: &mut M,
        id: i64,
        num: i64,
        price: i64,
    ) -> StmResult<bool> {
        self.add_reservation(m, ReservationKind::Car, id, num, price)
    }

    /// Remove `num` cars with id `id`
    pub fn delete_car<M: Memory>(&self, m: &mut M, id: i64, num: i64) -> StmResult<bool> {
        self.add_reservation(m, ReservationKind::Car, id, -num, -1)
    }

    /// Add `num` seats on flight `id`
    pub fn add_flight<M: Memory>(
        &self,
        m: &mut M,
        id: i64,
        num: i64,
        price: i64,
    ) -> StmResult<bool> {
        self.add_reservation(m, ReservationKind::Flight, id, num, price)
    }

    /// Remove flight `id` entirely
    ///
    /// # Returns
    /// - `Ok(false)` if the flight is missing or any seat is reserved
    pub fn delete_flight<M: Memory>(&self, m: &mut M, id: i64) -> StmResult<bool> {
        let flight = match self.find_reservation(m, ReservationKind::Flight, id)? {
            Some(flight) => flight,
            None => return Ok(false),
        };
        if flight.used(m)? > 0 {
            return Ok(false);
        }
        let total = flight.total(m)?;
        self.add_reservation(m, ReservationKind::Flight, id, -total, -1)
    }

    /// Add `num` rooms with id `id`
    pub fn add_room<M: Memory>(
        &self,
        m: &mut M,
        id: i64,
        num: i64,
        price: i64,
    ) -> StmResult<bool> {
        self.add_reservation(m, ReservationKind::Room, id, num, price)
    }

    /// Remove `num` rooms with id `id`
    pub fn delete_room<M: Memory>(&self, m: &mut M, id: i64, num: i64) -> StmResult<bool> {
        self.add_reservation(m, ReservationKind::Room, id, -num, -1)
    }

    /// Register customer `id`
    ///
    /// # Returns
    /// - `Ok(false)` if the customer already exists
    pub fn add_customer<M: Memory>(&self, m: &mut M, id: i64) -> StmResult<bool> {
        if self.customers.contains(m, id)? {
            return Ok(false);
        }
        let customer = Customer::create(m, id)?;
        if !self.customers.insert(m, id, customer.addr())? {
            return m.restart();
        }
        Ok(true)
    }

    /// Cancel every reservation customer `id` holds and remove the customer
    ///
    /// # Returns
    /// - `Ok(false)` if the customer does not exist
    pub fn delete_customer<M: Memory>(&self, m: &mut M, id: i64) -> StmResult<bool> {
        let customer = match self.find_customer(m, id)? {
            Some(customer) => customer,
            None => return Ok(false),
        };

        for info in customer.reservations(m)? {
            let reservation = match self.find_reservation(m, info.kind, info.id)? {
                Some(reservation) => reservation,
                None => return m.restart(),
            };
            if !reservation.cancel(m)? {
                return m.restart();
            }
        }

        if !self.customers.remove(m, id)? {
            return m.restart();
        }
        customer.free(m)?;
        Ok(true)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Free units of resource `id`, or `-1` if it does not exist
    pub fn query_free<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
    ) -> StmResult<i64> {
        match self.find_reservation(m, kind, id)? {
            Some(reservation) => reservation.free_count(m),
            None => Ok(-1),
        }
    }

    /// Price of resource `id`, or `-1` if it does not exist
    pub fn query_price<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
    ) -> StmResult<i64> {
        match self.find_reservation(m, kind, id)? {
            Some(reservation) => reservation.price(m),
            None => Ok(-1),
        }
    }

    /// Total price of customer `id`'s reservations, or `-1` if the customer
    /// does not exist
    pub fn query_customer_bill<M: Memory>(&self, m: &mut M, id: i64) -> StmResult<i64> {
        match self.find_customer(m, id)? {
            Some(customer) => customer.bill(m),
            None => Ok(-1),
        }
    }

    /// Reservations held by customer `id`, if the customer exists
    pub fn customer_reservations<M: Memory>(
        &self,
        m: &mut M,
        id: i64,
    ) -> StmResult<Option<Vec<ReservationInfo>>> {
        match self.find_customer(m, id)? {
            Some(customer) => customer.reservations(m).map(Some),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Reservations
    // ========================================================================

    /// Reserve one unit of resource `id` for customer `customer_id`
    ///
    /// # Returns
    /// - `Ok(false)` if the customer or resource is missing, nothing is free,
    ///   or the customer already holds this resource
    pub fn reserve<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        customer_id: i64,
        id: i64,
    ) -> StmResult<bool> {
        let customer = match self.find_customer(m, customer_id)? {
            Some(customer) => customer,
            None => return Ok(false),
        };
        let reservation = match self.find_reservation(m, kind, id)? {
            Some(reservation) => reservation,
            None => return Ok(false),
        };
        if !reservation.make(m)? {
            return Ok(false);
        }
        let price = reservation.price(m)?;
        if !customer.add_info(m, kind, id, price)? {
            if !reservation.cancel(m)? {
                return m.restart();
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Give back customer `customer_id`'s unit of resource `id`
    ///
    /// # Returns
    /// - `Ok(false)` if the customer or resource is missing or the customer
    ///   does not hold this resource
    pub fn cancel<M: Memory>(
        &self,
        m: &mut M,
        kind: ReservationKind,
        customer_id: i64,
        id: i64,
    ) -> StmResult<bool> {
        let customer = match self.find_customer(m, customer_id)? {
            Some(customer) => customer,
            None => return Ok(false),
        };
        let reservation = match self.find_reservation(m, kind, id)? {
            Some(reservation) => reservation,
            None => return Ok(false),
        };
        if !reservation.cancel(m)? {
            return Ok(false);
        }
        if !customer.remove_info(m, kind, id)? {
            if !reservation.make(m)? {
                return m.restart();
            }
            return Ok(false);
        }
        Ok(true)
    }

    // ========================================================================
    // Whole-table operations
    // ========================================================================

    /// Scan every table and check the reservation invariants
    ///
    /// Every record must satisfy `used + free == total` with non-negative
    /// counts and price, its stored id must match its key, and its `used`
    /// count must equal the number of customers holding it.
    pub fn check_consistency<M: Memory>(&self, m: &mut M) -> StmResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        let mut holders: HashMap<(ReservationKind, i64), i64> = HashMap::new();

        let customers = self.customers.entries(m)?;
        report.customers = customers.len();
        for (id, addr) in customers {
            let customer = Customer::from_addr(addr);
            let stored = customer.id(m)?;
            if stored != id {
                report
                    .violations
                    .push(format!("customer {} is stored under key {}", stored, id));
            }
            for info in customer.reservations(m)? {
                *holders.entry((info.kind, info.id)).or_insert(0) += 1;
            }
        }

        for kind in ReservationKind::ALL {
            let entries = self.table(kind).entries(m)?;
            report.reservations[kind.index()] = entries.len();
            for (id, addr) in entries {
                let snap = Reservation::from_addr(addr).snapshot(m)?;
                check_reservation(&mut report, kind, id, &snap, &mut holders);
                report.reserved_units += snap.used;
            }
        }

        for ((kind, id), count) in holders {
            report.violations.push(format!(
                "{} customers hold {} {} which is not in its table",
                count, kind, id
            ));
        }

        debug!(
            target: "vacation::manager",
            customers = report.customers,
            cars = report.reservations[0],
            flights = report.reservations[1],
            rooms = report.reservations[2],
            violations = report.violations.len(),
            "consistency check"
        );
        Ok(report)
    }

    /// Release the four tables
    ///
    /// Records still stored in them are not freed; empty the tables first.
    pub fn destroy<M: Memory>(self, m: &mut M) -> StmResult<()> {
        for table in self.reservations {
            table.free(m)?;
        }
        self.customers.free(m)
    }

    /// Address of every table header
    pub fn table_addrs(&self) -> [Addr; 4] {
        [
            self.reservations[0].addr(),
            self.reservations[1].addr(),
            self.reservations[2].addr(),
            self.customers.addr(),
        ]
    }
}

fn check_reservation(
    report: &mut ConsistencyReport,
    kind: ReservationKind,
    key: i64,
    snap: &ReservationSnapshot,
    holders: &mut HashMap<(ReservationKind, i64), i64>,
) {
    if snap.id != key {
        report
            .violations
            .push(format!("{} {} is stored under key {}", kind, snap.id, key));
    }
    if !snap.is_consistent() {
        report.violations.push(format!(
            "{} {}: used {} + free {} != total {} (price {})",
            kind, key, snap.used, snap.free, snap.total, snap.price
        ));
    }
    let held = holders.remove(&(kind, key)).unwrap_or(0);
    if held != snap.used {
        report.violations.push(format!(
            "{} {}: {} units used but {} customers hold it",
            kind, key, snap.used, held
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Sequential;
    use stm_concurrency::Heap;

    fn setup(heap: &Heap) -> (Sequential<'_>, Manager) {
        let mut m = Sequential::new(heap);
        let manager = Manager::create(&mut m, 16).unwrap();
        (m, manager)
    }

    #[test]
    fn test_add_creates_then_grows() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);

        assert!(mgr.add_car(&mut m, 1, 100, 50).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Car, 1).unwrap(), 100);
        assert!(mgr.add_car(&mut m, 1, 100, 70).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Car, 1).unwrap(), 200);
        assert_eq!(mgr.query_price(&mut m, ReservationKind::Car, 1).unwrap(), 70);
    }

    #[test]
    fn test_add_rejects_invalid_creation() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        assert!(!mgr.add_room(&mut m, 1, 0, 50).unwrap());
        assert!(!mgr.add_room(&mut m, 1, 10, -1).unwrap());
        assert!(!mgr.delete_room(&mut m, 1, 10).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Room, 1).unwrap(), -1);
        assert_eq!(mgr.query_price(&mut m, ReservationKind::Room, 1).unwrap(), -1);
    }

    #[test]
    fn test_delete_to_zero_removes_record() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        let baseline = heap.live_blocks();

        mgr.add_room(&mut m, 3, 200, 60).unwrap();
        assert!(mgr.delete_room(&mut m, 3, 100).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Room, 3).unwrap(), 100);
        assert_eq!(mgr.query_price(&mut m, ReservationKind::Room, 3).unwrap(), 60);
        assert!(!mgr.delete_room(&mut m, 3, 101).unwrap());
        assert!(mgr.delete_room(&mut m, 3, 100).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Room, 3).unwrap(), -1);
        assert_eq!(heap.live_blocks(), baseline);
    }

    #[test]
    fn test_customers() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        assert!(mgr.add_customer(&mut m, 9).unwrap());
        assert!(!mgr.add_customer(&mut m, 9).unwrap());
        assert_eq!(mgr.query_customer_bill(&mut m, 9).unwrap(), 0);
        assert_eq!(mgr.query_customer_bill(&mut m, 10).unwrap(), -1);
        assert!(mgr.delete_customer(&mut m, 9).unwrap());
        assert!(!mgr.delete_customer(&mut m, 9).unwrap());
    }

    #[test]
    fn test_reserve_and_bill() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_car(&mut m, 1, 1, 50).unwrap();
        mgr.add_flight(&mut m, 2, 10, 80).unwrap();
        mgr.add_customer(&mut m, 7).unwrap();
        mgr.add_customer(&mut m, 8).unwrap();

        assert!(mgr.reserve(&mut m, ReservationKind::Car, 7, 1).unwrap());
        assert!(mgr.reserve(&mut m, ReservationKind::Flight, 7, 2).unwrap());
        assert_eq!(mgr.query_customer_bill(&mut m, 7).unwrap(), 130);

        // sold out
        assert!(!mgr.reserve(&mut m, ReservationKind::Car, 8, 1).unwrap());
        // already held: the unit taken for the attempt is given back
        assert!(!mgr.reserve(&mut m, ReservationKind::Flight, 7, 2).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Flight, 2).unwrap(), 9);
        // missing customer or resource
        assert!(!mgr.reserve(&mut m, ReservationKind::Flight, 99, 2).unwrap());
        assert!(!mgr.reserve(&mut m, ReservationKind::Room, 7, 2).unwrap());

        assert!(mgr.check_consistency(&mut m).unwrap().is_consistent());
    }

    #[test]
    fn test_bill_keeps_price_paid() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_room(&mut m, 1, 5, 60).unwrap();
        mgr.add_customer(&mut m, 1).unwrap();
        mgr.reserve(&mut m, ReservationKind::Room, 1, 1).unwrap();
        mgr.add_room(&mut m, 1, 5, 90).unwrap();
        assert_eq!(mgr.query_customer_bill(&mut m, 1).unwrap(), 60);
    }

    #[test]
    fn test_cancel() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_car(&mut m, 1, 2, 50).unwrap();
        mgr.add_car(&mut m, 2, 2, 50).unwrap();
        mgr.add_customer(&mut m, 1).unwrap();
        mgr.reserve(&mut m, ReservationKind::Car, 1, 1).unwrap();
        mgr.add_customer(&mut m, 2).unwrap();
        mgr.reserve(&mut m, ReservationKind::Car, 2, 2).unwrap();

        // customer 1 does not hold car 2: the released unit is taken back
        assert!(!mgr.cancel(&mut m, ReservationKind::Car, 1, 2).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Car, 2).unwrap(), 1);

        assert!(mgr.cancel(&mut m, ReservationKind::Car, 1, 1).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Car, 1).unwrap(), 2);
        assert_eq!(mgr.query_customer_bill(&mut m, 1).unwrap(), 0);
        assert!(mgr.check_consistency(&mut m).unwrap().is_consistent());
    }

    #[test]
    fn test_delete_flight_requires_no_seats_taken() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_flight(&mut m, 4, 300, 100).unwrap();
        mgr.add_customer(&mut m, 1).unwrap();
        mgr.reserve(&mut m, ReservationKind::Flight, 1, 4).unwrap();

        assert!(!mgr.delete_flight(&mut m, 4).unwrap());
        assert!(!mgr.delete_flight(&mut m, 5).unwrap());
        mgr.delete_customer(&mut m, 1).unwrap();
        assert!(mgr.delete_flight(&mut m, 4).unwrap());
        assert_eq!(mgr.query_free(&mut m, ReservationKind::Flight, 4).unwrap(), -1);
    }

    #[test]
    fn test_delete_customer_releases_reservations() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        for kind in ReservationKind::ALL {
            mgr.add_reservation(&mut m, kind, 1, 100, 50).unwrap();
        }
        mgr.add_customer(&mut m, 3).unwrap();
        for kind in ReservationKind::ALL {
            assert!(mgr.reserve(&mut m, kind, 3, 1).unwrap());
        }
        assert_eq!(mgr.check_consistency(&mut m).unwrap().reserved_units, 3);

        assert!(mgr.delete_customer(&mut m, 3).unwrap());
        for kind in ReservationKind::ALL {
            assert_eq!(mgr.query_free(&mut m, kind, 1).unwrap(), 100);
        }
        let report = mgr.check_consistency(&mut m).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.customers, 0);
        assert_eq!(report.reserved_units, 0);
    }

    #[test]
    fn test_consistency_check_finds_corruption() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_car(&mut m, 1, 10, 50).unwrap();
        let addr = mgr.table(ReservationKind::Car).find(&mut m, 1).unwrap().unwrap();
        // used count with no customer behind it
        m.set(addr.offset(1), 1i64);
        m.set(addr.offset(2), 9i64);

        let report = mgr.check_consistency(&mut m).unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].contains("car 1"));
    }

    #[test]
    fn test_destroy_after_emptying_frees_everything() {
        let heap = Heap::new(12, 4);
        let (mut m, mgr) = setup(&heap);
        mgr.add_car(&mut m, 1, 100, 50).unwrap();
        mgr.add_customer(&mut m, 1).unwrap();
        mgr.reserve(&mut m, ReservationKind::Car, 1, 1).unwrap();

        mgr.delete_customer(&mut m, 1).unwrap();
        let free = mgr.query_free(&mut m, ReservationKind::Car, 1).unwrap();
        mgr.delete_car(&mut m, 1, free).unwrap();
        mgr.destroy(&mut m).unwrap();
        assert_eq!(heap.live_blocks(), 0);
    }
}
