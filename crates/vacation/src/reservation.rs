//! Reservable resources
//!
//! A reservation is one car, flight or room record: how many units exist, how
//! many are taken, and the current price. It lives in five heap words:
//!
//! ```text
//! [ id ][ used ][ free ][ total ][ price ]
//! ```
//!
//! Every operation keeps `used + free == total` with all counts non-negative.

use crate::memory::Memory;
use serde::{Deserialize, Serialize};
use std::fmt;
use stm_core::{Addr, StmResult};

const ID: u64 = 0;
const USED: u64 = 1;
const FREE: u64 = 2;
const TOTAL: u64 = 3;
const PRICE: u64 = 4;
const WORDS: usize = 5;

/// Which table a reservation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum ReservationKind {
    /// Rental cars
    Car = 0,
    /// Flight seats
    Flight = 1,
    /// Hotel rooms
    Room = 2,
}

impl ReservationKind {
    /// All kinds, in table order
    pub const ALL: [ReservationKind; 3] = [
        ReservationKind::Car,
        ReservationKind::Flight,
        ReservationKind::Room,
    ];

    /// Position of this kind in `ALL`
    pub fn index(self) -> usize {
        self as usize
    }

    /// Kind for a table position, if in range
    pub fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(ReservationKind::Car),
            1 => Some(ReservationKind::Flight),
            2 => Some(ReservationKind::Room),
            _ => None,
        }
    }

    /// Lower-case name
    pub fn name(self) -> &'static str {
        match self {
            ReservationKind::Car => "car",
            ReservationKind::Flight => "flight",
            ReservationKind::Room => "room",
        }
    }
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plain copy of a reservation's fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSnapshot {
    /// Resource id within its table
    pub id: i64,
    /// Units reserved by customers
    pub used: i64,
    /// Units still available
    pub free: i64,
    /// Units in existence
    pub total: i64,
    /// Current price per unit
    pub price: i64,
}

impl ReservationSnapshot {
    /// Whether the counts satisfy the reservation invariant
    pub fn is_consistent(&self) -> bool {
        self.used >= 0
            && self.free >= 0
            && self.total >= 0
            && self.used + self.free == self.total
            && self.price >= 0
    }
}

/// Handle to a reservation record in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation(Addr);

impl Reservation {
    /// Wrap the address of an existing record
    pub fn from_addr(addr: Addr) -> Self {
        Reservation(addr)
    }

    /// Address of the record
    pub fn addr(self) -> Addr {
        self.0
    }

    /// Allocate a record with `total` free units at `price`
    pub fn create<M: Memory>(m: &mut M, id: i64, total: i64, price: i64) -> StmResult<Self> {
        let addr = m.alloc(WORDS)?;
        m.set(addr.offset(ID), id);
        m.set(addr.offset(USED), 0i64);
        m.set(addr.offset(FREE), total);
        m.set(addr.offset(TOTAL), total);
        m.set(addr.offset(PRICE), price);
        Ok(Reservation(addr))
    }

    /// Release the record
    pub fn free<M: Memory>(self, m: &mut M) {
        m.free(self.0);
    }

    fn field<M: Memory>(self, m: &mut M, offset: u64) -> StmResult<i64> {
        m.get(self.0.offset(offset))
    }

    /// Resource id
    pub fn id<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        self.field(m, ID)
    }

    /// Units reserved by customers
    pub fn used<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        self.field(m, USED)
    }

    /// Units still available
    pub fn free_count<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        self.field(m, FREE)
    }

    /// Units in existence
    pub fn total<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        self.field(m, TOTAL)
    }

    /// Price per unit
    pub fn price<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        self.field(m, PRICE)
    }

    /// Read every field
    pub fn snapshot<M: Memory>(self, m: &mut M) -> StmResult<ReservationSnapshot> {
        Ok(ReservationSnapshot {
            id: self.id(m)?,
            used: self.used(m)?,
            free: self.free_count(m)?,
            total: self.total(m)?,
            price: self.price(m)?,
        })
    }

    /// Change the number of units by `delta`
    ///
    /// # Returns
    /// - `Ok(false)` if removing units would take more than are free
    pub fn add_to_total<M: Memory>(self, m: &mut M, delta: i64) -> StmResult<bool> {
        let free = self.free_count(m)?;
        if free + delta < 0 {
            return Ok(false);
        }
        let total = self.total(m)?;
        m.set(self.0.offset(FREE), free + delta);
        m.set(self.0.offset(TOTAL), total + delta);
        self.check(m)?;
        Ok(true)
    }

    /// Take one free unit
    ///
    /// # Returns
    /// - `Ok(false)` if nothing is free
    pub fn make<M: Memory>(self, m: &mut M) -> StmResult<bool> {
        let free = self.free_count(m)?;
        if free < 1 {
            return Ok(false);
        }
        let used = self.used(m)?;
        m.set(self.0.offset(USED), used + 1);
        m.set(self.0.offset(FREE), free - 1);
        self.check(m)?;
        Ok(true)
    }

    /// Give back one used unit
    ///
    /// # Returns
    /// - `Ok(false)` if nothing is in use
    pub fn cancel<M: Memory>(self, m: &mut M) -> StmResult<bool> {
        let used = self.used(m)?;
        if used < 1 {
            return Ok(false);
        }
        let free = self.free_count(m)?;
        m.set(self.0.offset(USED), used - 1);
        m.set(self.0.offset(FREE), free + 1);
        self.check(m)?;
        Ok(true)
    }

    /// Set a new price
    ///
    /// # Returns
    /// - `Ok(false)` for a negative price, which leaves the old one in place
    pub fn update_price<M: Memory>(self, m: &mut M, price: i64) -> StmResult<bool> {
        if price < 0 {
            return Ok(false);
        }
        m.set(self.0.offset(PRICE), price);
        Ok(true)
    }

    // A broken invariant here can only come from a doomed attempt's view.
    fn check<M: Memory>(self, m: &mut M) -> StmResult<()> {
        if self.snapshot(m)?.is_consistent() {
            Ok(())
        } else {
            m.restart()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Sequential;
    use stm_concurrency::Heap;

    fn heap() -> Heap {
        Heap::new(10, 4)
    }

    #[test]
    fn test_create_is_all_free() {
        let heap = heap();
        let mut m = Sequential::new(&heap);
        let r = Reservation::create(&mut m, 7, 300, 60).unwrap();
        let snap = r.snapshot(&mut m).unwrap();
        assert_eq!(
            snap,
            ReservationSnapshot {
                id: 7,
                used: 0,
                free: 300,
                total: 300,
                price: 60
            }
        );
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_make_and_cancel() {
        let heap = heap();
        let mut m = Sequential::new(&heap);
        let r = Reservation::create(&mut m, 1, 1, 50).unwrap();

        assert!(r.make(&mut m).unwrap());
        assert!(!r.make(&mut m).unwrap());
        assert_eq!(r.used(&mut m).unwrap(), 1);
        assert_eq!(r.free_count(&mut m).unwrap(), 0);

        assert!(r.cancel(&mut m).unwrap());
        assert!(!r.cancel(&mut m).unwrap());
        assert_eq!(r.free_count(&mut m).unwrap(), 1);
    }

    #[test]
    fn test_add_to_total_cannot_remove_used_units() {
        let heap = heap();
        let mut m = Sequential::new(&heap);
        let r = Reservation::create(&mut m, 1, 100, 50).unwrap();
        assert!(r.make(&mut m).unwrap());

        assert!(!r.add_to_total(&mut m, -100).unwrap());
        assert_eq!(r.total(&mut m).unwrap(), 100);

        assert!(r.add_to_total(&mut m, -99).unwrap());
        assert_eq!(r.total(&mut m).unwrap(), 1);
        assert_eq!(r.free_count(&mut m).unwrap(), 0);

        assert!(r.add_to_total(&mut m, 100).unwrap());
        assert_eq!(r.snapshot(&mut m).unwrap().free, 100);
    }

    #[test]
    fn test_negative_price_is_rejected() {
        let heap = heap();
        let mut m = Sequential::new(&heap);
        let r = Reservation::create(&mut m, 1, 100, 50).unwrap();
        assert!(!r.update_price(&mut m, -1).unwrap());
        assert_eq!(r.price(&mut m).unwrap(), 50);
        assert!(r.update_price(&mut m, 80).unwrap());
        assert_eq!(r.price(&mut m).unwrap(), 80);
    }

    #[test]
    fn test_corrupted_record_restarts() {
        let heap = heap();
        let mut m = Sequential::new(&heap);
        let r = Reservation::create(&mut m, 1, 10, 50).unwrap();
        m.set(r.addr().offset(USED), 3i64);
        assert!(r.make(&mut m).is_err());
    }

    #[test]
    fn test_kind_index_roundtrip() {
        for kind in ReservationKind::ALL {
            assert_eq!(ReservationKind::from_index(kind.index() as u64), Some(kind));
        }
        assert_eq!(ReservationKind::from_index(3), None);
        assert_eq!(ReservationKind::Flight.to_string(), "flight");
    }
}
