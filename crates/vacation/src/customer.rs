//! Customers and the reservations they hold
//!
//! A customer record is two words, `[ id ][ list head ]`. The list holds one
//! node per reservation the customer has made, sorted by `(kind, id)`:
//!
//! ```text
//! [ kind ][ id ][ price ][ next ]
//! ```
//!
//! The price is the one charged when the reservation was made, so later price
//! updates on the resource do not change a customer's bill.

use crate::memory::Memory;
use crate::reservation::ReservationKind;
use serde::{Deserialize, Serialize};
use stm_core::{Addr, StmResult};

const CUSTOMER_ID: u64 = 0;
const CUSTOMER_HEAD: u64 = 1;
const CUSTOMER_WORDS: usize = 2;

const INFO_KIND: u64 = 0;
const INFO_ID: u64 = 1;
const INFO_PRICE: u64 = 2;
const INFO_NEXT: u64 = 3;
const INFO_WORDS: usize = 4;

/// One reservation held by a customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    /// Table the reservation is in
    pub kind: ReservationKind,
    /// Resource id within that table
    pub id: i64,
    /// Price paid
    pub price: i64,
}

/// Handle to a customer record in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Customer(Addr);

impl Customer {
    /// Wrap the address of an existing record
    pub fn from_addr(addr: Addr) -> Self {
        Customer(addr)
    }

    /// Address of the record
    pub fn addr(self) -> Addr {
        self.0
    }

    /// Allocate a customer with no reservations
    pub fn create<M: Memory>(m: &mut M, id: i64) -> StmResult<Self> {
        let addr = m.alloc(CUSTOMER_WORDS)?;
        m.set(addr.offset(CUSTOMER_ID), id);
        m.set(addr.offset(CUSTOMER_HEAD), Addr::NULL);
        Ok(Customer(addr))
    }

    /// Customer id
    pub fn id<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        m.get(self.0.offset(CUSTOMER_ID))
    }

    fn head<M: Memory>(self, m: &mut M) -> StmResult<Addr> {
        m.get(self.0.offset(CUSTOMER_HEAD))
    }

    /// Record a new reservation
    ///
    /// # Returns
    /// - `Ok(false)` if the customer already holds `(kind, id)`
    pub fn add_info<M: Memory>(
        self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
        price: i64,
    ) -> StmResult<bool> {
        let key = (kind.index() as u64, id);
        let mut link = self.0.offset(CUSTOMER_HEAD);
        let mut node: Addr = m.get(link)?;
        while !node.is_null() {
            let node_key = (
                m.load(node.offset(INFO_KIND))?,
                m.get::<i64>(node.offset(INFO_ID))?,
            );
            if node_key == key {
                return Ok(false);
            }
            if node_key > key {
                break;
            }
            link = node.offset(INFO_NEXT);
            node = m.get(link)?;
        }

        let info = m.alloc(INFO_WORDS)?;
        m.store(info.offset(INFO_KIND), key.0);
        m.set(info.offset(INFO_ID), id);
        m.set(info.offset(INFO_PRICE), price);
        m.set(info.offset(INFO_NEXT), node);
        m.set(link, info);
        Ok(true)
    }

    /// Drop a reservation from the list
    ///
    /// # Returns
    /// - `Ok(false)` if the customer does not hold `(kind, id)`
    pub fn remove_info<M: Memory>(
        self,
        m: &mut M,
        kind: ReservationKind,
        id: i64,
    ) -> StmResult<bool> {
        let key = (kind.index() as u64, id);
        let mut link = self.0.offset(CUSTOMER_HEAD);
        let mut node: Addr = m.get(link)?;
        while !node.is_null() {
            let node_key = (
                m.load(node.offset(INFO_KIND))?,
                m.get::<i64>(node.offset(INFO_ID))?,
            );
            if node_key == key {
                let next: Addr = m.get(node.offset(INFO_NEXT))?;
                m.set(link, next);
                m.free(node);
                return Ok(true);
            }
            if node_key > key {
                break;
            }
            link = node.offset(INFO_NEXT);
            node = m.get(link)?;
        }
        Ok(false)
    }

    /// Reservations held, in `(kind, id)` order
    pub fn reservations<M: Memory>(self, m: &mut M) -> StmResult<Vec<ReservationInfo>> {
        let mut out = Vec::new();
        let mut node = self.head(m)?;
        while !node.is_null() {
            let raw_kind = m.load(node.offset(INFO_KIND))?;
            let kind = match ReservationKind::from_index(raw_kind) {
                Some(kind) => kind,
                None => return m.restart(),
            };
            out.push(ReservationInfo {
                kind,
                id: m.get(node.offset(INFO_ID))?,
                price: m.get(node.offset(INFO_PRICE))?,
            });
            node = m.get(node.offset(INFO_NEXT))?;
        }
        Ok(out)
    }

    /// Sum of the prices paid for every reservation held
    pub fn bill<M: Memory>(self, m: &mut M) -> StmResult<i64> {
        let mut bill = 0;
        let mut node = self.head(m)?;
        while !node.is_null() {
            bill += m.get::<i64>(node.offset(INFO_PRICE))?;
            node = m.get(node.offset(INFO_NEXT))?;
        }
        Ok(bill)
    }

    /// Release the record and every remaining list node
    pub fn free<M: Memory>(self, m: &mut M) -> StmResult<()> {
        let mut node = self.head(m)?;
        while !node.is_null() {
            let next = m.get(node.offset(INFO_NEXT))?;
            m.free(node);
            node = next;
        }
        m.free(self.0);
        Ok(())
    }
}
