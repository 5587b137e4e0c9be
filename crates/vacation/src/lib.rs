//! Travel reservation benchmark on the word-based STM
//!
//! Client threads book cars, flights and rooms for customers against four
//! transactional tables kept entirely in the STM heap:
//! - Reservation: per-resource unit counts and price
//! - Customer: the reservations a customer holds
//! - TxMap: id-keyed hash tables
//! - Manager: the operations clients run
//! - Client / Benchmark: workload generation and the run lifecycle
//!
//! Table code is written once against [`Memory`] and runs either inside a
//! transaction or, during population and teardown, directly on the heap.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod client;
pub mod config;
pub mod customer;
pub mod driver;
pub mod error;
pub mod manager;
pub mod map;
pub mod memory;
pub mod reservation;

pub use client::{Action, Client, ClientStats};
pub use config::VacationConfig;
pub use customer::{Customer, ReservationInfo};
pub use driver::{Benchmark, RunReport, TeardownReport};
pub use error::{VacationError, VacationResult};
pub use manager::{ConsistencyReport, Manager};
pub use map::TxMap;
pub use memory::{Memory, Sequential};
pub use reservation::{Reservation, ReservationKind, ReservationSnapshot};
