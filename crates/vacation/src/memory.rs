//! Word access for the reservation tables
//!
//! Every table operation is written once against [`Memory`]. Client threads
//! run them through a [`Transaction`]; population before the clients start
//! and teardown after they join run them through [`Sequential`], which goes
//! straight to the heap without barriers.

use stm_concurrency::{Heap, Transaction};
use stm_core::{Addr, StmError, StmResult, Word};

/// Word-level access to the transactional heap
pub trait Memory {
    /// Load one word
    fn load(&mut self, addr: Addr) -> StmResult<u64>;

    /// Store one word
    fn store(&mut self, addr: Addr, value: u64);

    /// Allocate a block of `words` words
    fn alloc(&mut self, words: usize) -> StmResult<Addr>;

    /// Release a block
    fn free(&mut self, addr: Addr);

    /// Give up on the current operation because the tables were observed in
    /// a state no committed execution can produce
    fn restart<T>(&mut self) -> StmResult<T>;

    /// Load a typed value
    fn get<W: Word>(&mut self, addr: Addr) -> StmResult<W> {
        self.load(addr).map(W::from_word)
    }

    /// Store a typed value
    fn set<W: Word>(&mut self, addr: Addr, value: W) {
        self.store(addr, value.into_word());
    }
}

impl Memory for Transaction<'_> {
    #[inline]
    fn load(&mut self, addr: Addr) -> StmResult<u64> {
        self.read_word(addr)
    }

    #[inline]
    fn store(&mut self, addr: Addr, value: u64) {
        self.write_word(addr, value);
    }

    fn alloc(&mut self, words: usize) -> StmResult<Addr> {
        self.allocate(words)
    }

    fn free(&mut self, addr: Addr) {
        self.deallocate(addr);
    }

    fn restart<T>(&mut self) -> StmResult<T> {
        self.retry()
    }
}

/// Barrier-free access for single-threaded setup and teardown
#[derive(Debug, Clone, Copy)]
pub struct Sequential<'a> {
    heap: &'a Heap,
}

impl<'a> Sequential<'a> {
    /// Wrap a heap no other thread is using
    pub fn new(heap: &'a Heap) -> Self {
        Sequential { heap }
    }
}

impl Memory for Sequential<'_> {
    fn load(&mut self, addr: Addr) -> StmResult<u64> {
        Ok(self.heap.load(addr))
    }

    fn store(&mut self, addr: Addr, value: u64) {
        self.heap.store(addr, value);
    }

    fn alloc(&mut self, words: usize) -> StmResult<Addr> {
        self.heap.allocate(words)
    }

    fn free(&mut self, addr: Addr) {
        self.heap.free(addr);
    }

    fn restart<T>(&mut self) -> StmResult<T> {
        Err(StmError::Aborted(
            "inconsistent tables during sequential access".to_string(),
        ))
    }
}
