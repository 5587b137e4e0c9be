//! Transactional heap
//!
//! All memory a transaction can touch lives here, one 64-bit word per `Addr`.
//! The heap is a fixed array of segments, each materialized on first use, and
//! a bump pointer that only moves forward. Freed blocks go onto size-segregated
//! free lists and are handed out again LIFO, so a transaction that releases an
//! allocation on restart gets the same address on its next attempt.
//!
//! ## Block layout
//!
//! ```text
//! [ header ][ payload word 0 ] ... [ payload word n-1 ]
//!             ^ Addr returned to the caller
//!
//! header: [ tag: 16 ][ payload size in words: 47 ][ live: 1 ]
//! ```
//!
//! A block never spans two segments, and the first block's header sits at
//! word 0, so `Addr::NULL` is never a payload address. `free` checks the tag
//! and the live bit, so freeing an address that does not start a block, or
//! freeing a block twice, panics instead of corrupting the free lists.
//!
//! Freed payloads are not cleared. `load`/`store` bypass the transactional
//! barriers and are meant for single-threaded setup and teardown only.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use stm_core::{Addr, StmError, StmResult};
use tracing::{debug, warn};

const HEADER_WORDS: u64 = 1;
const HEADER_TAG: u64 = 0xB10C << 48;
const TAG_MASK: u64 = 0xFFFF << 48;
const LIVE_BIT: u64 = 1;
const SIZE_MASK: u64 = !TAG_MASK & !LIVE_BIT;

/// Point-in-time heap counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Total capacity in words
    pub capacity_words: usize,
    /// Words ever carved off by the bump pointer (headers included)
    pub reserved_words: usize,
    /// Blocks currently handed out
    pub live_blocks: usize,
    /// Blocks parked on free lists
    pub free_blocks: usize,
}

/// Segmented word arena with a size-segregated allocator
pub struct Heap {
    segments: Box<[OnceCell<Box<[AtomicU64]>>]>,
    segment_bits: u32,
    next: AtomicU64,
    free_lists: Mutex<FxHashMap<u64, Vec<Addr>>>,
    live_blocks: AtomicUsize,
}

impl Heap {
    /// Create a heap of `segments` segments of `1 << segment_bits` words each
    ///
    /// No memory is committed until a segment is first allocated from.
    pub fn new(segment_bits: u32, segments: usize) -> Self {
        let cells = (0..segments).map(|_| OnceCell::new()).collect::<Vec<_>>();
        Heap {
            segments: cells.into_boxed_slice(),
            segment_bits,
            next: AtomicU64::new(0),
            free_lists: Mutex::new(FxHashMap::default()),
            live_blocks: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn segment_words(&self) -> u64 {
        1u64 << self.segment_bits
    }

    /// Total capacity in words
    pub fn capacity_words(&self) -> usize {
        self.segments.len() << self.segment_bits
    }

    /// Largest payload a single block can hold
    pub fn max_block_words(&self) -> usize {
        (self.segment_words() - HEADER_WORDS) as usize
    }

    /// Allocate a block of at least `words` payload words
    ///
    /// Zero-word requests are rounded up to one word so every block has a
    /// distinct address.
    pub fn allocate(&self, words: usize) -> StmResult<Addr> {
        let size = words.max(1) as u64;
        if size > self.max_block_words() as u64 {
            return Err(StmError::BlockTooLarge {
                requested: words,
                max: self.max_block_words(),
            });
        }

        if let Some(addr) = self.pop_free(size) {
            self.header(addr).fetch_or(LIVE_BIT, Ordering::AcqRel);
            self.live_blocks.fetch_add(1, Ordering::Relaxed);
            return Ok(addr);
        }

        let header = self.bump(size + HEADER_WORDS)?;
        self.ensure_segment(header);
        self.cell(header).store(HEADER_TAG | (size << 1) | LIVE_BIT, Ordering::Release);
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(Addr::new(header + HEADER_WORDS))
    }

    /// Return a block to its free list
    ///
    /// The caller guarantees no transaction can still reach the block.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not the start of a block or the block is already
    /// free.
    pub fn free(&self, addr: Addr) {
        let header = self.header(addr);
        let previous = header.fetch_and(!LIVE_BIT, Ordering::AcqRel);
        assert!(previous & LIVE_BIT != 0, "double free of block {}", addr);
        let size = (previous & SIZE_MASK) >> 1;
        self.free_lists.lock().entry(size).or_default().push(addr);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Payload size of the block starting at `addr`
    pub fn block_size(&self, addr: Addr) -> usize {
        ((self.header(addr).load(Ordering::Acquire) & SIZE_MASK) >> 1) as usize
    }

    /// Whether the block starting at `addr` is currently handed out
    pub fn is_live(&self, addr: Addr) -> bool {
        self.header(addr).load(Ordering::Acquire) & LIVE_BIT != 0
    }

    /// The atomic cell backing `addr`
    ///
    /// Panics if `addr` was never carved out of the heap.
    #[inline]
    pub fn word(&self, addr: Addr) -> &AtomicU64 {
        self.cell(addr.index())
    }

    /// Non-transactional load for setup and teardown
    pub fn load(&self, addr: Addr) -> u64 {
        self.word(addr).load(Ordering::Acquire)
    }

    /// Non-transactional store for setup and teardown
    pub fn store(&self, addr: Addr, value: u64) {
        self.word(addr).store(value, Ordering::Release);
    }

    /// Blocks currently handed out and not yet freed
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// Snapshot of the heap counters
    pub fn stats(&self) -> HeapStats {
        let free_blocks = self.free_lists.lock().values().map(Vec::len).sum();
        HeapStats {
            capacity_words: self.capacity_words(),
            reserved_words: self.next.load(Ordering::Relaxed) as usize,
            live_blocks: self.live_blocks(),
            free_blocks,
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Header word of the block starting at `addr`
    fn header(&self, addr: Addr) -> &AtomicU64 {
        assert!(!addr.is_null(), "block header of the null address");
        let header = self.cell(addr.index() - HEADER_WORDS);
        assert!(
            header.load(Ordering::Acquire) & TAG_MASK == HEADER_TAG,
            "{} is not the start of a block",
            addr
        );
        header
    }

    fn pop_free(&self, size: u64) -> Option<Addr> {
        self.free_lists.lock().get_mut(&size).and_then(Vec::pop)
    }

    /// Carve `total` words off the bump pointer, skipping to the next segment
    /// when the block would straddle a boundary
    fn bump(&self, total: u64) -> StmResult<u64> {
        let capacity = self.capacity_words() as u64;
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let mut start = current;
            if (start >> self.segment_bits) != ((start + total - 1) >> self.segment_bits) {
                start = ((start >> self.segment_bits) + 1) << self.segment_bits;
            }
            let end = start + total;
            if end > capacity {
                warn!(
                    target: "stm::heap",
                    requested = total,
                    capacity,
                    "transactional heap exhausted"
                );
                return Err(StmError::HeapExhausted {
                    requested: total as usize,
                    capacity: capacity as usize,
                });
            }
            match self
                .next
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(start),
                Err(observed) => current = observed,
            }
        }
    }

    fn ensure_segment(&self, index: u64) {
        let segment = (index >> self.segment_bits) as usize;
        self.segments[segment].get_or_init(|| {
            debug!(target: "stm::heap", segment, words = self.segment_words(), "segment materialized");
            (0..self.segment_words())
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
    }

    #[inline]
    fn cell(&self, index: u64) -> &AtomicU64 {
        let segment = (index >> self.segment_bits) as usize;
        let offset = (index & (self.segment_words() - 1)) as usize;
        match self.segments.get(segment).and_then(OnceCell::get) {
            Some(words) => &words[offset],
            None => panic!("address @{} is outside the allocated heap", index),
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("segment_bits", &self.segment_bits)
            .field("segments", &self.segments.len())
            .field("stats", &self.stats())
            .finish()
    }
}
