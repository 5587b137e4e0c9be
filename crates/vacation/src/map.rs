//! Transactional hash map from `i64` keys to heap addresses
//!
//! Tables key reservations and customers by id. The map is a fixed-size array
//! of bucket heads with chained nodes, all in heap words:
//!
//! ```text
//! header: [ bucket count ][ bucket array ]
//! bucket array: [ head 0 ] ... [ head n-1 ]
//! node: [ key ][ value ][ next ]
//! ```
//!
//! There is no element counter. A shared size word would be written by every
//! insert and remove and turn unrelated updates into conflicts.

use crate::memory::Memory;
use stm_core::{Addr, StmResult};

const HEADER_BUCKETS: u64 = 0;
const HEADER_ARRAY: u64 = 1;
const HEADER_WORDS: usize = 2;

const NODE_KEY: u64 = 0;
const NODE_VALUE: u64 = 1;
const NODE_NEXT: u64 = 2;
const NODE_WORDS: usize = 3;

/// Handle to a map in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxMap(Addr);

impl TxMap {
    /// Number of buckets for `expected` entries when a block holds at most
    /// `max_block_words` words
    ///
    /// Always a power of two.
    pub fn bucket_count_for(expected: usize, max_block_words: usize) -> usize {
        let wanted = expected.max(1).next_power_of_two();
        let max = max_block_words.max(1);
        let limit = 1usize << (usize::BITS - 1 - max.leading_zeros());
        wanted.min(limit)
    }

    /// Allocate an empty map with `buckets` buckets
    ///
    /// # Panics
    /// If `buckets` is not a power of two.
    pub fn create<M: Memory>(m: &mut M, buckets: usize) -> StmResult<Self> {
        assert!(
            buckets.is_power_of_two(),
            "bucket count {} is not a power of two",
            buckets
        );
        let array = m.alloc(buckets)?;
        for i in 0..buckets as u64 {
            m.set(array.offset(i), Addr::NULL);
        }
        let header = m.alloc(HEADER_WORDS)?;
        m.set(header.offset(HEADER_BUCKETS), buckets as u64);
        m.set(header.offset(HEADER_ARRAY), array);
        Ok(TxMap(header))
    }

    /// Address of the header
    pub fn addr(self) -> Addr {
        self.0
    }

    fn bucket<M: Memory>(self, m: &mut M, key: i64) -> StmResult<Addr> {
        let buckets: u64 = m.get(self.0.offset(HEADER_BUCKETS))?;
        let array: Addr = m.get(self.0.offset(HEADER_ARRAY))?;
        Ok(array.offset(bucket_index(key, buckets)))
    }

    /// Value stored under `key`
    pub fn find<M: Memory>(self, m: &mut M, key: i64) -> StmResult<Option<Addr>> {
        let bucket = self.bucket(m, key)?;
        let mut node: Addr = m.get(bucket)?;
        while !node.is_null() {
            if m.get::<i64>(node.offset(NODE_KEY))? == key {
                return m.get(node.offset(NODE_VALUE)).map(Some);
            }
            node = m.get(node.offset(NODE_NEXT))?;
        }
        Ok(None)
    }

    /// Whether `key` is present
    pub fn contains<M: Memory>(self, m: &mut M, key: i64) -> StmResult<bool> {
        Ok(self.find(m, key)?.is_some())
    }

    /// Insert `key -> value`
    ///
    /// # Returns
    /// - `Ok(false)` if `key` is already present; the map is unchanged
    pub fn insert<M: Memory>(self, m: &mut M, key: i64, value: Addr) -> StmResult<bool> {
        let bucket = self.bucket(m, key)?;
        let head: Addr = m.get(bucket)?;
        let mut node = head;
        while !node.is_null() {
            if m.get::<i64>(node.offset(NODE_KEY))? == key {
                return Ok(false);
            }
            node = m.get(node.offset(NODE_NEXT))?;
        }

        let fresh = m.alloc(NODE_WORDS)?;
        m.set(fresh.offset(NODE_KEY), key);
        m.set(fresh.offset(NODE_VALUE), value);
        m.set(fresh.offset(NODE_NEXT), head);
        m.set(bucket, fresh);
        Ok(true)
    }

    /// Remove `key`
    ///
    /// The stored value is not freed.
    ///
    /// # Returns
    /// - `Ok(false)` if `key` was not present
    pub fn remove<M: Memory>(self, m: &mut M, key: i64) -> StmResult<bool> {
        let mut link = self.bucket(m, key)?;
        let mut node: Addr = m.get(link)?;
        while !node.is_null() {
            let next: Addr = m.get(node.offset(NODE_NEXT))?;
            if m.get::<i64>(node.offset(NODE_KEY))? == key {
                m.set(link, next);
                m.free(node);
                return Ok(true);
            }
            link = node.offset(NODE_NEXT);
            node = next;
        }
        Ok(false)
    }

    /// Every entry, bucket by bucket
    pub fn entries<M: Memory>(self, m: &mut M) -> StmResult<Vec<(i64, Addr)>> {
        let buckets: u64 = m.get(self.0.offset(HEADER_BUCKETS))?;
        let array: Addr = m.get(self.0.offset(HEADER_ARRAY))?;
        let mut out = Vec::new();
        for i in 0..buckets {
            let mut node: Addr = m.get(array.offset(i))?;
            while !node.is_null() {
                out.push((m.get(node.offset(NODE_KEY))?, m.get(node.offset(NODE_VALUE))?));
                node = m.get(node.offset(NODE_NEXT))?;
            }
        }
        Ok(out)
    }

    /// Number of entries
    ///
    /// Walks every bucket.
    pub fn len<M: Memory>(self, m: &mut M) -> StmResult<usize> {
        Ok(self.entries(m)?.len())
    }

    /// Release the bucket array, the header and every remaining node
    ///
    /// Values are left alone.
    pub fn free<M: Memory>(self, m: &mut M) -> StmResult<()> {
        let buckets: u64 = m.get(self.0.offset(HEADER_BUCKETS))?;
        let array: Addr = m.get(self.0.offset(HEADER_ARRAY))?;
        for i in 0..buckets {
            let mut node: Addr = m.get(array.offset(i))?;
            while !node.is_null() {
                let next = m.get(node.offset(NODE_NEXT))?;
                m.free(node);
                node = next;
            }
        }
        m.free(array);
        m.free(self.0);
        Ok(())
    }
}

#[inline]
fn bucket_index(key: i64, buckets: u64) -> u64 {
    let hash = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (hash >> 32) & (buckets - 1)
}
