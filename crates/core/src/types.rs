//! Core types for the STM runtime
//!
//! This module defines the foundational vocabulary shared by the engine and
//! the applications built on it:
//! - Addr: name of one word of transactional memory
//! - ThreadId: identity of a registered thread (ownership record owner)
//! - Word: conversion between typed values and raw 64-bit words

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a word in the transactional heap
///
/// Addresses are word indices, not byte offsets. `Addr::NULL` is never handed
/// out by the allocator, so heap data structures use it as the null pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Addr(u64);

impl Addr {
    /// The null address
    pub const NULL: Addr = Addr(0);

    /// Create an address from a raw word index
    pub const fn new(index: u64) -> Self {
        Addr(index)
    }

    /// Raw word index
    pub const fn index(self) -> u64 {
        self.0
    }

    /// Whether this is the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of the `words`-th word after this one
    ///
    /// Used to reach the fields of a heap-allocated record.
    pub const fn offset(self, words: u64) -> Self {
        Addr(self.0 + words)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identity of a thread registered with the runtime
///
/// Zero is reserved to mean "no owner" in ownership records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create a thread id. Panics on zero, which is reserved.
    pub fn new(id: u64) -> Self {
        assert!(id != 0, "thread id 0 is reserved for unowned records");
        ThreadId(id)
    }

    /// Raw id
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// A value that fits in one transactional word
///
/// The typed barrier variants (integer, pointer, floating point) exist purely
/// for value representation; they all move one 64-bit word.
pub trait Word: Copy {
    /// Encode into a raw word
    fn into_word(self) -> u64;
    /// Decode from a raw word
    fn from_word(word: u64) -> Self;
}

impl Word for u64 {
    fn into_word(self) -> u64 {
        self
    }
    fn from_word(word: u64) -> Self {
        word
    }
}

impl Word for i64 {
    fn into_word(self) -> u64 {
        self as u64
    }
    fn from_word(word: u64) -> Self {
        word as i64
    }
}

impl Word for f64 {
    fn into_word(self) -> u64 {
        self.to_bits()
    }
    fn from_word(word: u64) -> Self {
        f64::from_bits(word)
    }
}

impl Word for bool {
    fn into_word(self) -> u64 {
        self as u64
    }
    fn from_word(word: u64) -> Self {
        word != 0
    }
}

impl Word for Addr {
    fn into_word(self) -> u64 {
        self.0
    }
    fn from_word(word: u64) -> Self {
        Addr(word)
    }
}
