//! Identity space shared by neurons and links.
//!
//! Every entity is addressed by a [`NeuronId`]; neurons and links draw from
//! the same space. Entities reference each other only by id, which is what
//! lets any one of them be paged in or evicted on its own. The
//! [`IdAllocator`] hands out durable ids; [`NeuronId::TEMP`] marks an entity
//! that has not been committed yet.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::EntityError;

/// Unique, niche-optimized identifier for a neuron or link.
///
/// Uses `NonZeroU64` so that `Option<NeuronId>` is the same size as `NeuronId`,
/// and so that a zeroed frame header field decodes as "no id".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NeuronId(NonZeroU64);

impl NeuronId {
    /// Placeholder id carried by entities that were built but not yet added.
    pub const TEMP: NeuronId = NeuronId(NonZeroU64::MAX);

    /// Create a `NeuronId` from a raw `u64`.
    ///
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(NeuronId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Whether this is the uncommitted placeholder.
    pub fn is_temp(self) -> bool {
        self == Self::TEMP
    }
}

impl std::fmt::Display for NeuronId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_temp() {
            write!(f, "n:temp")
        } else {
            write!(f, "n:{}", self.0)
        }
    }
}

/// Thread-safe id allocator.
///
/// Produces monotonically increasing ids starting from 1. After a graph file
/// is attached, [`advance_past`](Self::advance_past) moves the counter beyond
/// every loaded id.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator that starts from id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create an allocator that resumes from a given id.
    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocate the next id.
    ///
    /// The placeholder value is never handed out; reaching it means the
    /// space is exhausted.
    pub fn next_id(&self) -> Result<NeuronId, EntityError> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        match NeuronId::new(raw) {
            Some(id) if !id.is_temp() => Ok(id),
            _ => Err(EntityError::AllocatorExhausted),
        }
    }

    /// Make sure ids up to and including `raw` are never handed out again.
    pub fn advance_past(&self, raw: u64) {
        self.next.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
    }

    /// Return the next id that *would* be allocated, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// Restart from id 1. Only valid once nothing refers to old ids.
    pub fn reset(&self) {
        self.next.store(1, Ordering::Relaxed);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neuron_id_niche_optimization() {
        assert_eq!(
            std::mem::size_of::<Option<NeuronId>>(),
            std::mem::size_of::<NeuronId>()
        );
    }

    #[test]
    fn neuron_id_zero_is_none() {
        assert!(NeuronId::new(0).is_none());
        assert_eq!(NeuronId::new(42).unwrap().get(), 42);
    }

    #[test]
    fn allocator_produces_sequential_ids() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.next_id().unwrap().get(), 1);
        assert_eq!(alloc.next_id().unwrap().get(), 2);
        assert_eq!(alloc.next_id().unwrap().get(), 3);
    }

    #[test]
    fn allocator_never_hands_out_temp() {
        let alloc = IdAllocator::starting_from(u64::MAX);
        assert!(matches!(
            alloc.next_id(),
            Err(EntityError::AllocatorExhausted)
        ));
    }

    #[test]
    fn advance_past_only_moves_forward() {
        let alloc = IdAllocator::starting_from(10);
        alloc.advance_past(4);
        assert_eq!(alloc.peek_next(), 10);
        alloc.advance_past(20);
        assert_eq!(alloc.next_id().unwrap().get(), 21);
    }

    #[test]
    fn display() {
        assert_eq!(NeuronId::new(42).unwrap().to_string(), "n:42");
        assert_eq!(NeuronId::TEMP.to_string(), "n:temp");
    }
}
