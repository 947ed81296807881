//! Size-classed bounded queues of pending fetch candidates.
//!
//! Small bundles ride ahead of large ones: each queue accepts payloads
//! below its size threshold and holds fewer candidates the bigger the
//! class. Within a queue, candidates are ordered by descending priority
//! with ties broken by arrival.

use crate::types::{Manifest, PeerAddr};
use tracing::debug;

/// Priority assigned to ordinary advertisements.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Reference queue classes: `(size threshold, capacity)`, ascending;
/// `None` marks the unbounded class.
pub const QUEUE_CLASSES: &[(Option<u64>, usize)] = &[
    (Some(10_000), 5),
    (Some(100_000), 4),
    (Some(1_000_000), 3),
    (Some(10_000_000), 2),
    (None, 1),
];

/// A pending fetch: a manifest we have been offered but not yet begun
/// retrieving.
#[derive(Debug)]
pub struct Candidate {
    pub manifest: Manifest,
    pub peer: PeerAddr,
    pub priority: i32,
}

/// One bounded queue of candidates.
///
/// The backing `Vec` keeps the used prefix contiguous by construction:
/// insertion shifts later candidates toward the tail and removal closes the
/// gap.
#[derive(Debug)]
pub struct FetchQueue {
    threshold: Option<u64>,
    capacity: usize,
    candidates: Vec<Candidate>,
}

impl FetchQueue {
    pub fn new(threshold: Option<u64>, capacity: usize) -> Self {
        Self { threshold, capacity, candidates: Vec::with_capacity(capacity) }
    }

    /// Payload-length upper bound for this class; `None` is unbounded.
    pub fn threshold(&self) -> Option<u64> {
        self.threshold
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a payload of this size belongs at or below this class.
    pub fn accepts(&self, size: u64) -> bool {
        self.threshold.is_none_or(|t| size < t)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.candidates.len() >= self.capacity
    }

    pub fn get(&self, i: usize) -> Option<&Candidate> {
        self.candidates.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Insert at position `i`, shifting later candidates back. If the queue
    /// was full the displaced tail candidate is returned (its manifest is
    /// released when the caller drops it).
    pub fn insert(&mut self, i: usize, candidate: Candidate) -> Option<Candidate> {
        debug_assert!(i <= self.candidates.len());
        let evicted = if self.is_full() { self.candidates.pop() } else { None };
        if let Some(e) = &evicted {
            debug!(id = %e.manifest.id, "queue full, evicting tail candidate");
        }
        self.candidates.insert(i.min(self.candidates.len()), candidate);
        evicted
    }

    /// Remove the candidate at `i`, closing the gap.
    pub fn remove(&mut self, i: usize) -> Candidate {
        self.candidates.remove(i)
    }
}

/// Index of the lowest class that accepts a payload of `size`, given queues
/// ordered by ascending threshold with an unbounded tail.
pub fn find_queue(queues: &[FetchQueue], size: u64) -> usize {
    queues
        .iter()
        .position(|q| q.accepts(size))
        .unwrap_or(queues.len().saturating_sub(1))
}

/// Build the reference queue set.
pub fn default_queues() -> Vec<FetchQueue> {
    QUEUE_CLASSES.iter().map(|&(t, cap)| FetchQueue::new(t, cap)).collect()
}
