//! Bounded flow unit buffer
//!
//! FIFO queue with a fixed capacity shared between the tick driver and the
//! network tasks:
//! - newest-wins: pushing into a full buffer evicts the oldest unit
//! - pushes never block the producer
//! - capacity can be changed when a new configuration snapshot arrives

use crate::models::FlowUnit;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe bounded queue of flow units with evict-oldest overflow
#[derive(Debug)]
pub struct FlowUnitBuffer {
    inner: Mutex<Inner>,
    evicted_total: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Arc<FlowUnit>>,
    capacity: usize,
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Units evicted to make room
    pub evicted: usize,
    /// Buffer length after the push
    pub len: usize,
}

impl FlowUnitBuffer {
    /// Create a buffer holding at most `capacity` units (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            evicted_total: AtomicU64::new(0),
        }
    }

    /// Append a unit, evicting the oldest ones if at capacity
    pub fn push(&self, unit: Arc<FlowUnit>) -> PushOutcome {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        while inner.queue.len() >= inner.capacity {
            inner.queue.pop_front();
            evicted += 1;
        }
        inner.queue.push_back(unit);

        if evicted > 0 {
            self.evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
        }

        PushOutcome {
            evicted,
            len: inner.queue.len(),
        }
    }

    /// Remove and return everything, oldest first
    pub fn drain(&self) -> Vec<Arc<FlowUnit>> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Remove and return up to `limit` units, oldest first
    pub fn drain_batch(&self, limit: usize) -> Vec<Arc<FlowUnit>> {
        let mut inner = self.inner.lock();
        let count = limit.min(inner.queue.len());
        inner.queue.drain(..count).collect()
    }

    /// Copy of the queued units without removing them
    pub fn snapshot(&self) -> Vec<Arc<FlowUnit>> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Drop everything, returning how many units were discarded
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Apply a new capacity; shrinking evicts the oldest surplus units
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        let mut evicted = 0;
        while inner.queue.len() > inner.capacity {
            inner.queue.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Statistics about the buffer
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            entries: inner.queue.len(),
            capacity: inner.capacity,
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            oldest_timestamp: inner.queue.front().map(|u| u.timestamp()),
            newest_timestamp: inner.queue.back().map(|u| u.timestamp()),
        }
    }
}

/// Buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    /// Number of queued units
    pub entries: usize,
    /// Maximum capacity
    pub capacity: usize,
    /// Units evicted since creation
    pub evicted_total: u64,
    /// Oldest queued unit timestamp (epoch millis)
    pub oldest_timestamp: Option<i64>,
    /// Newest queued unit timestamp (epoch millis)
    pub newest_timestamp: Option<i64>,
}
