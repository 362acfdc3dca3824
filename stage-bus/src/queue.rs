use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Notify;

/// Bounded hand-off queue between two stages.
///
/// Pushing never blocks: when the queue is full the oldest item is evicted to
/// make room for the new one. A single consumer awaits items with [`pop`].
///
/// [`pop`]: StageQueue::pop
pub struct StageQueue<T> {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    evicted: AtomicU64,
}

impl<T> StageQueue<T> {
    pub fn new(name: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.to_string(),
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // a panicking holder cannot leave the deque half-updated
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an item, returning the evicted oldest item if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        if evicted.is_some() {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            log::trace!("{}: queue full, evicted oldest (total {})", self.name, total);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait for the next item. Cancel-safe: dropping the future loses nothing.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Pop the oldest item only while more than `limit` items are queued.
    pub fn pop_if_longer_than(&self, limit: usize) -> Option<T> {
        let mut items = self.lock();
        if items.len() > limit {
            items.pop_front()
        } else {
            None
        }
    }

    /// Evict oldest items until at most `limit` remain. Returns how many were dropped.
    pub fn shed_to(&self, limit: usize) -> usize {
        let shed = {
            let mut items = self.lock();
            let excess = items.len().saturating_sub(limit);
            items.drain(..excess);
            excess
        };
        if shed > 0 {
            self.evicted.fetch_add(shed as u64, Ordering::Relaxed);
        }
        shed
    }

    /// Drop everything queued. Returns how many items were discarded.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut items = self.lock();
            let n = items.len();
            items.clear();
            n
        };
        if cleared > 0 {
            self.evicted.fetch_add(cleared as u64, Ordering::Relaxed);
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Items discarded by overflow, shedding or clearing since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
