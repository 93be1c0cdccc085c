//! Concurrent id-keyed queue.
//!
//! Used for both pending queries and completed results. Entries are keyed
//! by query id; the unkeyed pop returns the lowest key, which is arrival
//! order because query ids are handed out monotonically.
//!
//! Waiting pops block on a condition variable instead of sleep-polling, but
//! still wake at least once per `timeout` so callers can observe shutdown.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Why a push was turned away; carries the value back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected<V> {
    Full(V),
    Duplicate(V),
}

impl<V> Rejected<V> {
    pub fn into_inner(self) -> V {
        match self {
            Rejected::Full(value) | Rejected::Duplicate(value) => value,
        }
    }
}

#[derive(Debug)]
pub struct ConcurrentMapQueue<K, V> {
    entries: Mutex<BTreeMap<K, V>>,
    changed: Condvar,
}

impl<K: Ord + Copy, V> Default for ConcurrentMapQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy, V> ConcurrentMapQueue<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
        }
    }

    // Every critical section is a single map operation, so a panic elsewhere
    // cannot leave the map half-updated.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `value` under `key`. Fails, returning the value, if the key is taken.
    ///
    /// # Errors
    /// Returns the rejected value when `key` already exists.
    pub fn push(&self, key: K, value: V) -> Result<(), V> {
        self.push_bounded(key, value, usize::MAX)
            .map_err(Rejected::into_inner)
    }

    /// Insert `value` under `key` unless the queue already holds `limit`
    /// entries. The size check and the insert happen under one lock.
    ///
    /// # Errors
    /// Returns [`Rejected::Full`] at capacity and [`Rejected::Duplicate`]
    /// when `key` already exists.
    pub fn push_bounded(&self, key: K, value: V, limit: usize) -> Result<(), Rejected<V>> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(Rejected::Duplicate(value));
        }
        if entries.len() >= limit {
            return Err(Rejected::Full(value));
        }
        entries.insert(key, value);
        drop(entries);
        self.changed.notify_all();
        Ok(())
    }

    /// Remove and return the entry for `key`.
    pub fn pop(&self, key: K) -> Option<V> {
        self.lock().remove(&key)
    }

    /// Remove and return the lowest-keyed entry.
    pub fn pop_next(&self) -> Option<(K, V)> {
        self.lock().pop_first()
    }

    /// Like [`pop`](Self::pop), but wait up to `timeout` for the entry to appear.
    pub fn pop_wait(&self, key: K, timeout: Duration) -> Option<V> {
        self.wait_for(timeout, |entries| entries.remove(&key))
    }

    /// Like [`pop_next`](Self::pop_next), but wait up to `timeout` for any entry.
    pub fn pop_next_wait(&self, timeout: Duration) -> Option<(K, V)> {
        self.wait_for(timeout, BTreeMap::pop_first)
    }

    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut BTreeMap<K, V>) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock();
        loop {
            if let Some(found) = take(&mut entries) {
                return Some(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            entries = self
                .changed
                .wait_timeout(entries, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Remove every entry for which `evict` returns true; returns how many went.
    pub fn evict_where(&self, mut evict: impl FnMut(&K, &V) -> bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, v| !evict(k, v));
        before - entries.len()
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.lock().contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_rejects_duplicate_key() {
        let queue = ConcurrentMapQueue::new();
        assert!(queue.push(1, "a").is_ok());
        assert_eq!(queue.push(1, "b"), Err("b"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(1), Some("a"));
        assert_eq!(queue.pop(1), None);
    }

    #[test]
    fn test_push_bounded_stops_at_limit() {
        let queue = ConcurrentMapQueue::new();
        queue.push_bounded(1, "a", 2).unwrap();
        queue.push_bounded(2, "b", 2).unwrap();
        assert_eq!(queue.push_bounded(3, "c", 2), Err(Rejected::Full("c")));
        assert_eq!(queue.push_bounded(1, "d", 5), Err(Rejected::Duplicate("d")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_push_bounded_never_overshoots_under_contention() {
        let queue = Arc::new(ConcurrentMapQueue::new());
        let pushers: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..50)
                        .filter(|i| queue.push_bounded(t * 100 + i, (), 3).is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = pushers.into_iter().map(|p| p.join().unwrap()).sum();
        assert_eq!(admitted, 3);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_next_is_lowest_key() {
        let queue = ConcurrentMapQueue::new();
        for key in [5, 2, 9] {
            queue.push(key, key * 10).unwrap();
        }
        assert_eq!(queue.pop_next(), Some((2, 20)));
        assert_eq!(queue.pop_next(), Some((5, 50)));
        assert_eq!(queue.pop_next(), Some((9, 90)));
        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn test_pop_wait_times_out() {
        let queue: ConcurrentMapQueue<i64, ()> = ConcurrentMapQueue::new();
        let started = Instant::now();
        assert!(queue.pop_wait(1, Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_wait_wakes_on_push() {
        let queue = Arc::new(ConcurrentMapQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(7, "late").unwrap();
            })
        };
        assert_eq!(queue.pop_wait(7, Duration::from_secs(5)), Some("late"));
        producer.join().unwrap();
    }

    #[test]
    fn test_each_entry_popped_once_under_contention() {
        let queue = Arc::new(ConcurrentMapQueue::new());
        for key in 0..200 {
            queue.push(key, key).unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some((key, _)) = queue.pop_next_wait(Duration::from_millis(10)) {
                        seen.push(key);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_evict_where() {
        let queue = ConcurrentMapQueue::new();
        for key in 0..10 {
            queue.push(key, key).unwrap();
        }
        assert_eq!(queue.evict_where(|_, v| v % 2 == 0), 5);
        assert_eq!(queue.len(), 5);
        assert!(!queue.contains(4));
    }
}
