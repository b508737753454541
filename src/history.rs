use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Records that carry their own capture time.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// FIFO ring buffer bounded by entry count and by age.
///
/// The count cap is enforced on every push; the age cutoff on every
/// [`prune`](BoundedHistory::prune). Entries must be pushed in timestamp
/// order so that the oldest entry is always at the front.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
    max_age: Duration,
}

impl<T: Timestamped> BoundedHistory<T> {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Appends an entry, evicting the oldest ones beyond capacity.
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Drops entries older than the age cutoff relative to `now`. Returns how many were dropped.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.max_age;
        let before = self.entries.len();
        while self.entries.front().is_some_and(|e| e.timestamp() < cutoff) {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// The most recent `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Timestamped + Clone> BoundedHistory<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
