//! Bounded per-client operation history.
//!
//! Only operations that may still be concurrent with a client's next edit need
//! to be kept, so the buffer holds a fixed window and silently evicts the
//! oldest entry once it is full.

use std::collections::VecDeque;

use crate::operation::Operation;

/// Default window size per client.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// FIFO of accepted operations with a fixed capacity.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<Operation>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an operation, returning the evicted oldest entry if the buffer
    /// was already full.
    pub fn push(&mut self, op: Operation) -> Option<Operation> {
        self.entries.push_back(op);
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl<'a> IntoIterator for &'a HistoryBuffer {
    type Item = &'a Operation;
    type IntoIter = std::collections::vec_deque::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
