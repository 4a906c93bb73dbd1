//! Bounded FIFO buffer for messages that arrive while an entity recovers.

use std::collections::VecDeque;

/// Default number of messages held while recovery is running.
pub const DEFAULT_STASH_CAPACITY: usize = 1000;

/// Bounded first-in first-out buffer.
///
/// Messages are drained in arrival order once recovery completes, ahead of
/// anything still waiting in the mailbox.
#[derive(Debug)]
pub(crate) struct StashBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> StashBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append a message. Hands the message back if the buffer is full.
    pub(crate) fn push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
