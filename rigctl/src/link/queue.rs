//! Outbound command queue shared between callers and a link's loop.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// FIFO of commands waiting to be written.
///
/// Any thread may push; only the owning link loop pops. A command that failed
/// to write goes back to the head so ordering survives a reconnect.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<String>>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command.
    pub fn push(&self, command: impl Into<String>) {
        self.lock().push_back(command.into());
    }

    /// Take the oldest command.
    pub fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    /// Return a command to the head of the queue.
    pub fn requeue(&self, command: String) {
        self.lock().push_front(command);
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
