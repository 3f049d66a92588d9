//! Runtime tasks and the bounded queue that carries them.
//!
//! Everything that can happen to a replica (a datagram, a transport event,
//! an expired timer) becomes a [`Task`] on one bounded FIFO. The runtime is
//! the only consumer and handles tasks one at a time, in arrival order.
//!
//! The queue is a `crossbeam-queue::ArrayQueue`, so transport threads can
//! feed it without locks. A full queue hands the task back instead of
//! blocking; the caller drops it and counts the drop.

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use pbft_types::PrincipalId;

use crate::timer::TimeoutKind;

/// Work for the replica runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// The transport is up.
    ConnectionMade,

    /// The transport is gone. Fatal: the runtime stops.
    ConnectionLost,

    /// A raw datagram, not yet parsed.
    Datagram {
        bytes: Bytes,
        /// The principal whose address the datagram came from, if known.
        source: Option<PrincipalId>,
    },

    /// A non-fatal transport error, logged and otherwise ignored.
    TransportError(String),

    /// A timer expired.
    Timer(TimeoutKind),
}

/// Outcome of offering a task to the queue.
#[derive(Debug)]
pub enum Enqueued {
    Accepted,
    /// The queue is full; the task is handed back.
    Full(Task),
}

/// Bounded FIFO of [`Task`]s.
#[derive(Debug)]
pub struct TaskQueue {
    inner: ArrayQueue<Task>,
}

impl TaskQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "task queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    pub fn push(&self, task: Task) -> Enqueued {
        match self.inner.push(task) {
            Ok(()) => Enqueued::Accepted,
            Err(task) => Enqueued::Full(task),
        }
    }

    pub fn pop(&self) -> Option<Task> {
        self.inner.pop()
    }

    /// Pops up to `max` tasks, oldest first.
    pub fn pop_batch(&self, max: usize) -> Vec<Task> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        while batch.len() < max {
            match self.inner.pop() {
                Some(task) => batch.push(task),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
