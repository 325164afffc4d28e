//! Safe single-consumer handle for the intrusive MPSC queue.
//!
//! The core [`Queue`] exposes its consumer operations as `unsafe fn`s because
//! it cannot know how many threads are draining it. A [`Consumer`] claims the
//! consumer role at runtime, so holding one is proof of exclusive access.
//!
//! # Overview
//!
//! - [`Queue::enqueue`] - Producer side (any number of threads, through `&Queue`)
//! - [`Consumer`] - Read end (at most one per queue at a time)
//! - Lock-free: no mutexes or syscalls in the hot path
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use linkq::{Link, Node, Queue};
//!
//! #[derive(Node, Default)]
//! struct Msg {
//!     link: Link<Self>,
//!     value: u64,
//! }
//!
//! let stub = Msg::default();
//! let msgs: Vec<Msg> = (0..4).map(|value| Msg { value, ..Msg::default() }).collect();
//! let queue = Queue::new(&stub);
//!
//! thread::scope(|s| {
//!     for msg in &msgs {
//!         let queue = &queue;
//!         // SAFETY: each message is fresh and enqueued exactly once.
//!         s.spawn(move || unsafe { queue.enqueue(msg) });
//!     }
//! });
//!
//! let consumer = queue.consumer()?;
//! let mut seen = Vec::new();
//! while let Some(msg) = consumer.try_dequeue() {
//!     seen.push(msg.value);
//! }
//! seen.sort();
//! assert_eq!(seen, [0, 1, 2, 3]);
//! # Ok::<(), linkq::QueueError>(())
//! ```

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use minstant::Instant;

use crate::mpsc::{Queue, QueueState};
use crate::node::Node;

/// Timeout specification for spinning dequeues.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Spin indefinitely.
    Infinite,
    /// Spin for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Read end of an intrusive MPSC queue.
///
/// Obtained from [`Queue::consumer`]. Only one exists per queue at a time;
/// dropping it lets another be claimed.
///
/// # Thread Safety
///
/// `Consumer` is [`Send`] but **not** [`Sync`]:
/// - Can transfer ownership to another thread
/// - Cannot share `&Consumer` (no concurrent dequeues)
pub struct Consumer<'q, 'a, T: Node> {
    queue: &'q Queue<'a, T>,
    _unsync: PhantomUnsync,
}

impl<'q, 'a, T: Node> Consumer<'q, 'a, T> {
    /// Wraps a queue whose consumer claim has just succeeded.
    pub(crate) fn new(queue: &'q Queue<'a, T>) -> Self {
        Self {
            queue,
            _unsync: PhantomData,
        }
    }

    /// Attempts to dequeue a node without spinning.
    ///
    /// Returns `None` if the queue is empty or a producer is mid-publication.
    #[inline]
    #[must_use]
    pub fn try_dequeue(&self) -> Option<&'a T> {
        // SAFETY: holding the Consumer proves exclusive consumer access.
        unsafe { self.queue.try_dequeue() }
    }

    /// Attempts to dequeue a node, spinning up to `max_spins` times while a
    /// producer is mid-publication.
    #[inline]
    #[must_use]
    pub fn try_dequeue_spin(&self, max_spins: usize) -> Option<&'a T> {
        // SAFETY: exclusive consumer access.
        unsafe { self.queue.try_dequeue_spin(max_spins) }
    }

    /// Attempts to dequeue a node, spinning without bound while a producer is
    /// mid-publication. Returns `None` at once if the queue is empty.
    #[inline]
    #[must_use]
    pub fn try_dequeue_spin_until_linked(&self) -> Option<&'a T> {
        // SAFETY: exclusive consumer access.
        unsafe { self.queue.try_dequeue_spin_until_linked() }
    }

    /// Spins until a node is available, then dequeues it.
    ///
    /// Returns `None` on timeout. A duration too large to represent as a
    /// deadline spins without bound, like [`Timeout::Infinite`].
    #[must_use]
    pub fn dequeue_timeout(&self, timeout: Timeout) -> Option<&'a T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Instant::now().checked_add(d),
        };
        loop {
            if let Some(node) = self.try_dequeue() {
                return Some(node);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Returns the stub or the last dequeued node.
    ///
    /// That node still anchors the queue and must not be enqueued into this
    /// or any other queue yet.
    #[inline]
    #[must_use]
    pub fn head(&self) -> &'a T {
        // SAFETY: exclusive consumer access.
        unsafe { self.queue.head() }
    }

    /// Best-effort emptiness check.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: exclusive consumer access.
        unsafe { self.queue.is_empty() }
    }

    /// Reports whether the queue is empty, mid-publication or non-empty.
    #[inline]
    #[must_use]
    pub fn state(&self) -> QueueState {
        // SAFETY: exclusive consumer access.
        unsafe { self.queue.state() }
    }
}

impl<T: Node> Drop for Consumer<'_, '_, T> {
    fn drop(&mut self) {
        self.queue.release_consumer();
    }
}

impl<T: Node> fmt::Debug for Consumer<'_, '_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", self.queue)
            .finish()
    }
}
