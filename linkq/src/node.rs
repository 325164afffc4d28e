//! Node capability contract for intrusive queues.
//!
//! A type becomes queueable by embedding a [`Link`] and implementing [`Node`]
//! so that the queue can reach that field. The link owns the `next` slot that
//! producers publish into and the consumer follows.
//!
//! # Example
//!
//! ```
//! use linkq::{Link, Node};
//!
//! #[derive(Node)]
//! struct Task {
//!     link: Link<Self>,
//!     id: u32,
//! }
//! ```

use std::fmt;
use std::ptr;
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive link embedded in queue nodes.
///
/// The `next` slot is only read or written by a queue while the node is
/// reachable from it. User code has no access to it.
pub struct Link<T> {
    /// Next node in the chain. Null until the following enqueue publishes.
    next: AtomicPtr<T>,

    /// Set from enqueue until the consumer dequeues past the node, so it
    /// covers the node's time as head. Debug builds only; catches a node
    /// enqueued while still reachable from a queue.
    #[cfg(debug_assertions)]
    queued: AtomicBool,
}

impl<T> Link<T> {
    /// Creates an unlinked link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            #[cfg(debug_assertions)]
            queued: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn next(&self, order: Ordering) -> *mut T {
        self.next.load(order)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut T, order: Ordering) {
        self.next.store(next, order);
    }

    /// Marks the node as queued, panicking if it already was.
    #[inline]
    pub(crate) fn mark_queued(&self) {
        #[cfg(debug_assertions)]
        assert!(
            !self.queued.swap(true, Ordering::Relaxed),
            "node enqueued while already reachable from a queue"
        );
    }

    #[inline]
    pub(crate) fn mark_dequeued(&self) {
        #[cfg(debug_assertions)]
        self.queued.store(false, Ordering::Relaxed);
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Link");
        s.field("next", &self.next.load(Ordering::Relaxed));
        #[cfg(debug_assertions)]
        s.field("queued", &self.queued.load(Ordering::Relaxed));
        s.finish()
    }
}

/// Types that can be linked into an intrusive queue.
///
/// Prefer `#[derive(Node)]`, which generates the implementation for a struct
/// holding exactly one `Link<Self>` field.
///
/// # Safety
///
/// Implementers must ensure:
/// - [`Node::link`] returns a reference to the same field embedded in `self`
///   on every call, never a temporary or a link owned by another value.
/// - The link is not shared with any other `Node` implementation on the same
///   type.
///
/// Producers and the consumer perform atomic operations directly on the
/// returned storage; handing out different storage corrupts the queue.
pub unsafe trait Node: Sized {
    /// Returns the embedded link.
    fn link(&self) -> &Link<Self>;
}
