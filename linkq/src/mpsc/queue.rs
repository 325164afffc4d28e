//! Intrusive lock-free MPSC queue algorithm.
//!
//! Nodes carry their own [`Link`](crate::Link), so enqueueing never
//! allocates. The queue itself is two pointers anchored on a caller-supplied
//! stub node.
//!
//! # Algorithm
//!
//! The design follows Dmitry Vyukov's intrusive node-based MPSC queue:
//!
//! - `tail` points at the most recently appended node (the stub initially)
//! - Producers clear `node.next`, swap `tail` to `node`, then store `node`
//!   into the previous tail's `next` with release ordering
//! - `head` points at the last consumed node (the stub initially)
//! - The consumer reads `head.next` with acquire ordering and, if present,
//!   advances `head` to it and hands it out
//!
//! Enqueue is wait-free: one swap and one store, no retry loop.
//!
//! # Transient gap
//!
//! Between a producer's swap and its store, `tail` already names the new node
//! but the previous node's `next` is still null. A consumer sitting on that
//! previous node sees nothing to dequeue even though the queue is logically
//! non-empty. [`Queue::try_dequeue`] reports nothing in that window;
//! [`Queue::try_dequeue_spin`] and [`Queue::try_dequeue_spin_until_linked`]
//! wait it out. [`Queue::state`] tells the cases apart.
//!
//! # Head anchoring
//!
//! A dequeued node becomes the new `head`, and the consumer reads its `next`
//! on the following dequeue. It must not be enqueued again, into this queue
//! or any other, until a later dequeue has moved past it; [`Queue::head`]
//! names that node. A head that moved into a second queue would receive the
//! first queue's next node, and that node would then be reachable from both.
//!
//! # Safety
//!
//! Any number of threads may enqueue at once. [`Queue::enqueue`] is still
//! `unsafe`: the queue cannot see whether a node is reachable from another
//! queue, and a node enqueued while still reachable links two chains.
//! The consumer side requires exactly one consumer (single consumer
//! invariant). The `unsafe` consumer methods leave that to the caller;
//! [`Queue::consumer`] checks it at runtime.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use thiserror::Error;

use crate::node::Node;
use crate::sync::mpsc::Consumer;
use crate::trace::{debug, trace, warn};

/// Errors reported by queue construction, enqueue and consumer claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("stub node pointer is null")]
    NullStub,

    #[error("node pointer is null")]
    NullNode,

    #[error("queue already has an active consumer")]
    ConsumerBusy,
}

/// Queue state as observed by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// `head == tail` and `head.next` is null.
    Empty,
    /// A producer has swapped `tail` but not yet published its link.
    TransientGap,
    /// `head.next` is set; the next dequeue succeeds.
    NonEmpty,
}

/// Producer-side state: the shared tail.
#[repr(C)]
#[repr(align(64))] // Keep producer swaps off the consumer's cache line
struct ProducerState<T> {
    /// Most recently appended node. Never null.
    tail: AtomicPtr<T>,
}

/// Consumer-side state.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState<T> {
    /// Last consumed node, or the stub.
    /// Only the consumer reads or writes this.
    head: UnsafeCell<NonNull<T>>,

    /// Whether a [`Consumer`] handle currently exists.
    claimed: AtomicBool,
}

/// Intrusive multi-producer single-consumer queue.
///
/// Nodes and the stub are borrowed for `'a`, which must outlive the queue.
/// The queue never drops or frees any node.
///
/// # Example
///
/// ```
/// use linkq::{Link, Node, Queue};
///
/// #[derive(Node, Default)]
/// struct Job {
///     link: Link<Self>,
///     id: u32,
/// }
///
/// let stub = Job::default();
/// let a = Job { id: 1, ..Job::default() };
/// let b = Job { id: 2, ..Job::default() };
///
/// let queue = Queue::new(&stub);
/// // SAFETY: `a` and `b` are fresh nodes, not reachable from any queue.
/// unsafe {
///     queue.enqueue(&a);
///     queue.enqueue(&b);
/// }
///
/// let consumer = queue.consumer()?;
/// assert_eq!(consumer.try_dequeue().map(|job| job.id), Some(1));
/// assert_eq!(consumer.try_dequeue().map(|job| job.id), Some(2));
/// assert!(consumer.try_dequeue().is_none());
/// assert!(consumer.is_empty());
/// # Ok::<(), linkq::QueueError>(())
/// ```
#[repr(C)]
pub struct Queue<'a, T: Node> {
    producer: ProducerState<T>,
    consumer: ConsumerState<T>,
    stub: NonNull<T>,
    /// Invariant in `'a`: a `&Queue<'long, T>` must not shrink to
    /// `&Queue<'short, T>` and accept nodes that die before the queue.
    _nodes: PhantomData<fn(&'a T) -> &'a T>,
}

impl<'a, T: Node> Queue<'a, T> {
    /// Creates a queue anchored on `stub`.
    ///
    /// Clears the stub's link and points both `head` and `tail` at it.
    #[must_use]
    pub fn new(stub: &'a T) -> Self {
        Self::with_stub(NonNull::from(stub))
    }

    /// Creates a queue anchored on a raw stub pointer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NullStub`] if `stub` is null.
    ///
    /// # Safety
    ///
    /// If non-null, `stub` must point to a valid `T` that stays alive and in
    /// place for `'a`, and must not be the stub or a node of another queue.
    pub unsafe fn from_raw(stub: *const T) -> Result<Self, QueueError> {
        match NonNull::new(stub.cast_mut()) {
            Some(stub) => Ok(Self::with_stub(stub)),
            None => {
                warn!("rejected null stub pointer");
                Err(QueueError::NullStub)
            }
        }
    }

    fn with_stub(stub: NonNull<T>) -> Self {
        // SAFETY: both constructors guarantee the stub is valid for `'a`.
        unsafe { stub.as_ref() }
            .link()
            .set_next(ptr::null_mut(), Ordering::Relaxed);

        trace!(stub = ?stub, "queue constructed");

        Self {
            producer: ProducerState {
                tail: AtomicPtr::new(stub.as_ptr()),
            },
            consumer: ConsumerState {
                head: UnsafeCell::new(stub),
                claimed: AtomicBool::new(false),
            },
            stub,
            _nodes: PhantomData,
        }
    }

    /// Appends `node` to the queue.
    ///
    /// Wait-free and callable from any number of threads at once. Concurrent
    /// enqueues are ordered by their tail swap, not by call order.
    ///
    /// # Safety
    ///
    /// `node` must not be reachable from any queue, this one or another:
    /// - not enqueued and still waiting to be dequeued
    /// - not the current head of a queue, i.e. the node most recently
    ///   dequeued from it (see [`Queue::head`])
    /// - not the stub of a live queue
    ///
    /// A node dequeued from one queue may move to another only after the
    /// first queue's consumer has dequeued past it, or that queue is gone.
    ///
    /// # Panics
    ///
    /// Debug builds panic on the violations above when `node` was last
    /// touched by a linkq queue. Release builds do not check.
    #[inline]
    pub unsafe fn enqueue(&self, node: &'a T) {
        // SAFETY: `node` is borrowed for `'a`; reachability is the caller's
        // guarantee.
        unsafe { self.enqueue_ptr(NonNull::from(node)) }
    }

    /// Appends the node behind a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NullNode`] if `node` is null.
    ///
    /// # Safety
    ///
    /// If non-null, `node` must point to a valid `T` that stays alive and in
    /// place for `'a`, and must meet every requirement of [`Queue::enqueue`]:
    /// not queued, not the head of any queue, not a stub.
    pub unsafe fn enqueue_raw(&self, node: *const T) -> Result<(), QueueError> {
        let Some(node) = NonNull::new(node.cast_mut()) else {
            warn!("rejected null node pointer");
            return Err(QueueError::NullNode);
        };
        // SAFETY: validity for `'a` is guaranteed by the caller.
        unsafe { self.enqueue_ptr(node) };
        Ok(())
    }

    /// # Safety
    ///
    /// `node` must be valid for `'a` and not reachable from any queue.
    #[inline]
    unsafe fn enqueue_ptr(&self, node: NonNull<T>) {
        debug_assert_ne!(node, self.stub, "stub node cannot be enqueued");

        // SAFETY: guaranteed by the caller.
        let link = unsafe { node.as_ref() }.link();
        link.mark_queued();

        // Reused nodes may still carry a stale successor.
        link.set_next(ptr::null_mut(), Ordering::Relaxed);

        let prev = self.producer.tail.swap(node.as_ptr(), Ordering::AcqRel);

        // SAFETY: tail starts at the stub and only ever receives non-null
        // node pointers valid for `'a`, so `prev` is a live node.
        unsafe { (*prev).link() }.set_next(node.as_ptr(), Ordering::Release);
    }

    /// Attempts to dequeue a node without spinning.
    ///
    /// Returns `None` both when the queue is empty and when a producer is
    /// mid-publication; see [`Queue::state`] to tell them apart.
    ///
    /// # Safety
    ///
    /// Caller must ensure only one thread calls consumer methods at a time
    /// (single consumer).
    #[inline]
    pub unsafe fn try_dequeue(&self) -> Option<&'a T> {
        // SAFETY: single consumer, guaranteed by the caller.
        unsafe {
            let head = self.head_ptr();
            self.advance(head.as_ref().link().next(Ordering::Acquire))
        }
    }

    /// Attempts to dequeue a node, spinning up to `max_spins` times if a
    /// producer is mid-publication.
    ///
    /// Returns `None` immediately if the queue is empty, or once the spin
    /// budget runs out with the link still unpublished.
    ///
    /// # Safety
    ///
    /// Caller must ensure single consumer access.
    pub unsafe fn try_dequeue_spin(&self, max_spins: usize) -> Option<&'a T> {
        // SAFETY: single consumer, guaranteed by the caller.
        let head = unsafe { self.head_ptr() };
        let link = unsafe { head.as_ref() }.link();

        let mut next = link.next(Ordering::Acquire);
        if next.is_null() && self.in_gap(head) {
            let mut spins = 0;
            while next.is_null() && spins < max_spins {
                std::hint::spin_loop();
                next = link.next(Ordering::Acquire);
                spins += 1;
            }
            if next.is_null() {
                trace!(max_spins, "spin budget exhausted before link was published");
            }
        }

        // SAFETY: single consumer.
        unsafe { self.advance(next) }
    }

    /// Attempts to dequeue a node, spinning without bound if a producer is
    /// mid-publication.
    ///
    /// Returns `None` immediately if the queue is empty. Only use this when
    /// the pending producer is known to be running; a producer preempted
    /// between its swap and store keeps the consumer spinning.
    ///
    /// # Safety
    ///
    /// Caller must ensure single consumer access.
    pub unsafe fn try_dequeue_spin_until_linked(&self) -> Option<&'a T> {
        // SAFETY: single consumer, guaranteed by the caller.
        let head = unsafe { self.head_ptr() };
        let link = unsafe { head.as_ref() }.link();

        let mut next = link.next(Ordering::Acquire);
        if next.is_null() && self.in_gap(head) {
            while next.is_null() {
                std::hint::spin_loop();
                next = link.next(Ordering::Acquire);
            }
        }

        // SAFETY: single consumer.
        unsafe { self.advance(next) }
    }

    /// Returns the current head: the stub, or the last dequeued node.
    ///
    /// # Safety
    ///
    /// Caller must ensure single consumer access.
    #[inline]
    pub unsafe fn head(&self) -> &'a T {
        // SAFETY: head always points at the stub or a node valid for `'a`.
        unsafe { self.head_ptr().as_ref() }
    }

    /// Best-effort emptiness check.
    ///
    /// May report `true` while a producer is mid-publication.
    ///
    /// # Safety
    ///
    /// Caller must ensure single consumer access.
    #[inline]
    pub unsafe fn is_empty(&self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { self.state() == QueueState::Empty }
    }

    /// Reports the consumer-side state.
    ///
    /// # Safety
    ///
    /// Caller must ensure single consumer access.
    pub unsafe fn state(&self) -> QueueState {
        // SAFETY: single consumer, guaranteed by the caller.
        let head = unsafe { self.head_ptr() };
        if !unsafe { head.as_ref() }
            .link()
            .next(Ordering::Acquire)
            .is_null()
        {
            QueueState::NonEmpty
        } else if self.in_gap(head) {
            QueueState::TransientGap
        } else {
            QueueState::Empty
        }
    }

    /// Claims the consumer role and returns a safe handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConsumerBusy`] while another [`Consumer`]
    /// for this queue is alive.
    pub fn consumer(&self) -> Result<Consumer<'_, 'a, T>, QueueError> {
        if self
            .consumer
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            warn!("consumer already claimed");
            return Err(QueueError::ConsumerBusy);
        }
        debug!("consumer claimed");
        Ok(Consumer::new(self))
    }

    /// Called by [`Consumer`] on drop.
    pub(crate) fn release_consumer(&self) {
        self.consumer.claimed.store(false, Ordering::Release);
        debug!("consumer released");
    }

    /// # Safety
    ///
    /// Single consumer.
    #[inline]
    unsafe fn head_ptr(&self) -> NonNull<T> {
        unsafe { *self.consumer.head.get() }
    }

    /// `head.next` is null but a producer has already moved `tail` past head.
    #[inline]
    fn in_gap(&self, head: NonNull<T>) -> bool {
        self.producer.tail.load(Ordering::Acquire) != head.as_ptr()
    }

    /// Moves `head` to `next` and hands `next` out, if present.
    ///
    /// The new head keeps its queued mark, since the queue still reads its
    /// `next`. The old head is released.
    ///
    /// # Safety
    ///
    /// Single consumer; `next` is null or a node published into this queue.
    #[inline]
    unsafe fn advance(&self, next: *mut T) -> Option<&'a T> {
        let next = NonNull::new(next)?;
        // SAFETY: single consumer; published nodes are valid for `'a`.
        let (old, node) = unsafe {
            let slot = &mut *self.consumer.head.get();
            let old = std::mem::replace(slot, next);
            (old.as_ref(), next.as_ref())
        };
        old.link().mark_dequeued();
        Some(node)
    }
}

impl<T: Node> Drop for Queue<'_, T> {
    /// Releases the debug marks of the head and of every node still linked,
    /// so they can be enqueued elsewhere once the queue is gone.
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let mut cur = self.consumer.head.get_mut().as_ptr();
            while let Some(node) = NonNull::new(cur) {
                // SAFETY: head and every linked node are valid for `'a`, which
                // outlives the queue; no producer can run during drop.
                let link = unsafe { node.as_ref() }.link();
                link.mark_dequeued();
                cur = link.next(Ordering::Acquire);
            }
        }
    }
}

impl<T: Node> fmt::Debug for Queue<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("tail", &self.producer.tail.load(Ordering::Relaxed))
            .field("stub", &self.stub)
            .field("claimed", &self.consumer.claimed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// SAFETY: Queue is Send because it only holds pointers to nodes borrowed for
// `'a`; handing `&T` across threads requires `T: Sync`.
unsafe impl<T: Node + Sync> Send for Queue<'_, T> {}

// SAFETY: Queue is Sync because concurrent access is mediated by atomics:
// - Producers synchronize through the swap on tail
// - `next` is written by exactly one producer and read by the consumer
// - head is only touched by the single consumer (unsafe API contract or the
//   claimed Consumer handle)
unsafe impl<T: Node + Sync> Sync for Queue<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Link;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct TestNode {
        link: Link<TestNode>,
        value: u64,
    }

    unsafe impl Node for TestNode {
        fn link(&self) -> &Link<Self> {
            &self.link
        }
    }

    fn node(value: u64) -> TestNode {
        TestNode {
            value,
            ..TestNode::default()
        }
    }

    fn as_mut_ptr(node: &TestNode) -> *mut TestNode {
        node as *const TestNode as *mut TestNode
    }

    /// Swaps `tail` to `node` without publishing the link, leaving the queue
    /// in the transient gap. Returns the previous tail.
    fn open_gap<'a>(queue: &Queue<'a, TestNode>, node: &'a TestNode) -> *mut TestNode {
        queue
            .producer
            .tail
            .swap(as_mut_ptr(node), Ordering::AcqRel)
    }

    #[test]
    fn test_new_queue_is_empty() {
        let stub = TestNode::default();
        let queue = Queue::new(&stub);

        unsafe {
            assert!(queue.is_empty());
            assert_eq!(queue.state(), QueueState::Empty);
            assert!(ptr::eq(queue.head(), &stub));
            assert!(queue.try_dequeue().is_none());
        }
    }

    #[test]
    fn test_construction_clears_stale_stub_link() {
        let stub = TestNode::default();
        let other = node(1);
        stub.link().set_next(as_mut_ptr(&other), Ordering::Relaxed);

        let queue = Queue::new(&stub);

        assert!(stub.link().next(Ordering::Relaxed).is_null());
        unsafe { assert!(queue.is_empty()) };
    }

    #[test]
    fn test_single_enqueue_dequeue() {
        let stub = TestNode::default();
        let a = node(1);
        let queue = Queue::new(&stub);

        unsafe { queue.enqueue(&a) };
        unsafe {
            assert_eq!(queue.state(), QueueState::NonEmpty);
            assert!(!queue.is_empty());

            let got = queue.try_dequeue().expect("node available");
            assert!(ptr::eq(got, &a));
            assert!(queue.try_dequeue().is_none());
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_fifo_single_producer() {
        let stub = TestNode::default();
        let nodes: Vec<TestNode> = (0..10).map(node).collect();
        let queue = Queue::new(&stub);

        for n in &nodes {
            unsafe { queue.enqueue(n) };
        }

        for expected in 0..10 {
            let got = unsafe { queue.try_dequeue() }.expect("node available");
            assert_eq!(got.value, expected);
        }
        unsafe { assert!(queue.try_dequeue().is_none()) };
    }

    #[test]
    fn test_interleaved_operations() {
        let stub = TestNode::default();
        let nodes: Vec<TestNode> = (1..=5).map(node).collect();
        let queue = Queue::new(&stub);

        let dequeue = || unsafe { queue.try_dequeue() }.map(|n| n.value);

        unsafe {
            queue.enqueue(&nodes[0]);
            queue.enqueue(&nodes[1]);
        }
        assert_eq!(dequeue(), Some(1));
        unsafe { queue.enqueue(&nodes[2]) };
        assert_eq!(dequeue(), Some(2));
        assert_eq!(dequeue(), Some(3));
        unsafe {
            queue.enqueue(&nodes[3]);
            queue.enqueue(&nodes[4]);
        }
        assert_eq!(dequeue(), Some(4));
        assert_eq!(dequeue(), Some(5));
        assert_eq!(dequeue(), None);
    }

    #[test]
    fn test_head_tracks_last_dequeued() {
        let stub = TestNode::default();
        let a = node(1);
        let b = node(2);
        let queue = Queue::new(&stub);

        unsafe {
            queue.enqueue(&a);
            queue.enqueue(&b);
        }

        unsafe {
            assert!(ptr::eq(queue.head(), &stub));
            queue.try_dequeue();
            assert!(ptr::eq(queue.head(), &a));
            queue.try_dequeue();
            assert!(ptr::eq(queue.head(), &b));
        }
    }

    #[test]
    fn test_node_reuse_once_past_head() {
        let stub = TestNode::default();
        let a = node(1);
        let b = node(2);
        let queue = Queue::new(&stub);

        unsafe {
            queue.enqueue(&a);
            queue.enqueue(&b);
            assert_eq!(queue.try_dequeue().map(|n| n.value), Some(1));
            assert_eq!(queue.try_dequeue().map(|n| n.value), Some(2));
        }

        // `b` is the head now, `a` is free to go around again.
        unsafe {
            queue.enqueue(&a);
            assert_eq!(queue.try_dequeue().map(|n| n.value), Some(1));
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_transient_gap_reports_nothing() {
        let stub = TestNode::default();
        let x = node(42);
        let queue = Queue::new(&stub);

        let prev = open_gap(&queue, &x);
        assert!(ptr::eq(prev, &stub));

        unsafe {
            assert!(queue.try_dequeue().is_none());
            assert_eq!(queue.state(), QueueState::TransientGap);
            assert!(!queue.is_empty());
            // Nothing moved while the link was missing.
            assert!(ptr::eq(queue.head(), &stub));
        }

        // Finish the publication.
        unsafe { (*prev).link() }.set_next(as_mut_ptr(&x), Ordering::Release);

        unsafe {
            let got = queue.try_dequeue().expect("link published");
            assert_eq!(got.value, 42);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_dequeue_follows_exchange_order() {
        let stub = TestNode::default();
        let x = node(1);
        let y = node(2);
        let queue = Queue::new(&stub);

        // x wins the tail exchange, y follows; neither has published yet.
        let before_x = open_gap(&queue, &x);
        let before_y = open_gap(&queue, &y);
        assert!(ptr::eq(before_x, &stub));
        assert!(ptr::eq(before_y, &x));

        // y publishes first. Its link hangs off x, which is not reachable yet.
        unsafe { (*before_y).link() }.set_next(as_mut_ptr(&y), Ordering::Release);
        unsafe {
            assert!(queue.try_dequeue().is_none());
            assert_eq!(queue.state(), QueueState::TransientGap);
        }

        unsafe { (*before_x).link() }.set_next(as_mut_ptr(&x), Ordering::Release);
        let dequeue = || unsafe { queue.try_dequeue() }.map(|n| n.value);
        assert_eq!(dequeue(), Some(1));
        assert_eq!(dequeue(), Some(2));
        assert_eq!(dequeue(), None);
    }

    #[test]
    fn test_spin_budget_exhausted_in_gap() {
        let stub = TestNode::default();
        let x = node(7);
        let queue = Queue::new(&stub);

        let prev = open_gap(&queue, &x);

        unsafe {
            assert!(queue.try_dequeue_spin(64).is_none());
            assert!(queue.try_dequeue_spin(0).is_none());
            assert_eq!(queue.state(), QueueState::TransientGap);
        }

        unsafe { (*prev).link() }.set_next(as_mut_ptr(&x), Ordering::Release);
        unsafe {
            assert_eq!(queue.try_dequeue_spin(0).map(|n| n.value), Some(7));
        }
    }

    #[test]
    fn test_spin_variants_return_immediately_when_empty() {
        let stub = TestNode::default();
        let queue = Queue::new(&stub);

        unsafe {
            assert!(queue.try_dequeue_spin(usize::MAX).is_none());
            assert!(queue.try_dequeue_spin_until_linked().is_none());
        }
    }

    #[test]
    fn test_spin_resolves_gap_when_producer_publishes() {
        let stub = TestNode::default();
        let x = node(9);
        let queue = Queue::new(&stub);

        open_gap(&queue, &x);

        let got = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                stub.link().set_next(as_mut_ptr(&x), Ordering::Release);
            });
            unsafe { queue.try_dequeue_spin(usize::MAX) }.map(|n| n.value)
        });

        assert_eq!(got, Some(9));
    }

    #[test]
    fn test_spin_until_linked_resolves_gap() {
        let stub = TestNode::default();
        let x = node(11);
        let queue = Queue::new(&stub);

        open_gap(&queue, &x);

        let got = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                stub.link().set_next(as_mut_ptr(&x), Ordering::Release);
            });
            unsafe { queue.try_dequeue_spin_until_linked() }.map(|n| n.value)
        });

        assert_eq!(got, Some(11));
        unsafe { assert!(queue.is_empty()) };
    }

    #[test]
    fn test_from_raw_rejects_null_stub() {
        let result = unsafe { Queue::<TestNode>::from_raw(ptr::null()) };
        assert_eq!(result.err(), Some(QueueError::NullStub));
    }

    #[test]
    fn test_from_raw_and_enqueue_raw() {
        let stub = TestNode::default();
        let a = node(3);

        let queue = unsafe { Queue::from_raw(&stub as *const TestNode) }.expect("non-null stub");
        unsafe {
            assert_eq!(
                queue.enqueue_raw(ptr::null()),
                Err(QueueError::NullNode)
            );
            assert!(queue.is_empty());

            assert_eq!(queue.enqueue_raw(&a as *const TestNode), Ok(()));
            assert_eq!(queue.try_dequeue().map(|n| n.value), Some(3));
        }
    }

    #[test]
    fn test_consumer_claim_is_exclusive() {
        let stub = TestNode::default();
        let queue = Queue::new(&stub);

        let first = queue.consumer().expect("first claim");
        assert_eq!(queue.consumer().err(), Some(QueueError::ConsumerBusy));

        drop(first);
        assert!(queue.consumer().is_ok());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(QueueError::NullStub.to_string(), "stub node pointer is null");
        assert_eq!(QueueError::NullNode.to_string(), "node pointer is null");
        assert_eq!(
            QueueError::ConsumerBusy.to_string(),
            "queue already has an active consumer"
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already reachable")]
    fn test_double_enqueue_panics_in_debug() {
        let stub = TestNode::default();
        let a = node(1);
        let queue = Queue::new(&stub);

        unsafe {
            queue.enqueue(&a);
            queue.enqueue(&a);
        }
    }

    #[test]
    fn test_node_moves_to_second_queue_once_past_head() {
        let stub1 = TestNode::default();
        let stub2 = TestNode::default();
        let a = node(1);
        let b = node(2);
        let c = node(3);
        let q1 = Queue::new(&stub1);
        let q2 = Queue::new(&stub2);

        unsafe {
            q1.enqueue(&a);
            q1.enqueue(&b);
            assert_eq!(q1.try_dequeue().map(|n| n.value), Some(1));
            assert_eq!(q1.try_dequeue().map(|n| n.value), Some(2));
        }

        // q1 anchors on `b` now, so `a` carries no q1 link.
        unsafe {
            q2.enqueue(&a);
            q1.enqueue(&c);
        }

        assert!(ptr::eq(b.link().next(Ordering::Acquire), &c));
        assert!(a.link().next(Ordering::Acquire).is_null());
        unsafe {
            assert_eq!(q2.try_dequeue().map(|n| n.value), Some(1));
            assert!(q2.try_dequeue().is_none());
            assert_eq!(q1.try_dequeue().map(|n| n.value), Some(3));
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already reachable")]
    fn test_head_of_other_queue_enqueue_panics_in_debug() {
        let stub1 = TestNode::default();
        let stub2 = TestNode::default();
        let a = node(1);
        let q1 = Queue::new(&stub1);
        let q2 = Queue::new(&stub2);

        unsafe {
            q1.enqueue(&a);
            assert!(q1.try_dequeue().is_some());
            // `a` is still q1's head; q1's next enqueue would write into it.
            q2.enqueue(&a);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already reachable")]
    fn test_head_reenqueue_panics_in_debug() {
        let stub = TestNode::default();
        let a = node(1);
        let queue = Queue::new(&stub);

        unsafe {
            queue.enqueue(&a);
            assert!(queue.try_dequeue().is_some());
            queue.enqueue(&a);
        }
    }

    #[test]
    fn test_drop_releases_head_for_reuse() {
        let stub1 = TestNode::default();
        let stub2 = TestNode::default();
        let a = node(1);

        {
            let q1 = Queue::new(&stub1);
            unsafe {
                q1.enqueue(&a);
                assert!(q1.try_dequeue().is_some());
            }
        }

        let q2 = Queue::new(&stub2);
        unsafe {
            q2.enqueue(&a);
            assert_eq!(q2.try_dequeue().map(|n| n.value), Some(1));
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "stub node cannot be enqueued")]
    fn test_stub_enqueue_panics_in_debug() {
        let stub = TestNode::default();
        let queue = Queue::new(&stub);

        unsafe { queue.enqueue(&stub) };
    }

    #[test]
    fn test_multiple_producers() {
        let stub = TestNode::default();
        let num_producers = 4u64;
        let items_per_producer = 100u64;
        let nodes: Vec<TestNode> = (0..num_producers * items_per_producer)
            .map(node)
            .collect();
        let queue = Queue::new(&stub);

        thread::scope(|s| {
            for chunk in nodes.chunks(items_per_producer as usize) {
                let queue = &queue;
                s.spawn(move || {
                    for n in chunk {
                        // SAFETY: each node is enqueued exactly once.
                        unsafe { queue.enqueue(n) };
                    }
                });
            }
        });

        let mut seen = HashSet::new();
        while let Some(n) = unsafe { queue.try_dequeue() } {
            assert!(seen.insert(n.value), "duplicate value {}", n.value);
        }

        assert_eq!(seen.len() as u64, num_producers * items_per_producer);
        unsafe { assert!(queue.is_empty()) };
    }

    #[test]
    fn test_concurrent_producers_and_consumer() {
        let stub = TestNode::default();
        let num_producers = 4usize;
        let items_per_producer = 1000usize;
        let nodes: Vec<TestNode> = (0..num_producers * items_per_producer)
            .map(|i| node(i as u64))
            .collect();
        let queue = Queue::new(&stub);

        let received = thread::scope(|s| {
            for chunk in nodes.chunks(items_per_producer) {
                let queue = &queue;
                s.spawn(move || {
                    for n in chunk {
                        // SAFETY: each node is enqueued exactly once.
                        unsafe { queue.enqueue(n) };
                    }
                });
            }

            let consumer = s.spawn(|| {
                let mut received = Vec::with_capacity(nodes.len());
                while received.len() < nodes.len() {
                    match unsafe { queue.try_dequeue_spin_until_linked() } {
                        Some(n) => received.push(n.value),
                        None => std::hint::spin_loop(),
                    }
                }
                received
            });

            consumer.join().expect("consumer thread")
        });

        // Each producer's items come out in its own enqueue order.
        let mut last = vec![None; num_producers];
        for &value in &received {
            let producer = value as usize / items_per_producer;
            if let Some(prev) = last[producer] {
                assert!(value > prev, "producer {producer} out of order");
            }
            last[producer] = Some(value);
        }

        let unique: HashSet<u64> = received.iter().copied().collect();
        assert_eq!(unique.len(), num_producers * items_per_producer);
    }
}
