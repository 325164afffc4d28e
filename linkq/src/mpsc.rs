//! Core MPSC (Multi-Producer Single-Consumer) queue primitives.
//!
//! This module contains the intrusive node-based MPSC queue algorithm.
//! Producers never wait; the single consumer only spins when it explicitly
//! asks to.
//!
//! Used by:
//! - [`crate::sync::mpsc`] - Safe single-consumer handle

mod queue;

pub use queue::{Queue, QueueError, QueueState};
