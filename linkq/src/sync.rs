//! Synchronization primitives for in-process communication.
//!
//! This module provides safe handles over the lock-free queue cores for
//! communication between threads within the same process.

pub mod mpsc;
