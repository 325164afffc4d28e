//! Intrusive, allocation-free, lock-free MPSC queue.
//!
//! Elements embed a [`Link`] and implement [`Node`] (usually through
//! `#[derive(Node)]`). Any number of producers append through a shared
//! [`Queue`]; exactly one consumer drains it, either through the `unsafe`
//! consumer methods on [`Queue`] or through a [`sync::mpsc::Consumer`] handle.
//!
//! - [`node`] - Link storage and the node capability trait
//! - [`mpsc`] - The queue algorithm
//! - [`sync`] - Safe consumer handle

// Allow the crate to reference itself as ::linkq for derive macro usage
extern crate self as linkq;

pub mod mpsc;
pub mod node;
pub mod sync;
mod trace;

pub use mpsc::{Queue, QueueError, QueueState};
pub use node::{Link, Node};
pub use trace::init_tracing;

#[doc(inline)]
pub use linkq_derive::Node;
