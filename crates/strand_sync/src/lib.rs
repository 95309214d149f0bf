//! Synchronization primitives for coordinating threads over shared state.
//!
//! The crate is layered bottom-up:
//!
//! - [`time`]: duration units and the monotonic clock.
//! - [`thread`]: the per-thread parking primitive and the interrupt flag
//!   consulted by every interruptible blocking operation.
//! - [`sync`]: a reentrant mutex (fair and barging), condition variables
//!   whose wait atomically releases and re-acquires the mutex, and a
//!   reader/writer lock with downgrade support.
//! - [`queue`]: a bounded two-lock blocking queue and a rendezvous queue.
//! - [`atomic`]: tagged (pointer, stamp) and (pointer, mark) cells for
//!   ABA-safe lock-free protocols.
//!
//! Blocking operations come in three flavors throughout: plain (defers
//! interruption), interruptible (fails with
//! [`Interrupted`](error::Interrupted), consuming the flag) and timed
//! (additionally bounded, with zero bounds never parking).

#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

pub mod atomic;
pub mod error;
pub mod queue;
pub mod sync;
pub mod thread;
pub mod time;
