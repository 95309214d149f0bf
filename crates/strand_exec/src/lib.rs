//! Work-stealing fork/join execution and scheduled timers.
//!
//! [`Pool`] runs divide-and-conquer [`Task`]s over per-worker deques with
//! randomized stealing; [`co_invoke`] is the building block for recursive
//! decomposition. [`Timer`] drives delay-ordered actions from a single
//! worker thread over a binary min-heap.
//!
//! Built on the primitives of [`strand_sync`].

#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod pool;
mod task;
mod timer;

pub use strand_sync::time::Instant;

pub use pool::{surplus_task_count, Pool};
pub use task::{co_invoke, JoinError, JoinTimeoutError, NotWorkerError, Task};
pub use timer::{ScheduleError, Timer, TimerHandle};
