//! Synchronization primitives built on the thread parker.
//!
//! The mutex here is reentrant and comes in a fair and a barging flavor;
//! conditions bind to one mutex and release it atomically around the wait;
//! the reader/writer lock composes the two. All blocking goes through
//! [`crate::thread`], and every interruptible operation reports
//! interruption as an error value rather than unwinding.

mod backoff;
mod condvar;
mod mutex;
mod rwlock;

pub use backoff::Backoff;
pub use condvar::{Condvar, WaitTimeoutResult};
pub use mutex::{RawReentrantMutex, ReentrantMutex, ReentrantMutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
