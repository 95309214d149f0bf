//! Error types surfaced by the blocking operations of this crate.

use std::error::Error;
use std::fmt;

/// The calling thread was interrupted before or while it was blocked.
///
/// A blocking operation that fails with this error consumes the thread's
/// interrupt flag and leaves the touched data structure in the state it had
/// before the call; see [`crate::thread::interrupted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("blocking operation was interrupted")
    }
}

impl Error for Interrupted {}

/// A bounded lock acquisition ended without the lock being acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedLockError {
    /// The wait bound elapsed before the lock became available.
    TimedOut,
    /// The calling thread was interrupted while waiting for the lock.
    Interrupted,
}

impl fmt::Display for TimedLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimedLockError::TimedOut => f.write_str("timed lock acquisition timed out"),
            TimedLockError::Interrupted => f.write_str("timed lock acquisition was interrupted"),
        }
    }
}

impl Error for TimedLockError {}

impl From<Interrupted> for TimedLockError {
    fn from(_: Interrupted) -> Self {
        TimedLockError::Interrupted
    }
}

/// An unlock was attempted by a thread that does not hold the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStateError;

impl fmt::Display for MonitorStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mutex is not held by the current thread")
    }
}

impl Error for MonitorStateError {}

/// A queue was created with an unusable capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue capacity must be non-zero")
    }
}

impl Error for CapacityError {}
