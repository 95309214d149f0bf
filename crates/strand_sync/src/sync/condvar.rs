use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Interrupted;
use crate::sync::mutex::{unlink, RawReentrantMutex, ReentrantMutexGuard, Waiter};
use crate::thread;
use crate::time::Instant;

/// The outcome of a bounded condition wait.
///
/// Carries an estimate of the wait time that was left when the wait ended. A
/// non-positive remainder means the wait timed out; a positive remainder
/// means some other cause (signal, spurious wake) ended the wait with time
/// to spare, and callers that re-check their predicate can re-wait with the
/// remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult {
    remaining: i64,
}

impl WaitTimeoutResult {
    /// Whether the wait ended because the bound elapsed.
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.remaining <= 0
    }

    /// The estimated wait time left, in nanoseconds.
    #[inline]
    pub fn remaining_nanos(&self) -> i64 {
        self.remaining
    }

    pub(crate) fn from_remaining(remaining: i64) -> Self {
        Self { remaining }
    }
}

/// A condition variable bound to one [`ReentrantMutex`].
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. Waiting
/// atomically releases the mutex (through every recursion level) and
/// re-acquires it (restoring the recursion count) before returning, so at
/// the instant a wait returns the caller holds the mutex exactly as it did
/// on entry.
///
/// The variable binds to the first mutex it is used with; any attempt to
/// wait with a different mutex panics. Spurious wakeups are permitted, so
/// callers must verify their predicate in a loop (or use
/// [`wait_while`](Self::wait_while)).
///
/// [`ReentrantMutex`]: crate::sync::ReentrantMutex
pub struct Condvar {
    mutex: AtomicPtr<RawReentrantMutex>,
    waiters: parking_lot::Mutex<VecDeque<Arc<Waiter>>>,
}

impl Condvar {
    /// Creates a new condition variable which is ready to be waited on and
    /// notified.
    pub fn new() -> Self {
        Self {
            mutex: AtomicPtr::new(ptr::null_mut()),
            waiters: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    fn bind(&self, raw: &RawReentrantMutex) {
        let raw = raw as *const RawReentrantMutex as *mut RawReentrantMutex;
        match self
            .mutex
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(current) if current == raw => {}
            Err(_) => panic!("can not wait with differing mutexes"),
        }
    }

    /// The shared slow path of every wait variant.
    ///
    /// Returns the remaining-time estimate (`i64::MAX` for unbounded waits).
    /// On `Err(Interrupted)` the mutex has been re-acquired and the flag
    /// consumed; a waiter that is signalled and interrupted at the same time
    /// consumes the signal, returns `Ok`, and leaves the flag pending.
    pub(crate) fn wait_raw(
        &self,
        raw: &RawReentrantMutex,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> Result<i64, Interrupted> {
        assert!(
            raw.held_by_current(),
            "condition waited on without holding its mutex"
        );
        self.bind(raw);
        if interruptible && thread::interrupted() {
            return Err(Interrupted);
        }

        let waiter = Waiter::new();
        self.waiters.lock().push_back(waiter.clone());
        // SAFETY: the holder assertion above.
        let depth = unsafe { raw.release_all() };

        let mut interrupted = false;
        loop {
            if waiter.is_signalled() {
                break;
            }
            if interruptible && thread::current().is_interrupted() {
                if waiter.cancel() {
                    unlink(&mut self.waiters.lock(), &waiter);
                    let _ = thread::interrupted();
                    interrupted = true;
                }
                // if the cancel lost, a signal reached this waiter first:
                // consume it and return normally, flag still pending
                break;
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if waiter.cancel() {
                            unlink(&mut self.waiters.lock(), &waiter);
                        }
                        break;
                    }
                    thread::park_until(d);
                }
                None => thread::park(),
            }
        }

        raw.relock(depth);
        if interrupted {
            return Err(Interrupted);
        }
        Ok(match deadline {
            Some(d) => d.as_nanos().saturating_sub(Instant::now().as_nanos()),
            None => i64::MAX,
        })
    }

    /// Blocks the current thread until this condition variable receives a
    /// notification.
    ///
    /// Fails with [`Interrupted`] if the thread is interrupted before or
    /// while waiting; the mutex is re-acquired before the error is returned
    /// and the interrupt flag is consumed. A thread that is both signalled
    /// and interrupted returns `Ok` and keeps the flag set.
    #[inline]
    pub fn wait<T: ?Sized>(
        &self,
        guard: &mut ReentrantMutexGuard<'_, T>,
    ) -> Result<(), Interrupted> {
        self.wait_raw(guard.raw(), None, true).map(|_| ())
    }

    /// Like [`wait`](Self::wait), but defers interruption: an interrupt
    /// observed while waiting does not end the wait, and the flag is left
    /// set on return.
    #[inline]
    pub fn wait_uninterruptibly<T: ?Sized>(&self, guard: &mut ReentrantMutexGuard<'_, T>) {
        // an uninterruptible wait cannot fail
        let _ = self.wait_raw(guard.raw(), None, false);
    }

    /// Blocks the current thread until this condition variable receives a
    /// notification or `timeout` elapses.
    ///
    /// A zero timeout checks for a pending interrupt and returns without
    /// parking.
    #[inline]
    pub fn wait_for<T: ?Sized>(
        &self,
        guard: &mut ReentrantMutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, Interrupted> {
        let deadline = Instant::now() + timeout;
        self.wait_raw(guard.raw(), Some(deadline), true)
            .map(|remaining| WaitTimeoutResult { remaining })
    }

    /// Blocks the current thread until `condition` returns `false`.
    #[inline]
    pub fn wait_while<T: ?Sized, F>(
        &self,
        guard: &mut ReentrantMutexGuard<'_, T>,
        mut condition: F,
    ) -> Result<(), Interrupted>
    where
        F: FnMut(&T) -> bool,
    {
        while condition(&**guard) {
            self.wait(guard)?;
        }
        Ok(())
    }

    /// Blocks the current thread until `condition` returns `false` or
    /// `timeout` elapses.
    #[inline]
    pub fn wait_while_for<T: ?Sized, F>(
        &self,
        guard: &mut ReentrantMutexGuard<'_, T>,
        mut condition: F,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, Interrupted>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut result = WaitTimeoutResult {
            remaining: deadline.as_nanos().saturating_sub(Instant::now().as_nanos()),
        };
        while condition(&**guard) {
            if result.timed_out() {
                break;
            }
            result = WaitTimeoutResult {
                remaining: self.wait_raw(guard.raw(), Some(deadline), true)?,
            };
        }
        Ok(result)
    }

    /// Wakes up one blocked thread on this condvar.
    ///
    /// Returns whether a waiter was woken. The woken waiter does not return
    /// from its wait until it has re-acquired the mutex.
    #[inline]
    pub fn notify_one(&self) -> bool {
        // nothing to do if the condvar was never waited on
        if self.mutex.load(Ordering::Relaxed).is_null() {
            return false;
        }
        self.notify_one_slow()
    }

    #[cold]
    fn notify_one_slow(&self) -> bool {
        let mut waiters = self.waiters.lock();
        let notified = loop {
            match waiters.pop_front() {
                None => break false,
                Some(w) => {
                    if w.signal() {
                        break true;
                    }
                    // cancelled entry: discard and keep scanning
                }
            }
        };
        if waiters.is_empty() {
            self.mutex.store(ptr::null_mut(), Ordering::Release);
        }
        notified
    }

    /// Wakes up all blocked threads on this condvar.
    ///
    /// Returns the number of waiters woken.
    #[inline]
    pub fn notify_all(&self) -> usize {
        if self.mutex.load(Ordering::Relaxed).is_null() {
            return 0;
        }
        self.notify_all_slow()
    }

    #[cold]
    fn notify_all_slow(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let mut notified = 0;
        while let Some(w) = waiters.pop_front() {
            if w.signal() {
                notified += 1;
            }
        }
        self.mutex.store(ptr::null_mut(), Ordering::Release);
        notified
    }
}

impl Default for Condvar {
    #[inline]
    fn default() -> Self {
        Condvar::new()
    }
}

impl Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
