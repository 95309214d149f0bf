//! Thread parking and interruption.
//!
//! Every blocking operation in this crate suspends through the per-thread
//! parker defined here. A parker owns a single permit: [`Thread::unpark`]
//! makes the permit available and the next [`park`] consumes it without
//! blocking. Parks may also return spuriously; callers are expected to
//! re-check their predicate in a loop.
//!
//! Each thread additionally carries an interrupt flag, the cancellation
//! token consulted by the interruptible blocking operations. Interrupting a
//! thread wakes its parker; the flag itself is only consumed by
//! [`interrupted`] or by a blocking operation that fails with
//! [`Interrupted`](crate::error::Interrupted).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;
use crate::time::Instant;

struct Inner {
    lock: Mutex<bool>,
    cvar: Condvar,
    interrupted: AtomicBool,
}

/// A handle to another thread's parker and interrupt flag.
///
/// Handles are cheap to clone and remain usable after the thread exits
/// (unparking or interrupting a finished thread has no effect).
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

thread_local! {
    static CURRENT: Thread = Thread {
        inner: Arc::new(Inner {
            lock: Mutex::new(false),
            cvar: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }),
    };
}

/// Returns a handle for the calling thread.
pub fn current() -> Thread {
    CURRENT.with(Clone::clone)
}

/// A stable, non-zero identity for the calling thread.
pub(crate) fn current_id() -> usize {
    CURRENT.with(|t| t.id())
}

impl Thread {
    /// Makes this thread's permit available, waking it if it is parked.
    pub fn unpark(&self) {
        let mut permit = self.inner.lock.lock();
        *permit = true;
        self.inner.cvar.notify_one();
    }

    /// Sets this thread's interrupt flag and wakes its parker.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.unpark();
    }

    /// Returns whether the interrupt flag is set, without consuming it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Sets the interrupt flag without waking the parker.
    ///
    /// Used by blocking operations that observed an interrupt but completed
    /// anyway, to hand the flag back to the caller.
    pub(crate) fn reassert_interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }

    pub(crate) fn clear_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Checks and clears the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|t| t.clear_interrupt())
}

/// Fails with [`Interrupted`] (consuming the flag) if the calling thread has
/// a pending interrupt.
pub(crate) fn check_interrupt() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Blocks the calling thread until its permit becomes available.
///
/// Returns immediately if a permit is already pending. An interrupt wakes the
/// parker but leaves the flag untouched; spurious returns are permitted.
pub fn park() {
    CURRENT.with(|t| {
        let mut permit = t.inner.lock.lock();
        while !*permit {
            t.inner.cvar.wait(&mut permit);
        }
        *permit = false;
    });
}

/// Like [`park`], but returns after at most `timeout` even without a permit.
pub fn park_for(timeout: Duration) {
    CURRENT.with(|t| {
        let mut permit = t.inner.lock.lock();
        if !*permit {
            let _ = t.inner.cvar.wait_for(&mut permit, timeout);
        }
        *permit = false;
    });
}

/// Like [`park_for`], with the bound expressed as a deadline.
pub fn park_until(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    park_for(deadline.saturating_duration_since(now));
}
