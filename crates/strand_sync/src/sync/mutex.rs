use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Interrupted, MonitorStateError, TimedLockError};
use crate::sync::backoff::Backoff;
use crate::thread::{self, Thread};
use crate::time::Instant;

const WAITING: u8 = 0;
const SIGNALLED: u8 = 1;
const CANCELLED: u8 = 2;

/// A parked thread enqueued on a mutex or a condition variable.
///
/// The state field resolves the races between wake-up causes: a waiter moves
/// from `WAITING` to exactly one of `SIGNALLED` (a wake-up was dedicated to
/// it) or `CANCELLED` (it gave up due to a timeout or an interrupt).
pub(crate) struct Waiter {
    thread: Thread,
    state: AtomicU8,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            state: AtomicU8::new(WAITING),
        })
    }

    /// Dedicates a wake-up to this waiter. Returns `false` if the waiter
    /// already cancelled.
    pub(crate) fn signal(&self) -> bool {
        match self
            .state
            .compare_exchange(WAITING, SIGNALLED, Ordering::AcqRel, Ordering::Acquire)
        {
            // Err(SIGNALLED): woken before but not yet through; make sure
            // it is awake again
            Ok(_) | Err(SIGNALLED) => {
                self.thread.unpark();
                true
            }
            Err(_) => false,
        }
    }

    /// Withdraws this waiter. Returns `false` if a signal won the race, in
    /// which case the caller owns a wake-up it must pass on.
    pub(crate) fn cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALLED
    }
}

/// Removes `waiter` from `queue` if it is still enqueued.
pub(crate) fn unlink(queue: &mut VecDeque<Arc<Waiter>>, waiter: &Arc<Waiter>) {
    if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
        queue.remove(pos);
    }
}

/// Wakes the first live waiter of `queue`, discarding cancelled entries.
pub(crate) fn wake_first(queue: &mut VecDeque<Arc<Waiter>>) {
    while let Some(front) = queue.front() {
        if front.signal() {
            break;
        }
        queue.pop_front();
    }
}

/// The state machine of a reentrant mutex, without the data it protects.
///
/// The fast path is a single compare-and-swap on the owner word. Contended
/// acquisitions enqueue a [`Waiter`] in arrival order and park; a release
/// wakes the first live waiter, which re-checks the owner word and either
/// acquires or parks again. Whether an acquirer may barge past the queue is
/// decided by the fairness flag: the default variant always attempts the
/// owner CAS, the fair variant only when the queue is empty.
pub struct RawReentrantMutex {
    owner: AtomicUsize,
    recursion: Cell<usize>,
    waiters: AtomicUsize,
    fair: bool,
    queue: parking_lot::Mutex<VecDeque<Arc<Waiter>>>,
}

// SAFETY: `recursion` is only read and written by the thread stored in
// `owner`, and ownership transfer is ordered by the acquire/release pair on
// the owner word.
unsafe impl Send for RawReentrantMutex {}
// SAFETY: see above.
unsafe impl Sync for RawReentrantMutex {}

impl RawReentrantMutex {
    /// Creates an unheld mutex. `fair` selects strict arrival-order
    /// admission.
    pub fn new(fair: bool) -> Self {
        Self {
            owner: AtomicUsize::new(0),
            recursion: Cell::new(0),
            waiters: AtomicUsize::new(0),
            fair,
            queue: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Whether this mutex admits strictly in arrival order.
    #[inline]
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Whether some thread currently holds the mutex.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    /// Whether the calling thread holds the mutex.
    #[inline]
    pub fn held_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread::current_id()
    }

    /// The recursion depth of the calling thread, or 0 if it is not the
    /// holder.
    #[inline]
    pub fn hold_count(&self) -> usize {
        if self.held_by_current() {
            self.recursion.get()
        } else {
            0
        }
    }

    #[inline]
    fn try_acquire(&self, me: usize) -> bool {
        self.owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the mutex without blocking, barging past any queued waiters.
    /// A thread that already holds the mutex deepens its recursion.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let me = thread::current_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.recursion.set(self.recursion.get() + 1);
            return true;
        }
        if self.try_acquire(me) {
            self.recursion.set(1);
            true
        } else {
            false
        }
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// An interrupt observed while waiting is deferred: the acquisition
    /// completes and the flag is left set for the caller.
    #[inline]
    pub fn lock(&self) {
        if !self.try_lock() {
            // the slow path cannot fail without a deadline or interruption
            let _ = self.lock_slow(None, false);
        }
    }

    /// Acquires the mutex, failing with [`Interrupted`] if the calling
    /// thread is interrupted before or while waiting.
    #[inline]
    pub fn lock_interruptibly(&self) -> Result<(), Interrupted> {
        if self.try_lock() {
            thread::check_interrupt().inspect_err(|_| {
                // keep the mutex state untouched on failure
                // SAFETY: acquired just above by this thread.
                unsafe { self.unlock() };
            })
        } else {
            match self.lock_slow(None, true) {
                Ok(()) => Ok(()),
                Err(_) => Err(Interrupted),
            }
        }
    }

    /// Acquires the mutex, waiting at most `timeout`.
    ///
    /// A zero timeout attempts the acquisition once and never parks.
    #[inline]
    pub fn try_lock_for(&self, timeout: Duration) -> Result<(), TimedLockError> {
        if self.try_lock() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        self.lock_slow(Some(deadline), true)
    }

    #[cold]
    fn lock_slow(
        &self,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> Result<(), TimedLockError> {
        let me = thread::current_id();
        if interruptible && thread::interrupted() {
            return Err(TimedLockError::Interrupted);
        }

        let waiter = Waiter::new();
        {
            let mut queue = self.queue.lock();
            // Fair locks take a free mutex directly only while nothing is
            // queued; barging locks always try.
            if (!self.fair || queue.is_empty()) && self.try_acquire(me) {
                self.recursion.set(1);
                return Ok(());
            }
            queue.push_back(waiter.clone());
            self.waiters.fetch_add(1, Ordering::Release);
        }

        let mut backoff = Backoff::new();
        loop {
            if self.may_attempt(&waiter) && self.try_acquire(me) {
                self.recursion.set(1);
                self.forget_waiter(&waiter);
                return Ok(());
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.cancel_waiter(&waiter);
                    return Err(TimedLockError::TimedOut);
                }
            }

            if interruptible && thread::current().is_interrupted() {
                self.cancel_waiter(&waiter);
                let _ = thread::interrupted();
                return Err(TimedLockError::Interrupted);
            }

            backoff.pause_or_park(deadline);
        }
    }

    /// Whether this waiter may attempt the owner CAS on this pass.
    fn may_attempt(&self, waiter: &Arc<Waiter>) -> bool {
        if !self.fair {
            return true;
        }
        let queue = self.queue.lock();
        queue.front().map_or(true, |w| Arc::ptr_eq(w, waiter))
    }

    /// Removes a waiter that acquired the mutex.
    fn forget_waiter(&self, waiter: &Arc<Waiter>) {
        let mut queue = self.queue.lock();
        unlink(&mut queue, waiter);
        self.waiters.fetch_sub(1, Ordering::Release);
    }

    /// Removes a waiter that gave up. If a signal already reached it, the
    /// wake-up is passed on to the next live waiter.
    fn cancel_waiter(&self, waiter: &Arc<Waiter>) {
        let signalled = !waiter.cancel();
        let mut queue = self.queue.lock();
        unlink(&mut queue, waiter);
        self.waiters.fetch_sub(1, Ordering::Release);
        if signalled && !self.is_locked() {
            wake_first(&mut queue);
        }
    }

    /// Releases one level of recursion, waking the next waiter when the
    /// mutex becomes free.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the mutex.
    #[inline]
    pub unsafe fn unlock(&self) {
        let recursion = self.recursion.get();
        if recursion > 1 {
            self.recursion.set(recursion - 1);
            return;
        }
        self.recursion.set(0);
        self.owner.store(0, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) != 0 {
            self.wake_next();
        }
    }

    /// Like [`unlock`](Self::unlock), but verifies the caller first.
    pub fn unlock_checked(&self) -> Result<(), MonitorStateError> {
        if !self.held_by_current() {
            return Err(MonitorStateError);
        }
        // SAFETY: verified just above.
        unsafe { self.unlock() };
        Ok(())
    }

    #[cold]
    fn wake_next(&self) {
        let mut queue = self.queue.lock();
        wake_first(&mut queue);
    }

    /// Releases the mutex entirely, returning the recursion depth to restore
    /// with [`relock`](Self::relock). Used by condition waits.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the mutex.
    pub(crate) unsafe fn release_all(&self) -> usize {
        let recursion = self.recursion.get();
        self.recursion.set(0);
        self.owner.store(0, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) != 0 {
            self.wake_next();
        }
        recursion
    }

    /// Re-acquires the mutex after [`release_all`](Self::release_all),
    /// restoring the saved recursion depth. Never fails; an interrupt
    /// observed while re-acquiring is left pending.
    pub(crate) fn relock(&self, recursion: usize) {
        self.lock();
        self.recursion.set(recursion.max(1));
    }
}

impl Debug for RawReentrantMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawReentrantMutex")
            .field("locked", &self.is_locked())
            .field("fair", &self.fair)
            .finish_non_exhaustive()
    }
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The mutex is *reentrant*: the thread holding it may lock it again,
/// deepening a recursion count that must be unwound by dropping the same
/// number of guards. Because several guards may be live on the owning thread
/// at once, guards dereference to `&T` only; use interior mutability
/// ([`Cell`], [`RefCell`](std::cell::RefCell)) to mutate the protected data.
///
/// Two admission policies are available: [`new`](Self::new) permits barging
/// (a newly arriving thread may take a free mutex ahead of queued waiters),
/// while [`new_fair`](Self::new_fair) grants the mutex strictly in arrival
/// order.
pub struct ReentrantMutex<T: ?Sized> {
    raw: RawReentrantMutex,
    data: UnsafeCell<T>,
}

// SAFETY: the mutex moves the protected value between threads.
unsafe impl<T: Send + ?Sized> Send for ReentrantMutex<T> {}
// SAFETY: only the owning thread can reach `&T`, so `T: Send` suffices.
unsafe impl<T: Send + ?Sized> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    /// Creates a barging mutex in an unlocked state ready for use.
    pub fn new(val: T) -> Self {
        Self {
            raw: RawReentrantMutex::new(false),
            data: UnsafeCell::new(val),
        }
    }

    /// Creates a fair mutex in an unlocked state ready for use.
    pub fn new_fair(val: T) -> Self {
        Self {
            raw: RawReentrantMutex::new(true),
            data: UnsafeCell::new(val),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// An interrupt observed while waiting is deferred: the lock is still
    /// acquired and the interrupt flag is left set.
    #[inline]
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        self.raw.lock();
        ReentrantMutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the mutex, failing with
    /// [`Interrupted`](crate::error::Interrupted) if the calling thread is
    /// interrupted before or while waiting.
    #[inline]
    pub fn lock_interruptibly(&self) -> Result<ReentrantMutexGuard<'_, T>, Interrupted> {
        self.raw.lock_interruptibly()?;
        Ok(ReentrantMutexGuard {
            mutex: self,
            marker: PhantomData,
        })
    }

    /// Attempts to acquire this lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(ReentrantMutexGuard {
                mutex: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Attempts to acquire this lock, waiting at most `timeout`.
    ///
    /// A zero timeout tries once and never parks.
    #[inline]
    pub fn try_lock_for(
        &self,
        timeout: Duration,
    ) -> Result<ReentrantMutexGuard<'_, T>, TimedLockError> {
        self.raw.try_lock_for(timeout)?;
        Ok(ReentrantMutexGuard {
            mutex: self,
            marker: PhantomData,
        })
    }

    /// Whether the calling thread holds this mutex.
    #[inline]
    pub fn held_by_current(&self) -> bool {
        self.raw.held_by_current()
    }

    /// The calling thread's recursion depth, or 0 if it is not the holder.
    #[inline]
    pub fn hold_count(&self) -> usize {
        self.raw.hold_count()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the mutex mutably, no actual locking needs to
    /// take place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a raw pointer to the underlying data.
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Forcibly releases one level of recursion.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the mutex, with a guard that was leaked
    /// rather than dropped.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        // SAFETY: forwarded precondition.
        unsafe { self.raw.unlock() }
    }
}

impl<T: Debug + ?Sized> Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReentrantMutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish()
    }
}

impl<T: Default> Default for ReentrantMutex<T> {
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for ReentrantMutex<T> {
    #[inline]
    fn from(val: T) -> Self {
        Self::new(val)
    }
}

/// An RAII implementation of a "scoped lock" of a reentrant mutex. When this
/// structure is dropped (falls out of scope), one level of recursion is
/// released.
///
/// The data protected by the mutex can be accessed through this guard via
/// its [`Deref`] implementation.
#[must_use = "if unused the ReentrantMutex will immediately unlock"]
pub struct ReentrantMutexGuard<'a, T: ?Sized> {
    mutex: &'a ReentrantMutex<T>,
    marker: PhantomData<*const ()>,
}

// SAFETY: the guard only exposes `&T`.
unsafe impl<T: Sync + ?Sized> Sync for ReentrantMutexGuard<'_, T> {}

impl<T: ?Sized> ReentrantMutexGuard<'_, T> {
    pub(crate) fn raw(&self) -> &RawReentrantMutex {
        &self.mutex.raw
    }
}

impl<T: ?Sized> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard proves the calling thread holds the mutex, and
        // only `&T` is ever produced.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: Debug + ?Sized> Debug for ReentrantMutexGuard<'_, T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: Display + ?Sized> Display for ReentrantMutexGuard<'_, T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: ?Sized> Drop for ReentrantMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the existence of the guard proves ownership.
        unsafe { self.mutex.raw.unlock() }
    }
}
