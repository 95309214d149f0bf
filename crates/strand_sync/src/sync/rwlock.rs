use std::cell::UnsafeCell;
use std::fmt::{self, Debug, Display};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::error::Interrupted;
use crate::sync::backoff::Backoff;
use crate::sync::condvar::{Condvar, WaitTimeoutResult};
use crate::sync::mutex::RawReentrantMutex;

/// A reader-writer lock.
///
/// This type of lock allows a number of readers or at most one writer at any
/// point in time. Admission uses a reader-exit-counting protocol: an entry
/// mutex serializes writers and the brief reader entry section, and a pair
/// of wrapping counters (readers entered / readers exited) tells a writer
/// when the last reader has left. A writer holds the entry mutex for its
/// whole critical section, so new readers cannot slip past a waiting writer.
///
/// Downgrading is supported: a thread holding the write lock may acquire the
/// read lock (the entry mutex is reentrant) and then release the write lock.
/// Upgrading a read lock to a write lock is **not** supported and deadlocks.
///
/// The read side carries no condition facility; a write guard forwards
/// condition waits to the entry mutex via
/// [`RwLockWriteGuard::wait_on`].
///
/// The counters wrap at 32 bits; fewer than 2^32 concurrent readers are
/// assumed.
pub struct RwLock<T: ?Sized> {
    entry: RawReentrantMutex,
    write_check: RawReentrantMutex,
    drained: Condvar,
    entered: AtomicU32,
    exited: AtomicU32,
    writer_waiting: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock moves the protected value between threads.
unsafe impl<T: Send + ?Sized> Send for RwLock<T> {}
// SAFETY: readers share `&T` concurrently, so `T: Sync` is required in
// addition to `T: Send` for the writer side.
unsafe impl<T: Send + Sync + ?Sized> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub fn new(t: T) -> RwLock<T> {
        Self {
            entry: RawReentrantMutex::new(false),
            write_check: RawReentrantMutex::new(false),
            drained: Condvar::new(),
            entered: AtomicU32::new(0),
            exited: AtomicU32::new(0),
            writer_waiting: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this `RwLock`, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks this rwlock with shared read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// Blocks while a writer holds the lock or is waiting for it. Returns an
    /// RAII guard which releases the shared access once dropped.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.entry.lock();
        self.entered.fetch_add(1, Ordering::Relaxed);
        // SAFETY: acquired just above.
        unsafe { self.entry.unlock() };
        RwLockReadGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Attempts to acquire this rwlock with shared read access.
    ///
    /// Fails fast when a writer is waiting for the lock (so that a stream of
    /// readers cannot starve it), and otherwise retries a bounded backoff
    /// against transient contention on the entry mutex before giving up.
    ///
    /// This function does not park.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut backoff = Backoff::new();
        loop {
            if self.writer_waiting.load(Ordering::Acquire) {
                return None;
            }
            if self.entry.try_lock() {
                self.entered.fetch_add(1, Ordering::Relaxed);
                // SAFETY: acquired just above.
                unsafe { self.entry.unlock() };
                return Some(RwLockReadGuard {
                    lock: self,
                    marker: PhantomData,
                });
            }
            if !backoff.pause() {
                return None;
            }
        }
    }

    /// Locks this rwlock with exclusive write access, blocking the current
    /// thread until it can be acquired.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the write lock. The entry
    /// mutex itself is reentrant, but a second live write guard would alias
    /// the exclusive borrow it hands out.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        assert!(
            !self.entry.held_by_current(),
            "thread already holds the write lock"
        );
        self.entry.lock();
        self.wait_until_drained();
        RwLockWriteGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Attempts to lock this rwlock with exclusive write access.
    ///
    /// This function does not park.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.entry.held_by_current() || !self.entry.try_lock() {
            return None;
        }
        if self.entered.load(Ordering::Relaxed) != self.exited.load(Ordering::Relaxed) {
            // SAFETY: acquired just above.
            unsafe { self.entry.unlock() };
            return None;
        }
        Some(RwLockWriteGuard {
            lock: self,
            marker: PhantomData,
        })
    }

    /// Waits until every reader that entered has exited.
    ///
    /// Caller must hold the entry mutex, which keeps new readers out.
    fn wait_until_drained(&self) {
        if self.entered.load(Ordering::Relaxed) == self.exited.load(Ordering::Relaxed) {
            return;
        }
        self.writer_waiting.store(true, Ordering::Release);
        self.write_check.lock();
        while self.entered.load(Ordering::Relaxed) != self.exited.load(Ordering::Relaxed) {
            // an uninterruptible wait cannot fail
            let _ = self.drained.wait_raw(&self.write_check, None, false);
        }
        self.writer_waiting.store(false, Ordering::Release);
        // SAFETY: acquired above.
        unsafe { self.write_check.unlock() };
    }

    fn reader_exit(&self) {
        self.write_check.lock();
        let exited = self.exited.load(Ordering::Relaxed).wrapping_add(1);
        self.exited.store(exited, Ordering::Relaxed);
        if self.writer_waiting.load(Ordering::Relaxed) && exited == self.entered.load(Ordering::Relaxed)
        {
            self.drained.notify_one();
        }
        // SAFETY: acquired above.
        unsafe { self.write_check.unlock() };
    }

    /// Returns a mutable reference to the underlying data.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a raw pointer to the underlying data.
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: Debug + ?Sized> Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
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

impl<T: Default> Default for RwLock<T> {
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for RwLock<T> {
    #[inline]
    fn from(t: T) -> Self {
        Self::new(t)
    }
}

/// RAII structure used to release the shared read access of a lock when
/// dropped.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    marker: PhantomData<*const ()>,
}

// SAFETY: the guard only exposes `&T`.
unsafe impl<T: Sync + ?Sized> Sync for RwLockReadGuard<'_, T> {}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: no writer can be admitted while this reader is counted as
        // entered but not exited.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: Debug + ?Sized> Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: Display + ?Sized> Display for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.reader_exit();
    }
}

/// RAII structure used to release the exclusive write access of a lock when
/// dropped.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    marker: PhantomData<*const ()>,
}

// SAFETY: the guard only hands out references derived from `&mut T` while
// it is borrowed.
unsafe impl<T: Sync + ?Sized> Sync for RwLockWriteGuard<'_, T> {}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    /// Atomically downgrades this write lock into a read lock.
    ///
    /// No writer can be admitted between the downgrade and the first use of
    /// the returned read guard.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.entered.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the forgotten write guard held the entry mutex.
        unsafe { lock.entry.unlock() };
        RwLockReadGuard {
            lock,
            marker: PhantomData,
        }
    }

    /// Waits on `cond`, releasing the write lock while parked and
    /// re-acquiring it (including writer admission against any readers that
    /// entered in the meantime) before returning.
    ///
    /// The condition binds to this lock's entry mutex; using it with any
    /// other mutex afterwards panics.
    pub fn wait_on(&mut self, cond: &Condvar) -> Result<(), Interrupted> {
        let result = cond.wait_raw(&self.lock.entry, None, true).map(|_| ());
        self.lock.wait_until_drained();
        result
    }

    /// Like [`wait_on`](Self::wait_on), with a wait bound.
    pub fn wait_on_for(
        &mut self,
        cond: &Condvar,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, Interrupted> {
        let deadline = crate::time::Instant::now() + timeout;
        let result = cond.wait_raw(&self.lock.entry, Some(deadline), true);
        self.lock.wait_until_drained();
        result.map(|remaining| WaitTimeoutResult::from_remaining(remaining))
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: writer admission guarantees exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: writer admission guarantees exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Debug + ?Sized> Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: Display + ?Sized> Display for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the guard proves the entry mutex is held.
        unsafe { self.lock.entry.unlock() };
    }
}
