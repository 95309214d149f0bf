use std::cell::Cell;
use std::fmt::{self, Debug};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CapacityError, Interrupted};
use crate::queue::{Iter, OfferTimeoutError, PollTimeoutError, PutError};
use crate::sync::{Condvar, ReentrantMutex, ReentrantMutexGuard};
use crate::time::Instant;

//  A variant of the "two lock queue" algorithm. The put mutex gates entry
//  to put and offer, and has an associated not-full condition for waiting
//  puts. Similarly for the take mutex. The count field that they both rely
//  on is maintained as an atomic to avoid needing to get both locks in most
//  cases. Also, to minimize need for puts to get the take mutex and
//  vice-versa, cascading signals are used: when a put notices that it has
//  enabled at least one take, it signals a taker, and that taker in turn
//  signals others if more items have been entered since the signal.
//  Operations such as remove and the snapshot views acquire both locks,
//  always put side before take side.
//
//  Visibility is provided by pairing the release ordering on count updates
//  with the acquire ordering on count reads from the opposite side: a taker
//  that observes count == n sees the first n linked nodes.

struct Node<T> {
    item: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn boxed(item: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }))
    }
}

/// One end's node pointer. Guarded by that end's mutex.
struct NodePtr<T>(Cell<*mut Node<T>>);

impl<T> NodePtr<T> {
    fn get(&self) -> *mut Node<T> {
        self.0.get()
    }

    fn set(&self, node: *mut Node<T>) {
        self.0.set(node);
    }
}

// SAFETY: the pointer is only dereferenced while holding the mutex that
// guards this end of the queue.
unsafe impl<T: Send> Send for NodePtr<T> {}

/// A bounded blocking queue in which values are held by a linked list.
///
/// The queue orders elements first-in-first-out. Producers block on
/// [`put`](Self::put) while the queue is full, consumers block on
/// [`take`](Self::take) while it is empty; timed and non-blocking variants
/// of both are provided. Producers and consumers synchronize on separate
/// mutexes, so a put and a take can proceed concurrently.
///
/// Handles are cheap to clone and share the same queue.
pub struct LinkedQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    capacity: usize,
    count: AtomicUsize,
    // take side: sentinel node whose successors carry the items
    head: ReentrantMutex<NodePtr<T>>,
    // put side: last linked node
    last: ReentrantMutex<NodePtr<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> LinkedQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError);
        }
        let sentinel = Node::boxed(None);
        Ok(Self {
            inner: Arc::new(QueueInner {
                capacity,
                count: AtomicUsize::new(0),
                head: ReentrantMutex::new(NodePtr(Cell::new(sentinel))),
                last: ReentrantMutex::new(NodePtr(Cell::new(sentinel))),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        })
    }

    /// The number of elements currently queued.
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Whether the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity of this queue.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// How many more elements the queue can accept right now.
    pub fn remaining_capacity(&self) -> usize {
        self.inner.capacity - self.len().min(self.inner.capacity)
    }

    /// Inserts `item`, blocking while the queue is full.
    ///
    /// Fails with the element handed back if the calling thread is
    /// interrupted before the insertion happened.
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        let q = &*self.inner;
        let mut last = match q.last.lock_interruptibly() {
            Ok(guard) => guard,
            Err(Interrupted) => return Err(PutError(item)),
        };
        while q.count.load(Ordering::Acquire) == q.capacity {
            if q.not_full.wait(&mut last).is_err() {
                // pass the wake on so another producer is not stranded
                q.not_full.notify_one();
                return Err(PutError(item));
            }
        }
        self.finish_put(last, item);
        Ok(())
    }

    /// Inserts `item` only if the queue is not full, without blocking.
    ///
    /// On failure the element is handed back.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let q = &*self.inner;
        if q.count.load(Ordering::Acquire) == q.capacity {
            return Err(item);
        }
        let last = q.last.lock();
        if q.count.load(Ordering::Acquire) == q.capacity {
            return Err(item);
        }
        self.finish_put(last, item);
        Ok(())
    }

    /// Inserts `item`, blocking at most `timeout` while the queue is full.
    ///
    /// A zero timeout tries once and never parks.
    pub fn offer_for(&self, item: T, timeout: Duration) -> Result<(), OfferTimeoutError<T>> {
        let q = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut last = match q.last.lock_interruptibly() {
            Ok(guard) => guard,
            Err(Interrupted) => return Err(OfferTimeoutError::Interrupted(item)),
        };
        while q.count.load(Ordering::Acquire) == q.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(OfferTimeoutError::TimedOut(item));
            }
            let remaining = deadline.saturating_duration_since(now);
            if q.not_full.wait_for(&mut last, remaining).is_err() {
                q.not_full.notify_one();
                return Err(OfferTimeoutError::Interrupted(item));
            }
        }
        self.finish_put(last, item);
        Ok(())
    }

    /// Links `item` at the tail and performs the signalling protocol. The
    /// caller verified there is room.
    fn finish_put(&self, last: ReentrantMutexGuard<'_, NodePtr<T>>, item: T) {
        let q = &*self.inner;
        let node = Node::boxed(Some(item));
        let tail = last.get();
        // SAFETY: the put mutex guards the tail pointer, and the tail node
        // stays allocated until a taker consumes it.
        unsafe { (*tail).next = node };
        last.set(node);
        let old = q.count.fetch_add(1, Ordering::AcqRel);
        if old + 1 < q.capacity {
            // room remains: cascade to the next waiting producer
            q.not_full.notify_one();
        }
        drop(last);
        if old == 0 {
            q.signal_not_empty();
        }
    }

    /// Removes the element at the head, blocking while the queue is empty.
    pub fn take(&self) -> Result<T, Interrupted> {
        let q = &*self.inner;
        let mut head = q.head.lock_interruptibly()?;
        while q.count.load(Ordering::Acquire) == 0 {
            if let Err(e) = q.not_empty.wait(&mut head) {
                // pass the wake on so another consumer is not stranded
                q.not_empty.notify_one();
                return Err(e);
            }
        }
        Ok(self.finish_take(head))
    }

    /// Removes the element at the head only if one is present, without
    /// blocking.
    pub fn poll(&self) -> Option<T> {
        let q = &*self.inner;
        if q.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let head = q.head.lock();
        if q.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.finish_take(head))
    }

    /// Removes the element at the head, blocking at most `timeout` while
    /// the queue is empty.
    ///
    /// A zero timeout tries once and never parks.
    pub fn poll_for(&self, timeout: Duration) -> Result<T, PollTimeoutError> {
        let q = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut head = q.head.lock_interruptibly()?;
        while q.count.load(Ordering::Acquire) == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(PollTimeoutError::TimedOut);
            }
            let remaining = deadline.saturating_duration_since(now);
            if q.not_empty.wait_for(&mut head, remaining).is_err() {
                q.not_empty.notify_one();
                return Err(PollTimeoutError::Interrupted);
            }
        }
        Ok(self.finish_take(head))
    }

    /// Unlinks the head element and performs the signalling protocol. The
    /// caller verified the queue is non-empty.
    fn finish_take(&self, head: ReentrantMutexGuard<'_, NodePtr<T>>) -> T {
        let q = &*self.inner;
        let sentinel = head.get();
        // SAFETY: count > 0, so the sentinel has a successor; the take
        // mutex guards the head pointer.
        let first = unsafe { (*sentinel).next };
        head.set(first);
        // SAFETY: the old sentinel is no longer reachable.
        drop(unsafe { Box::from_raw(sentinel) });
        // SAFETY: `first` became the new sentinel; its item is present.
        let item = unsafe { (*first).item.take().expect("queue node already consumed") };
        let old = q.count.fetch_sub(1, Ordering::AcqRel);
        if old > 1 {
            // more items remain: cascade to the next waiting consumer
            q.not_empty.notify_one();
        }
        drop(head);
        if old == q.capacity {
            q.signal_not_full();
        }
        item
    }

    /// Clones the element at the head without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let q = &*self.inner;
        let head = q.head.lock();
        if q.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        // SAFETY: count > 0 under the take mutex, so the successor exists
        // and carries an item.
        unsafe { (*(*head.get()).next).item.clone() }
    }

    /// Removes the first element equal to `item`, if any.
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let q = &*self.inner;
        // both ends, put side first
        let last = q.last.lock();
        let head = q.head.lock();
        let mut pred = head.get();
        loop {
            // SAFETY: both mutexes are held, so the whole list is stable.
            let cur = unsafe { (*pred).next };
            if cur.is_null() {
                return false;
            }
            // SAFETY: as above; every node past the sentinel has an item.
            let matches = unsafe { (*cur).item.as_ref() } == Some(item);
            if matches {
                // SAFETY: unlinking under both mutexes; `cur` becomes
                // unreachable before it is freed.
                unsafe {
                    (*pred).next = (*cur).next;
                    if last.get() == cur {
                        last.set(pred);
                    }
                    drop(Box::from_raw(cur));
                }
                let old = q.count.fetch_sub(1, Ordering::AcqRel);
                if old == q.capacity {
                    q.not_full.notify_one();
                }
                return true;
            }
            pred = cur;
        }
    }

    /// Copies the queued elements, oldest first.
    ///
    /// The snapshot is taken under both mutexes.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let q = &*self.inner;
        let _last = q.last.lock();
        let head = q.head.lock();
        let mut out = Vec::with_capacity(q.count.load(Ordering::Acquire));
        // SAFETY: both mutexes are held, so the whole list is stable.
        let mut node = unsafe { (*head.get()).next };
        while !node.is_null() {
            // SAFETY: as above.
            unsafe {
                if let Some(item) = (*node).item.as_ref() {
                    out.push(item.clone());
                }
                node = (*node).next;
            }
        }
        out
    }

    /// A weakly consistent iterator over a snapshot of the queue, oldest
    /// element first.
    pub fn iter(&self) -> Iter<T>
    where
        T: Clone,
    {
        Iter::new(self.to_vec())
    }
}

impl<T> QueueInner<T> {
    /// Wakes a waiting consumer. Called by a producer that just made the
    /// queue non-empty; takes the consumer side's mutex, so it is deferred
    /// until the put mutex has been released.
    fn signal_not_empty(&self) {
        let _head = self.head.lock();
        self.not_empty.notify_one();
    }

    /// Wakes a waiting producer. Called by a consumer that just made the
    /// queue non-full.
    fn signal_not_full(&self) {
        let _last = self.last.lock();
        self.not_full.notify_one();
    }
}

impl<T> Clone for LinkedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for LinkedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> Drop for QueueInner<T> {
    fn drop(&mut self) {
        let mut node = self.head.get_mut().get();
        while !node.is_null() {
            // SAFETY: dropping the last handle gives exclusive access to
            // the whole list.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}
