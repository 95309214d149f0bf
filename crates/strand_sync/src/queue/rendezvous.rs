use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Interrupted;
use crate::queue::{Iter, OfferTimeoutError, PollTimeoutError, PutError};
use crate::sync::{Condvar, ReentrantMutex};
use crate::thread;
use crate::time::Instant;

/// The handoff cell of one waiting producer or consumer.
///
/// A producer node starts as `Item` and ends as `Done` (taken) or
/// `Cancelled`; a consumer node starts as `Empty` and moves to `Item` when a
/// producer fills it. A party that gives up marks its node `Cancelled`; the
/// counterpart observes the sentinel, discards the node and retries.
enum Slot<T> {
    Empty,
    Item(T),
    Done,
    Cancelled,
}

struct WaitNode<T> {
    slot: ReentrantMutex<RefCell<Slot<T>>>,
    handed: Condvar,
}

impl<T> WaitNode<T> {
    fn new(slot: Slot<T>) -> Arc<Self> {
        Arc::new(Self {
            slot: ReentrantMutex::new(RefCell::new(slot)),
            handed: Condvar::new(),
        })
    }
}

struct Waiting<T> {
    producers: VecDeque<Arc<WaitNode<T>>>,
    consumers: VecDeque<Arc<WaitNode<T>>>,
}

enum PutStep<T> {
    Done,
    Retry(T),
    Wait(Arc<WaitNode<T>>),
}

enum TakeStep<T> {
    Got(T),
    Retry,
    Wait(Arc<WaitNode<T>>),
}

/// A rendezvous channel: each put blocks until a take receives the element,
/// and vice versa, with no intermediate buffering.
///
/// At most one of the internal waiter lists (arrived producers, arrived
/// consumers) is non-empty at any time. The default variant serves waiters
/// in stack order for cache locality; [`new_fair`](Self::new_fair) serves
/// strictly first-in-first-out.
///
/// Since the queue holds no elements, [`len`](Self::len) is always zero and
/// [`peek`](Self::peek) always empty.
///
/// Handles are cheap to clone and share the same queue.
pub struct RendezvousQueue<T> {
    inner: Arc<RendezvousInner<T>>,
}

struct RendezvousInner<T> {
    fair: bool,
    waiting: ReentrantMutex<RefCell<Waiting<T>>>,
}

impl<T> RendezvousQueue<T> {
    /// Creates an unfair (stack-ordered) rendezvous queue.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Creates a fair (queue-ordered) rendezvous queue.
    pub fn new_fair() -> Self {
        Self::with_fairness(true)
    }

    fn with_fairness(fair: bool) -> Self {
        Self {
            inner: Arc::new(RendezvousInner {
                fair,
                waiting: ReentrantMutex::new(RefCell::new(Waiting {
                    producers: VecDeque::new(),
                    consumers: VecDeque::new(),
                })),
            }),
        }
    }

    /// Whether waiters are served in arrival order.
    pub fn is_fair(&self) -> bool {
        self.inner.fair
    }

    /// Always zero: a rendezvous queue never holds an element.
    pub fn len(&self) -> usize {
        0
    }

    /// Always true.
    pub fn is_empty(&self) -> bool {
        true
    }

    /// Always zero.
    pub fn capacity(&self) -> usize {
        0
    }

    /// Always `None`.
    pub fn peek(&self) -> Option<T> {
        None
    }

    /// Always empty: a rendezvous queue holds no elements to traverse.
    pub fn iter(&self) -> Iter<T> {
        Iter::new(Vec::new())
    }

    /// Hands `item` to a consumer, blocking until one takes it.
    ///
    /// Fails with the element handed back if the calling thread is
    /// interrupted before the handoff happened.
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        if thread::interrupted() {
            return Err(PutError(item));
        }
        match self.put_internal(item, None) {
            Ok(()) => Ok(()),
            Err(OfferTimeoutError::Interrupted(item)) => Err(PutError(item)),
            Err(OfferTimeoutError::TimedOut(_)) => unreachable!("unbounded handoff timed out"),
        }
    }

    /// Hands `item` to an already waiting consumer, without blocking.
    ///
    /// On failure the element is handed back.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            let consumer = {
                let guard = self.inner.waiting.lock();
                let mut waiting = guard.borrow_mut();
                match waiting.consumers.pop_front() {
                    Some(consumer) => consumer,
                    None => return Err(item),
                }
            };
            match RendezvousInner::fill(&consumer, item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }
    }

    /// Hands `item` to a consumer, blocking at most `timeout`.
    ///
    /// A zero timeout degenerates to [`offer`](Self::offer).
    pub fn offer_for(&self, item: T, timeout: Duration) -> Result<(), OfferTimeoutError<T>> {
        if thread::interrupted() {
            return Err(OfferTimeoutError::Interrupted(item));
        }
        self.put_internal(item, Some(Instant::now() + timeout))
    }

    fn put_internal(
        &self,
        item: T,
        deadline: Option<Instant>,
    ) -> Result<(), OfferTimeoutError<T>> {
        let mut item = item;
        loop {
            match self.inner.put_step(item) {
                PutStep::Done => return Ok(()),
                PutStep::Retry(returned) => item = returned,
                PutStep::Wait(node) => return self.inner.await_taken(&node, deadline),
            }
        }
    }

    /// Receives an element from a producer, blocking until one arrives.
    pub fn take(&self) -> Result<T, Interrupted> {
        thread::check_interrupt()?;
        match self.take_internal(None) {
            Ok(item) => Ok(item),
            Err(PollTimeoutError::Interrupted) => Err(Interrupted),
            Err(PollTimeoutError::TimedOut) => unreachable!("unbounded handoff timed out"),
        }
    }

    /// Receives an element from an already waiting producer, without
    /// blocking.
    pub fn poll(&self) -> Option<T> {
        loop {
            let producer = {
                let guard = self.inner.waiting.lock();
                let mut waiting = guard.borrow_mut();
                waiting.producers.pop_front()?
            };
            if let Some(item) = RendezvousInner::drain(&producer) {
                return Some(item);
            }
        }
    }

    /// Receives an element from a producer, blocking at most `timeout`.
    pub fn poll_for(&self, timeout: Duration) -> Result<T, PollTimeoutError> {
        if thread::interrupted() {
            return Err(PollTimeoutError::Interrupted);
        }
        self.take_internal(Some(Instant::now() + timeout))
    }

    fn take_internal(&self, deadline: Option<Instant>) -> Result<T, PollTimeoutError> {
        loop {
            match self.inner.take_step() {
                TakeStep::Got(item) => return Ok(item),
                TakeStep::Retry => {}
                TakeStep::Wait(node) => return self.inner.await_filled(&node, deadline),
            }
        }
    }
}

impl<T> RendezvousInner<T> {
    /// Matches a waiting consumer or enqueues a producer node carrying
    /// `item`.
    fn put_step(&self, item: T) -> PutStep<T> {
        let guard = self.waiting.lock();
        let mut waiting = guard.borrow_mut();
        if let Some(consumer) = waiting.consumers.pop_front() {
            drop(waiting);
            drop(guard);
            match Self::fill(&consumer, item) {
                Ok(()) => PutStep::Done,
                Err(returned) => PutStep::Retry(returned),
            }
        } else {
            let node = WaitNode::new(Slot::Item(item));
            if self.fair {
                waiting.producers.push_back(node.clone());
            } else {
                waiting.producers.push_front(node.clone());
            }
            PutStep::Wait(node)
        }
    }

    /// Matches a waiting producer or enqueues an empty consumer node.
    fn take_step(&self) -> TakeStep<T> {
        let guard = self.waiting.lock();
        let mut waiting = guard.borrow_mut();
        if let Some(producer) = waiting.producers.pop_front() {
            drop(waiting);
            drop(guard);
            match Self::drain(&producer) {
                Some(item) => TakeStep::Got(item),
                None => TakeStep::Retry,
            }
        } else {
            let node = WaitNode::new(Slot::Empty);
            if self.fair {
                waiting.consumers.push_back(node.clone());
            } else {
                waiting.consumers.push_front(node.clone());
            }
            TakeStep::Wait(node)
        }
    }

    /// Fills a dequeued consumer node. Fails with the element if the
    /// consumer cancelled in the meantime.
    fn fill(node: &WaitNode<T>, item: T) -> Result<(), T> {
        let guard = node.slot.lock();
        let mut slot = guard.borrow_mut();
        match &*slot {
            Slot::Cancelled => Err(item),
            Slot::Empty => {
                *slot = Slot::Item(item);
                drop(slot);
                node.handed.notify_one();
                Ok(())
            }
            Slot::Item(_) | Slot::Done => unreachable!("consumer slot filled twice"),
        }
    }

    /// Empties a dequeued producer node. Returns `None` if the producer
    /// cancelled in the meantime.
    fn drain(node: &WaitNode<T>) -> Option<T> {
        let guard = node.slot.lock();
        let mut slot = guard.borrow_mut();
        match &*slot {
            Slot::Cancelled => None,
            Slot::Item(_) => {
                let Slot::Item(item) = mem::replace(&mut *slot, Slot::Done) else {
                    unreachable!()
                };
                drop(slot);
                node.handed.notify_one();
                Some(item)
            }
            Slot::Empty | Slot::Done => unreachable!("producer slot in impossible state"),
        }
    }

    /// Producer wait: parks on the node until its item is taken, the bound
    /// elapses or the thread is interrupted.
    fn await_taken(
        &self,
        node: &Arc<WaitNode<T>>,
        deadline: Option<Instant>,
    ) -> Result<(), OfferTimeoutError<T>> {
        let mut guard = node.slot.lock();
        loop {
            {
                let slot = guard.borrow();
                match &*slot {
                    Slot::Done => return Ok(()),
                    Slot::Item(_) => {}
                    Slot::Empty | Slot::Cancelled => {
                        unreachable!("producer slot in impossible state")
                    }
                }
            }
            let timed_out = match deadline {
                None => match node.handed.wait(&mut guard) {
                    Ok(()) => continue,
                    Err(Interrupted) => None,
                },
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Some(true)
                    } else {
                        match node
                            .handed
                            .wait_for(&mut guard, d.saturating_duration_since(now))
                        {
                            Ok(_) => continue,
                            Err(Interrupted) => None,
                        }
                    }
                }
            };
            // interrupted (None) or timed out (Some(true)): withdraw if the
            // handoff has not happened yet
            let mut slot = guard.borrow_mut();
            if let Slot::Item(_) = &*slot {
                let Slot::Item(item) = mem::replace(&mut *slot, Slot::Cancelled) else {
                    unreachable!()
                };
                drop(slot);
                drop(guard);
                self.unlink(node, true);
                return Err(match timed_out {
                    Some(true) => OfferTimeoutError::TimedOut(item),
                    _ => OfferTimeoutError::Interrupted(item),
                });
            }
            // a consumer took the element concurrently; the put completed
            drop(slot);
            if timed_out.is_none() {
                thread::current().reassert_interrupt();
            }
            return Ok(());
        }
    }

    /// Consumer wait: parks on the node until a producer fills it, the
    /// bound elapses or the thread is interrupted.
    fn await_filled(
        &self,
        node: &Arc<WaitNode<T>>,
        deadline: Option<Instant>,
    ) -> Result<T, PollTimeoutError> {
        let mut guard = node.slot.lock();
        loop {
            {
                let mut slot = guard.borrow_mut();
                if let Slot::Item(_) = &*slot {
                    let Slot::Item(item) = mem::replace(&mut *slot, Slot::Done) else {
                        unreachable!()
                    };
                    return Ok(item);
                }
            }
            let timed_out = match deadline {
                None => match node.handed.wait(&mut guard) {
                    Ok(()) => continue,
                    Err(Interrupted) => None,
                },
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Some(true)
                    } else {
                        match node
                            .handed
                            .wait_for(&mut guard, d.saturating_duration_since(now))
                        {
                            Ok(_) => continue,
                            Err(Interrupted) => None,
                        }
                    }
                }
            };
            let mut slot = guard.borrow_mut();
            if let Slot::Item(_) = &*slot {
                // a producer committed the handoff; accept the element and
                // hand a pending interrupt back to the caller
                let Slot::Item(item) = mem::replace(&mut *slot, Slot::Done) else {
                    unreachable!()
                };
                drop(slot);
                if timed_out.is_none() {
                    thread::current().reassert_interrupt();
                }
                return Ok(item);
            }
            *slot = Slot::Cancelled;
            drop(slot);
            drop(guard);
            self.unlink(node, false);
            return Err(match timed_out {
                Some(true) => PollTimeoutError::TimedOut,
                _ => PollTimeoutError::Interrupted,
            });
        }
    }

    /// Removes a cancelled node from its waiter list, if it is still
    /// enqueued.
    fn unlink(&self, node: &Arc<WaitNode<T>>, producer: bool) {
        let guard = self.waiting.lock();
        let mut waiting = guard.borrow_mut();
        let list = if producer {
            &mut waiting.producers
        } else {
            &mut waiting.consumers
        };
        if let Some(pos) = list.iter().position(|n| Arc::ptr_eq(n, node)) {
            list.remove(pos);
        }
    }
}

impl<T> Clone for RendezvousQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RendezvousQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for RendezvousQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousQueue")
            .field("fair", &self.inner.fair)
            .finish()
    }
}
