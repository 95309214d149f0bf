use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use strand_sync::time::Instant;

const VIRGIN: u8 = 0;
const SCHEDULED: u8 = 1;
const EXECUTED: u8 = 2;
const CANCELLED: u8 = 3;

const LIVE: u8 = 0;
const STOPPED: u8 = 1;
const DEAD: u8 = 2;

/// Per-entry scheduling data, guarded by the entry's own lock so a handle
/// can cancel without touching the timer monitor.
struct Sched {
    state: u8,
    /// next trigger instant
    next: Instant,
    /// 0 = one-shot; > 0 = fixed-rate; < 0 = fixed-delay of magnitude
    /// `|period|` (all nanoseconds)
    period: i64,
}

struct TimerEntry {
    sched: Mutex<Sched>,
    action: Mutex<Box<dyn FnMut() + Send + 'static>>,
}

/// A handle to a scheduled action.
///
/// Handles are cheap to clone; cancelling through any clone prevents all
/// future firings.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    /// Cancels the scheduled action.
    ///
    /// Returns `true` if this call prevented one or more firings, i.e. the
    /// action was still scheduled to run. The entry is discarded the next
    /// time the timer thread examines it, or eagerly by
    /// [`Timer::purge`].
    pub fn cancel(&self) -> bool {
        let mut sched = self.entry.sched.lock();
        let was_scheduled = sched.state == SCHEDULED;
        sched.state = CANCELLED;
        was_scheduled
    }

    /// Whether the action has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.entry.sched.lock().state == CANCELLED
    }
}

impl Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sched = self.entry.sched.lock();
        let state = match sched.state {
            VIRGIN => "virgin",
            SCHEDULED => "scheduled",
            EXECUTED => "executed",
            _ => "cancelled",
        };
        f.debug_struct("TimerHandle").field("state", &state).finish()
    }
}

struct HeapEntry {
    when: Instant,
    entry: Arc<TimerEntry>,
}

/// A one-based binary min-heap of timer entries keyed by trigger instant.
///
/// `quick_remove` breaks the heap invariant for O(1) removal; callers must
/// follow a batch of quick removals with `heapify`.
struct TaskQueue {
    entries: Vec<HeapEntry>,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    /// The entry with the earliest trigger instant. O(1).
    fn min(&self) -> &HeapEntry {
        &self.entries[0]
    }

    /// One-based access, matching the heap arithmetic.
    fn get(&self, i: usize) -> &HeapEntry {
        &self.entries[i - 1]
    }

    /// Inserts an entry. O(log n).
    fn add(&mut self, when: Instant, entry: Arc<TimerEntry>) {
        self.entries.push(HeapEntry { when, entry });
        self.fix_up(self.entries.len());
    }

    /// Removes the minimum entry. O(log n).
    fn remove_min(&mut self) -> HeapEntry {
        let last = self.entries.len();
        self.entries.swap(0, last - 1);
        let min = self.entries.pop().expect("remove_min on empty queue");
        if !self.entries.is_empty() {
            self.fix_down(1);
        }
        min
    }

    /// Re-keys the minimum entry in place. O(log n).
    fn reschedule_min(&mut self, when: Instant) {
        self.entries[0].when = when;
        self.fix_down(1);
    }

    /// Removes the i-th entry (one-based) by swapping in the last one.
    /// O(1), but leaves the heap unordered until `heapify`.
    fn quick_remove(&mut self, i: usize) {
        let last = self.entries.len();
        self.entries.swap(i - 1, last - 1);
        self.entries.pop();
    }

    /// Restores the heap invariant over the whole array. O(n).
    fn heapify(&mut self) {
        for i in (1..=self.entries.len() / 2).rev() {
            self.fix_down(i);
        }
    }

    fn fix_up(&mut self, mut k: usize) {
        while k > 1 && self.entries[k / 2 - 1].when > self.entries[k - 1].when {
            self.entries.swap(k / 2 - 1, k - 1);
            k /= 2;
        }
    }

    fn fix_down(&mut self, mut k: usize) {
        let n = self.entries.len();
        loop {
            let mut j = 2 * k;
            if j > n {
                break;
            }
            if j < n && self.entries[j - 1].when > self.entries[j].when {
                j += 1;
            }
            if self.entries[k - 1].when <= self.entries[j - 1].when {
                break;
            }
            self.entries.swap(k - 1, j - 1);
            k = j;
        }
    }
}

struct TimerState {
    queue: TaskQueue,
    status: u8,
}

struct TimerShared {
    state: Mutex<TimerState>,
    available: Condvar,
}

/// Scheduling an action on a timer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The timer was cancelled, or its thread terminated after an action
    /// panicked.
    Cancelled,
    /// A periodic schedule was given a zero period.
    InvalidPeriod,
}

impl Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Cancelled => f.write_str("timer is no longer accepting work"),
            ScheduleError::InvalidPeriod => f.write_str("period must be non-zero"),
        }
    }
}

impl Error for ScheduleError {}

/// A single-threaded facility for scheduling actions to run once or
/// repeatedly at nanosecond-precise instants.
///
/// One worker thread drives a min-heap of entries keyed by trigger instant.
/// Actions run on that thread, outside all timer locks, so a long-running
/// action delays later ones but never deadlocks against scheduling or
/// cancellation. An action that panics terminates the worker: pending
/// entries are abandoned and later schedule calls fail with
/// [`ScheduleError::Cancelled`].
///
/// Fixed-rate schedules key each firing off the previous *trigger* instant
/// (drift-free over time, with bunched catch-up runs after a stall);
/// fixed-delay schedules key off the completion of the previous run.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Creates a timer and starts its worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: TaskQueue::new(),
                status: LIVE,
            }),
            available: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("strand-timer".into())
            .spawn(move || timer_main(&worker))
            .expect("failed to spawn timer thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules `f` to run once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<TimerHandle, ScheduleError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_entry(Instant::now() + delay, 0, Box::new(f))
    }

    /// Schedules `f` to run once at `when`. An instant already in the past
    /// fires as soon as the timer thread gets to it.
    pub fn schedule_at<F>(&self, when: Instant, f: F) -> Result<TimerHandle, ScheduleError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_entry(when, 0, Box::new(f))
    }

    /// Schedules `f` to run after `first_delay` and then at fixed-rate
    /// intervals of `period`: each trigger instant is exactly `period`
    /// after the previous trigger instant.
    pub fn schedule_fixed_rate<F>(
        &self,
        first_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TimerHandle, ScheduleError>
    where
        F: FnMut() + Send + 'static,
    {
        let period = period_nanos(period)?;
        self.schedule_entry(Instant::now() + first_delay, period, Box::new(f))
    }

    /// Schedules `f` to run after `first_delay` and then repeatedly with
    /// `period` between the end of one examination and the next trigger.
    pub fn schedule_fixed_delay<F>(
        &self,
        first_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TimerHandle, ScheduleError>
    where
        F: FnMut() + Send + 'static,
    {
        let period = period_nanos(period)?;
        self.schedule_entry(Instant::now() + first_delay, -period, Box::new(f))
    }

    fn schedule_entry(
        &self,
        first: Instant,
        period: i64,
        action: Box<dyn FnMut() + Send + 'static>,
    ) -> Result<TimerHandle, ScheduleError> {
        let entry = Arc::new(TimerEntry {
            sched: Mutex::new(Sched {
                state: VIRGIN,
                next: first,
                period,
            }),
            action: Mutex::new(action),
        });

        let mut state = self.shared.state.lock();
        if state.status != LIVE {
            return Err(ScheduleError::Cancelled);
        }
        entry.sched.lock().state = SCHEDULED;
        state.queue.add(first, entry.clone());
        let is_new_min = Arc::ptr_eq(&state.queue.min().entry, &entry);
        drop(state);
        if is_new_min {
            // the worker may be waiting for a later instant
            self.shared.available.notify_one();
        }
        Ok(TimerHandle { entry })
    }

    /// Removes every cancelled entry from the queue. Returns how many were
    /// removed.
    pub fn purge(&self) -> usize {
        let mut state = self.shared.state.lock();
        let mut removed = 0;
        let mut i = 1;
        while i <= state.queue.len() {
            let cancelled = state.queue.get(i).entry.sched.lock().state == CANCELLED;
            if cancelled {
                state.queue.quick_remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        if removed > 0 {
            state.queue.heapify();
        }
        debug!("purged {removed} cancelled timer entries");
        removed
    }

    /// Stops the timer: pending entries are discarded, the worker thread
    /// exits, and later schedule calls fail.
    ///
    /// Safe to call from within a timer action (the worker is not joined
    /// here; [`Drop`] joins it).
    pub fn cancel(&self) {
        info!("timer cancelled");
        let mut state = self.shared.state.lock();
        if state.status == LIVE {
            state.status = STOPPED;
        }
        state.queue.clear();
        drop(state);
        self.shared.available.notify_all();
    }
}

fn period_nanos(period: Duration) -> Result<i64, ScheduleError> {
    if period.is_zero() {
        return Err(ScheduleError::InvalidPeriod);
    }
    Ok(i64::try_from(period.as_nanos()).unwrap_or(i64::MAX))
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.thread.lock().take() {
            // joining from the timer's own action would deadlock
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        let status = match state.status {
            LIVE => "live",
            STOPPED => "stopped",
            _ => "dead",
        };
        f.debug_struct("Timer")
            .field("status", &status)
            .field("pending", &state.queue.len())
            .finish()
    }
}

enum Decision {
    Skip,
    Run(Arc<TimerEntry>),
    Wait(Instant),
}

fn timer_main(shared: &TimerShared) {
    debug!("timer thread started");
    if panic::catch_unwind(AssertUnwindSafe(|| timer_loop(shared))).is_err() {
        // an action panicked; abandon the queue and refuse further work
        let mut state = shared.state.lock();
        state.status = DEAD;
        state.queue.clear();
        warn!("timer action panicked; timer thread terminating");
    }
    debug!("timer thread stopped");
}

fn timer_loop(shared: &TimerShared) {
    loop {
        let mut state = shared.state.lock();
        while state.queue.is_empty() && state.status == LIVE {
            shared.available.wait(&mut state);
        }
        if state.queue.is_empty() {
            // stopped and drained
            break;
        }

        let now = Instant::now();
        let decision = {
            let entry = state.queue.min().entry.clone();
            let mut sched = entry.sched.lock();
            if sched.state == CANCELLED {
                state.queue.remove_min();
                Decision::Skip
            } else if sched.next <= now {
                if sched.period == 0 {
                    state.queue.remove_min();
                    sched.state = EXECUTED;
                } else {
                    let next = if sched.period < 0 {
                        now + Duration::from_nanos(sched.period.unsigned_abs())
                    } else {
                        sched.next.saturating_add_nanos(sched.period)
                    };
                    sched.next = next;
                    state.queue.reschedule_min(next);
                }
                drop(sched);
                Decision::Run(entry)
            } else {
                Decision::Wait(sched.next)
            }
        };

        match decision {
            Decision::Skip => {}
            Decision::Wait(next) => {
                let timeout = next.saturating_duration_since(now);
                let _ = shared.available.wait_for(&mut state, timeout);
            }
            Decision::Run(entry) => {
                drop(state);
                // run outside all timer locks
                let mut action = entry.action.lock();
                (action)();
            }
        }
    }
}
