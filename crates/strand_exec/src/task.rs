use std::any::Any;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use strand_sync::time::Instant;

use crate::pool;

const FRESH: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// How long a joining worker parks when it runs out of work to help with.
const HELP_PARK: Duration = Duration::from_micros(500);

/// A unit of work as seen by the worker deques.
pub(crate) trait Job: Send + Sync {
    /// Executes the job if it has not been claimed yet.
    fn run(&self);
    /// Marks an unexecuted job as cancelled during a forced shutdown.
    fn abandon(&self);
}

pub(crate) type JobRef = Arc<dyn Job>;

enum Outcome<T> {
    Value(T),
    Panic(Box<dyn Any + Send + 'static>),
}

struct Completion<T> {
    func: Option<Box<dyn FnOnce() -> T + Send + 'static>>,
    outcome: Option<Outcome<T>>,
}

pub(crate) struct TaskCore<T> {
    state: AtomicU8,
    monitor: Mutex<Completion<T>>,
    done: Condvar,
}

impl<T: Send> TaskCore<T> {
    /// Claims and runs the task body. At most one claim ever succeeds, so a
    /// task both queued and invoked directly still executes exactly once.
    fn execute(&self) {
        if self
            .state
            .compare_exchange(FRESH, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let func = self
            .monitor
            .lock()
            .func
            .take()
            .expect("claimed task without a body");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(value) => Outcome::Value(value),
            Err(payload) => Outcome::Panic(payload),
        };
        let mut completion = self.monitor.lock();
        completion.outcome = Some(outcome);
        self.state.store(DONE, Ordering::Release);
        self.done.notify_all();
    }

    fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) >= DONE
    }

    fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(FRESH, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut completion = self.monitor.lock();
            completion.func = None;
            self.done.notify_all();
            true
        } else {
            false
        }
    }
}

impl<T: Send> Job for TaskCore<T> {
    fn run(&self) {
        self.execute();
    }

    fn abandon(&self) {
        self.cancel();
    }
}

/// A forkable unit of divide-and-conquer work producing a `T`.
///
/// A task is created detached, then either pushed onto the current worker's
/// deque with [`fork`](Self::fork), executed in place with
/// [`invoke`](Self::invoke), or submitted from outside the pool via
/// [`Pool::spawn`](crate::Pool::spawn). Joining a task from a worker thread
/// *helps*: the worker keeps executing queued tasks (its own or stolen)
/// until the joined task settles, so recursive joins do not idle the pool.
///
/// Every task runs at most once; [`cancel`](Self::cancel) prevents a task
/// that has not started from ever running, which joiners observe as
/// [`JoinError::Cancelled`].
pub struct Task<T> {
    core: Arc<TaskCore<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Creates a detached task from `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            core: Arc::new(TaskCore {
                state: AtomicU8::new(FRESH),
                monitor: Mutex::new(Completion {
                    func: Some(Box::new(f)),
                    outcome: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn as_job(&self) -> JobRef {
        self.core.clone()
    }

    /// Pushes this task onto the current worker's deque.
    ///
    /// Fails if the calling thread is not a pool worker.
    pub fn fork(&self) -> Result<(), NotWorkerError> {
        let job = self.as_job();
        if pool::push_local(job) {
            Ok(())
        } else {
            Err(NotWorkerError)
        }
    }

    /// Runs this task in the calling thread and returns its result.
    ///
    /// If the task was already claimed elsewhere, waits for that execution
    /// instead.
    pub fn invoke(self) -> Result<T, JoinError> {
        self.core.execute();
        self.join()
    }

    /// Waits until this task settles and returns its result.
    ///
    /// On a worker thread this helps: the worker executes other queued
    /// tasks (preferring its own deque, then stealing) while it waits.
    pub fn join(self) -> Result<T, JoinError> {
        if pool::on_worker() {
            while !self.core.is_settled() {
                if !pool::run_one_job() {
                    let mut completion = self.core.monitor.lock();
                    if !self.core.is_settled() {
                        let _ = self.core.done.wait_for(&mut completion, HELP_PARK);
                    }
                }
            }
        } else {
            let mut completion = self.core.monitor.lock();
            while !self.core.is_settled() {
                self.core.done.wait(&mut completion);
            }
        }
        self.finish()
    }

    /// Waits at most `timeout` for this task to settle.
    ///
    /// The bounded wait only parks, it does not help; on timeout the task
    /// is handed back unconsumed.
    pub fn join_for(self, timeout: Duration) -> Result<T, JoinTimeoutError<T>> {
        let deadline = Instant::now() + timeout;
        {
            let mut completion = self.core.monitor.lock();
            while !self.core.is_settled() {
                let now = Instant::now();
                if now >= deadline {
                    drop(completion);
                    return Err(JoinTimeoutError::TimedOut(self));
                }
                let _ = self
                    .core
                    .done
                    .wait_for(&mut completion, deadline.saturating_duration_since(now));
            }
        }
        match self.finish() {
            Ok(value) => Ok(value),
            Err(JoinError::Cancelled) => Err(JoinTimeoutError::Cancelled),
            Err(JoinError::Panicked(payload)) => Err(JoinTimeoutError::Panicked(payload)),
        }
    }

    /// Attempts to remove this task from the current worker's deque.
    ///
    /// Succeeds only if the task is on top of the deque, i.e. it was the
    /// most recent fork of this worker and nobody stole it. A task removed
    /// this way has not run and can still be invoked or cancelled.
    pub fn try_unfork(&self) -> bool {
        pool::try_unfork_local(Arc::as_ptr(&self.core).cast())
    }

    /// Prevents a task that has not started from ever running.
    ///
    /// Returns whether the task moved to the cancelled state. Joiners of a
    /// cancelled task observe [`JoinError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Whether the task has settled (completed, panicked or cancelled).
    pub fn is_settled(&self) -> bool {
        self.core.is_settled()
    }

    /// Whether the task was cancelled before it ran.
    pub fn is_cancelled(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == CANCELLED
    }

    fn finish(self) -> Result<T, JoinError> {
        match self.core.state.load(Ordering::Acquire) {
            CANCELLED => Err(JoinError::Cancelled),
            DONE => {
                let outcome = self
                    .core
                    .monitor
                    .lock()
                    .outcome
                    .take()
                    .expect("settled task lost its outcome");
                match outcome {
                    Outcome::Value(value) => Ok(value),
                    Outcome::Panic(payload) => Err(JoinError::Panicked(payload)),
                }
            }
            _ => unreachable!("task finished while unsettled"),
        }
    }
}

impl<T> Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.core.state.load(Ordering::Acquire) {
            FRESH => "fresh",
            RUNNING => "running",
            DONE => "done",
            _ => "cancelled",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

/// Forks `right`, invokes `left` in the caller, then joins `right`.
///
/// If either task fails, the other is cancelled (best effort) and one of
/// the failures is surfaced. Called outside a pool worker, both tasks are
/// invoked sequentially in the caller.
pub fn co_invoke<A, B>(left: Task<A>, right: Task<B>) -> Result<(A, B), JoinError>
where
    A: Send + 'static,
    B: Send + 'static,
{
    if right.fork().is_err() {
        // not on a worker: run both here
        let a = match left.invoke() {
            Ok(value) => value,
            Err(e) => {
                right.cancel();
                return Err(e);
            }
        };
        let b = right.invoke()?;
        return Ok((a, b));
    }
    let a = match left.invoke() {
        Ok(value) => value,
        Err(e) => {
            right.cancel();
            return Err(e);
        }
    };
    let b = right.join()?;
    Ok((a, b))
}

/// A fork or worker-local operation was attempted off a pool worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotWorkerError;

impl Display for NotWorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("calling thread is not a pool worker")
    }
}

impl Error for NotWorkerError {}

/// A join observed a task that did not produce a value.
pub enum JoinError {
    /// The task was cancelled before it ran.
    Cancelled,
    /// The task body panicked; the payload is captured once and surfaced to
    /// every joiner that observes it.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("Cancelled"),
            JoinError::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

impl Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("task was cancelled"),
            JoinError::Panicked(_) => f.write_str("task panicked"),
        }
    }
}

impl Error for JoinError {}

/// A bounded join ended without a value.
pub enum JoinTimeoutError<T> {
    /// The wait bound elapsed; the task is handed back.
    TimedOut(Task<T>),
    /// The task was cancelled before it ran.
    Cancelled,
    /// The task body panicked.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<T> Debug for JoinTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinTimeoutError::TimedOut(_) => f.write_str("TimedOut(..)"),
            JoinTimeoutError::Cancelled => f.write_str("Cancelled"),
            JoinTimeoutError::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

impl<T> Display for JoinTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinTimeoutError::TimedOut(_) => f.write_str("bounded join timed out"),
            JoinTimeoutError::Cancelled => f.write_str("task was cancelled"),
            JoinTimeoutError::Panicked(_) => f.write_str("task panicked"),
        }
    }
}

impl<T> Error for JoinTimeoutError<T> {}
