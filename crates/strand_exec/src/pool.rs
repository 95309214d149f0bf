use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strand_sync::sync::Backoff;

use crate::task::{JobRef, JoinError, Task};

/// Backstop for the idle sleep: sleepers re-examine the queues at least
/// this often, so an approximate queue-size race can only delay work by one
/// period.
const IDLE_PARK: Duration = Duration::from_millis(10);

struct Shared {
    injector: Injector<JobRef>,
    stealers: Vec<Stealer<JobRef>>,
    // approximate per-worker queue depths, for the surplus heuristic and
    // the idle re-check; may transiently go negative
    queue_sizes: Vec<AtomicIsize>,
    parallelism: usize,
    steal_count: AtomicUsize,
    // queued jobs not yet executed or abandoned; exact, drives drain-exit
    outstanding: AtomicUsize,
    accepting: AtomicBool,
    running: AtomicBool,
    sleepers: AtomicUsize,
    idle_lock: Mutex<()>,
    work_available: Condvar,
}

impl Shared {
    fn has_visible_work(&self) -> bool {
        !self.injector.is_empty()
            || self
                .queue_sizes
                .iter()
                .any(|size| size.load(Ordering::Relaxed) > 0)
    }

    fn note_removed(&self, index: usize) {
        self.queue_sizes[index].fetch_sub(1, Ordering::Relaxed);
    }

    fn wake_workers(&self) {
        if self.sleepers.load(Ordering::Acquire) != 0 {
            let _idle = self.idle_lock.lock();
            self.work_available.notify_all();
        }
    }

    fn wake_all(&self) {
        let _idle = self.idle_lock.lock();
        self.work_available.notify_all();
    }

    /// A queued job was executed, abandoned or unforked.
    fn job_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.accepting.load(Ordering::Acquire)
        {
            // last job of a draining pool: let idle workers exit
            self.wake_all();
        }
    }
}

struct WorkerCtx {
    index: usize,
    local: Worker<JobRef>,
    shared: Arc<Shared>,
    rng: RefCell<SmallRng>,
}

thread_local! {
    static WORKER: Cell<Option<&'static WorkerCtx>> = Cell::new(None);
}

impl WorkerCtx {
    /// Fetches one job: own deque first, then the global queue, then a
    /// randomized rotation over the other workers' deques, retrying while
    /// any victim reports a racy steal.
    fn find_job(&self) -> Option<JobRef> {
        if let Some(job) = self.local.pop() {
            self.shared.note_removed(self.index);
            return Some(job);
        }

        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        let victims = self.shared.stealers.len();
        if victims <= 1 {
            return None;
        }
        let start = self.rng.borrow_mut().gen_range(0..victims);
        loop {
            let mut retry = false;
            for offset in 0..victims {
                let victim = (start + offset) % victims;
                if victim == self.index {
                    continue;
                }
                match self.shared.stealers[victim].steal() {
                    Steal::Success(job) => {
                        self.shared.steal_count.fetch_add(1, Ordering::Relaxed);
                        self.shared.note_removed(victim);
                        return Some(job);
                    }
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }
            if !retry {
                return None;
            }
        }
    }

    fn run_job(&self, job: JobRef) {
        job.run();
        self.shared.job_finished();
    }

    fn push_job(&self, job: JobRef) {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.local.push(job);
        self.shared.queue_sizes[self.index].fetch_add(1, Ordering::Relaxed);
        self.shared.wake_workers();
    }
}

fn worker_main(index: usize, local: Worker<JobRef>, shared: Arc<Shared>) {
    debug!("worker {index} started");
    let ctx_ptr = Box::into_raw(Box::new(WorkerCtx {
        index,
        local,
        shared,
        rng: RefCell::new(SmallRng::from_entropy()),
    }));
    // SAFETY: freed at the end of this function, after the published
    // reference has been cleared.
    let ctx: &'static WorkerCtx = unsafe { &*ctx_ptr };
    WORKER.with(|w| w.set(Some(ctx)));

    let mut backoff = Backoff::new();
    while ctx.shared.running.load(Ordering::Acquire) {
        match ctx.find_job() {
            Some(job) => {
                backoff.reset();
                ctx.run_job(job);
            }
            None => {
                let shared = &ctx.shared;
                if !shared.accepting.load(Ordering::Acquire)
                    && shared.outstanding.load(Ordering::Acquire) == 0
                {
                    break;
                }
                if backoff.pause() {
                    continue;
                }
                trace!("worker {} going to sleep", ctx.index);
                let mut idle = shared.idle_lock.lock();
                shared.sleepers.fetch_add(1, Ordering::AcqRel);
                // re-check under the lock so a submit cannot slip between
                // the failed search and the sleep
                if !shared.has_visible_work() && shared.running.load(Ordering::Acquire) {
                    let _ = shared.work_available.wait_for(&mut idle, IDLE_PARK);
                }
                shared.sleepers.fetch_sub(1, Ordering::AcqRel);
                drop(idle);
                backoff.reset();
            }
        }
    }

    // a forced shutdown may leave queued jobs behind; settle them as
    // cancelled so joiners are not stranded
    while let Some(job) = ctx.local.pop() {
        ctx.shared.note_removed(ctx.index);
        job.abandon();
        ctx.shared.job_finished();
    }

    WORKER.with(|w| w.set(None));
    debug!("worker {index} stopped");
    // SAFETY: the published reference was cleared above and never escaped
    // this thread.
    drop(unsafe { Box::from_raw(ctx_ptr) });
}

/// Whether the calling thread is a pool worker.
pub(crate) fn on_worker() -> bool {
    WORKER.with(|w| w.get().is_some())
}

/// Pushes a job onto the current worker's deque. Returns `false` (dropping
/// nothing; the caller keeps its handle) off a worker thread.
pub(crate) fn push_local(job: JobRef) -> bool {
    WORKER.with(|w| match w.get() {
        Some(ctx) => {
            ctx.push_job(job);
            true
        }
        None => false,
    })
}

/// Finds and runs one job on the current worker. Returns whether any work
/// was found.
pub(crate) fn run_one_job() -> bool {
    WORKER.with(|w| match w.get() {
        Some(ctx) => match ctx.find_job() {
            Some(job) => {
                ctx.run_job(job);
                true
            }
            None => false,
        },
        None => false,
    })
}

/// Pops the current worker's deque if its top is the job identified by
/// `target`; pushes back anything else.
pub(crate) fn try_unfork_local(target: *const ()) -> bool {
    WORKER.with(|w| {
        let Some(ctx) = w.get() else {
            return false;
        };
        match ctx.local.pop() {
            None => false,
            Some(job) => {
                if Arc::as_ptr(&job).cast::<()>() == target {
                    ctx.shared.note_removed(ctx.index);
                    ctx.shared.job_finished();
                    true
                } else {
                    ctx.local.push(job);
                    false
                }
            }
        }
    })
}

/// An estimate of how many more tasks the current worker has queued than
/// the average worker, or `None` off a worker thread.
///
/// Divide-and-conquer code uses this to stop subdividing once the local
/// queue is comfortably ahead of its peers.
pub fn surplus_task_count() -> Option<isize> {
    WORKER.with(|w| {
        w.get().map(|ctx| {
            let shared = &ctx.shared;
            let own = shared.queue_sizes[ctx.index]
                .load(Ordering::Relaxed)
                .max(0);
            let total: isize = shared
                .queue_sizes
                .iter()
                .map(|size| size.load(Ordering::Relaxed).max(0))
                .sum();
            own - total / shared.parallelism as isize
        })
    })
}

/// A work-stealing pool for divide-and-conquer tasks.
///
/// Each worker owns a deque: it pushes forks and pops from the top, and
/// idle workers steal from the bottom of randomly chosen victims. External
/// submissions go through a shared injector queue.
///
/// [`shutdown`](Self::shutdown) drains queued work before the workers stop;
/// [`shutdown_now`](Self::shutdown_now) abandons queued tasks as cancelled.
/// Dropping the pool performs a graceful shutdown.
pub struct Pool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Creates a pool with one worker per available CPU.
    pub fn new() -> Self {
        Self::with_parallelism(num_cpus::get())
    }

    /// Creates a pool with `parallelism` workers (at least one).
    pub fn with_parallelism(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        info!("starting pool with {parallelism} workers");

        let locals: Vec<Worker<JobRef>> = (0..parallelism).map(|_| Worker::new_lifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            queue_sizes: (0..parallelism).map(|_| AtomicIsize::new(0)).collect(),
            parallelism,
            steal_count: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(true),
            sleepers: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            work_available: Condvar::new(),
        });

        let threads = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("strand-worker-{index}"))
                    .spawn(move || worker_main(index, local, shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// The number of worker threads.
    pub fn parallelism(&self) -> usize {
        self.shared.parallelism
    }

    /// The number of successful steals across all workers, for diagnostics.
    pub fn steal_count(&self) -> usize {
        self.shared.steal_count.load(Ordering::Relaxed)
    }

    /// Submits `f` for execution and returns its task handle.
    ///
    /// A pool that has been shut down cancels the task instead of queueing
    /// it; joining then observes
    /// [`JoinError::Cancelled`](crate::JoinError::Cancelled).
    pub fn spawn<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = Task::new(f);
        if !self.shared.accepting.load(Ordering::Acquire) {
            task.cancel();
            return task;
        }
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(task.as_job());
        self.shared.wake_workers();
        trace!("external task submitted");
        task
    }

    /// Submits `f` and waits for its result.
    pub fn invoke<T, F>(&self, f: F) -> Result<T, JoinError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn(f).join()
    }

    /// Stops accepting work, lets the queues drain, and joins the workers.
    pub fn shutdown(&self) {
        info!("pool shutdown requested");
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.wake_all();
        self.join_threads();
    }

    /// Stops the workers without draining; queued tasks settle as
    /// cancelled.
    pub fn shutdown_now(&self) {
        info!("pool forced shutdown");
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        loop {
            match self.shared.injector.steal() {
                Steal::Success(job) => {
                    job.abandon();
                    self.shared.job_finished();
                }
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        self.shared.wake_all();
        self.join_threads();
    }

    fn join_threads(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("parallelism", &self.shared.parallelism)
            .field("steals", &self.steal_count())
            .finish()
    }
}
