use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_exec::{co_invoke, surplus_task_count, JoinError, JoinTimeoutError, Pool, Task};

use crate::init_logging;

static FIB_CREATED: AtomicUsize = AtomicUsize::new(0);
static FIB_EXECUTED: AtomicUsize = AtomicUsize::new(0);

fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    FIB_CREATED.fetch_add(2, Ordering::SeqCst);
    let left = Task::new(move || {
        FIB_EXECUTED.fetch_add(1, Ordering::SeqCst);
        fib(n - 1)
    });
    let right = Task::new(move || {
        FIB_EXECUTED.fetch_add(1, Ordering::SeqCst);
        fib(n - 2)
    });
    let (a, b) = co_invoke(left, right).unwrap();
    a + b
}

#[test]
fn fork_join_fibonacci() {
    init_logging();
    let pool = Pool::with_parallelism(4);

    assert_eq!(pool.invoke(|| fib(20)).unwrap(), 6765);

    // every created task ran exactly once
    assert_eq!(
        FIB_EXECUTED.load(Ordering::SeqCst),
        FIB_CREATED.load(Ordering::SeqCst)
    );
    // idle workers found work to steal
    assert!(pool.steal_count() > 0);
}

#[test]
fn invoke_returns_the_result() {
    init_logging();
    let pool = Pool::with_parallelism(2);
    assert_eq!(pool.invoke(|| 21 * 2).unwrap(), 42);
}

#[test]
fn panic_is_captured_and_rethrown() {
    init_logging();
    let pool = Pool::with_parallelism(2);
    match pool.invoke(|| -> i32 { panic!("boom") }) {
        Err(JoinError::Panicked(payload)) => {
            assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        }
        other => panic!("expected a panic, got {other:?}"),
    }
    // the pool survives a panicking task
    assert_eq!(pool.invoke(|| 1).unwrap(), 1);
}

#[test]
fn cancelled_task_never_runs() {
    init_logging();
    let ran = Arc::new(AtomicUsize::new(0));
    let task = {
        let ran = Arc::clone(&ran);
        Task::new(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(task.cancel());
    assert!(task.is_cancelled());
    assert!(matches!(task.invoke(), Err(JoinError::Cancelled)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn fork_requires_a_worker_thread() {
    init_logging();
    let task = Task::new(|| 1);
    assert!(task.fork().is_err());
    // the task is untouched and still runnable
    assert_eq!(task.invoke().unwrap(), 1);
}

#[test]
fn fork_and_unfork_on_a_worker() {
    init_logging();
    let pool = Pool::with_parallelism(1);
    let result = pool
        .invoke(|| {
            let task = Task::new(|| 5);
            task.fork().unwrap();
            // the most recent fork is on top of our own deque
            let unforked = task.try_unfork();
            (unforked, task.invoke().unwrap())
        })
        .unwrap();
    assert_eq!(result, (true, 5));
}

#[test]
fn surplus_is_none_off_worker() {
    init_logging();
    assert_eq!(surplus_task_count(), None);

    let pool = Pool::with_parallelism(1);
    let surplus = pool
        .invoke(|| {
            let t1 = Task::new(|| ());
            let t2 = Task::new(|| ());
            t1.fork().unwrap();
            t2.fork().unwrap();
            let surplus = surplus_task_count();
            t1.try_unfork();
            t2.try_unfork();
            surplus
        })
        .unwrap();
    // with a single worker the surplus over the average is zero
    assert_eq!(surplus, Some(0));
}

#[test]
fn join_timeout_hands_the_task_back() {
    init_logging();
    let pool = Pool::with_parallelism(1);
    let task = pool.spawn(|| {
        std::thread::sleep(Duration::from_millis(300));
        7
    });
    match task.join_for(Duration::from_millis(10)) {
        Err(JoinTimeoutError::TimedOut(task)) => {
            assert_eq!(task.join().unwrap(), 7);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn graceful_shutdown_drains_queued_work() {
    init_logging();
    const TASKS: usize = 100;
    let pool = Pool::with_parallelism(2);
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..TASKS {
        let done = Arc::clone(&done);
        drop(pool.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    pool.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), TASKS);
}

#[test]
fn spawn_after_shutdown_is_cancelled() {
    init_logging();
    let pool = Pool::with_parallelism(1);
    pool.shutdown();
    let task = pool.spawn(|| 1);
    assert!(matches!(task.join(), Err(JoinError::Cancelled)));
}

#[test]
fn forced_shutdown_cancels_queued_tasks() {
    init_logging();
    let pool = Pool::with_parallelism(1);

    // occupy the only worker so later submissions stay queued
    let blocker = pool.spawn(|| std::thread::sleep(Duration::from_millis(200)));
    std::thread::sleep(Duration::from_millis(50));
    let queued = pool.spawn(|| 1);

    pool.shutdown_now();
    blocker.join().unwrap();
    assert!(matches!(queued.join(), Err(JoinError::Cancelled)));
}

#[test]
fn co_invoke_works_off_worker() {
    init_logging();
    let (a, b) = co_invoke(Task::new(|| 2), Task::new(|| 3)).unwrap();
    assert_eq!((a, b), (2, 3));
}

#[test]
fn co_invoke_cancels_the_sibling_on_failure() {
    init_logging();
    let pool = Pool::with_parallelism(1);
    let sibling_ran = Arc::new(AtomicUsize::new(0));

    let result = {
        let sibling_ran = Arc::clone(&sibling_ran);
        pool.invoke(move || {
            let left = Task::new(|| -> i32 { panic!("left failed") });
            let right = Task::new(move || {
                sibling_ran.fetch_add(1, Ordering::SeqCst);
                1
            });
            co_invoke(left, right)
        })
    };
    assert!(matches!(result, Ok(Err(JoinError::Panicked(_)))));
}
