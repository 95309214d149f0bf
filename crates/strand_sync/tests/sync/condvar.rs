use std::cell::Cell;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use strand_sync::sync::{Condvar, ReentrantMutex};
use strand_sync::thread;

#[test]
fn notify_one_wakes_a_waiter() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            let mut guard = m.lock();
            while !guard.get() {
                c.wait(&mut guard).unwrap();
            }
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    m.lock().set(true);
    c.notify_one();
    waiter.join().unwrap();
}

#[test]
fn wait_restores_recursion_depth() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            let _outer = m.lock();
            let mut inner = m.lock();
            assert_eq!(m.hold_count(), 2);
            while !inner.get() {
                c.wait(&mut inner).unwrap();
            }
            // the full recursion count is back after the wait
            assert_eq!(m.hold_count(), 2);
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    {
        // the wait released every recursion level, so this lock succeeds
        let guard = m.lock();
        guard.set(true);
    }
    c.notify_one();
    waiter.join().unwrap();
}

#[test]
fn notify_all_wakes_everyone() {
    const WAITERS: usize = 5;
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let (m, c) = (Arc::clone(&m), Arc::clone(&c));
            std::thread::spawn(move || {
                let mut guard = m.lock();
                while !guard.get() {
                    c.wait(&mut guard).unwrap();
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    m.lock().set(true);
    assert_eq!(c.notify_all(), WAITERS);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn notify_without_waiters_is_a_no_op() {
    let c = Condvar::new();
    assert!(!c.notify_one());
    assert_eq!(c.notify_all(), 0);
}

#[test]
fn wait_for_times_out() {
    let m = ReentrantMutex::new(());
    let c = Condvar::new();

    let mut guard = m.lock();
    let result = c.wait_for(&mut guard, Duration::from_millis(50)).unwrap();
    assert!(result.timed_out());
    assert!(result.remaining_nanos() <= 0);
    // the mutex is re-held after the timeout
    assert!(m.held_by_current());
}

#[test]
fn wait_for_reports_remaining_time_when_signalled() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            let mut guard = m.lock();
            let mut result = None;
            while !guard.get() {
                result = Some(c.wait_for(&mut guard, Duration::from_secs(60)).unwrap());
            }
            result.unwrap()
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    m.lock().set(true);
    c.notify_one();
    let result = waiter.join().unwrap();
    assert!(!result.timed_out());
    assert!(result.remaining_nanos() > 0);
}

#[test]
fn interrupted_wait_reacquires_then_fails() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let (tx, rx) = channel();
    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            tx.send(thread::current()).unwrap();
            let mut guard = m.lock();
            let result = c.wait(&mut guard);
            // the guard is still usable: the mutex was re-acquired
            let _ = guard.get();
            (result, m.held_by_current())
        })
    };

    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    handle.interrupt();
    let (result, held) = waiter.join().unwrap();
    assert!(result.is_err());
    assert!(held);
}

#[test]
fn uninterruptible_wait_defers_the_flag() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(false)));
    let c = Arc::new(Condvar::new());

    let (tx, rx) = channel();
    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            tx.send(thread::current()).unwrap();
            let mut guard = m.lock();
            while !guard.get() {
                c.wait_uninterruptibly(&mut guard);
            }
            // the interrupt was observed but deferred
            thread::interrupted()
        })
    };

    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    handle.interrupt();
    std::thread::sleep(Duration::from_millis(100));
    m.lock().set(true);
    c.notify_all();
    assert!(waiter.join().unwrap());
}

#[test]
fn wait_while_rechecks_the_predicate() {
    let m = Arc::new(ReentrantMutex::new(Cell::new(0)));
    let c = Arc::new(Condvar::new());

    let waiter = {
        let (m, c) = (Arc::clone(&m), Arc::clone(&c));
        std::thread::spawn(move || {
            let mut guard = m.lock();
            c.wait_while(&mut guard, |v| v.get() < 3).unwrap();
            guard.get()
        })
    };

    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(30));
        let guard = m.lock();
        guard.set(guard.get() + 1);
        c.notify_one();
    }
    assert_eq!(waiter.join().unwrap(), 3);
}

#[test]
#[should_panic(expected = "differing mutexes")]
fn waiting_with_a_second_mutex_panics() {
    let m1 = ReentrantMutex::new(());
    let m2 = ReentrantMutex::new(());
    let c = Condvar::new();

    let mut g1 = m1.lock();
    let _ = c.wait_for(&mut g1, Duration::from_millis(10));
    drop(g1);

    let mut g2 = m2.lock();
    let _ = c.wait(&mut g2);
}
