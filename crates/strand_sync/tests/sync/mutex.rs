use std::cell::Cell;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use strand_sync::error::TimedLockError;
use strand_sync::sync::ReentrantMutex;
use strand_sync::thread;

#[test]
fn smoke() {
    let m = ReentrantMutex::new(());
    drop(m.lock());
    drop(m.lock());
}

#[test]
fn try_lock() {
    let m = ReentrantMutex::new(Cell::new(0));
    m.try_lock().unwrap().set(5);
    assert_eq!(m.lock().get(), 5);
}

#[test]
fn reentrant_to_depth_k() {
    let m = Arc::new(ReentrantMutex::new(()));
    let g1 = m.lock();
    let g2 = m.lock();
    let g3 = m.lock();
    assert_eq!(m.hold_count(), 3);

    // K-1 unlocks leave the mutex held
    drop(g1);
    drop(g2);
    assert_eq!(m.hold_count(), 1);
    {
        let m = Arc::clone(&m);
        let other = std::thread::spawn(move || m.try_lock().is_none());
        assert!(other.join().unwrap());
    }

    // the K-th unlock releases
    drop(g3);
    let m2 = Arc::clone(&m);
    let other = std::thread::spawn(move || m2.try_lock().is_some());
    assert!(other.join().unwrap());
}

#[test]
fn contended_counter() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1_000;
    let m = Arc::new(ReentrantMutex::new(Cell::new(0usize)));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let guard = m.lock();
                    guard.set(guard.get() + 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(m.lock().get(), THREADS * PER_THREAD);
}

#[test]
fn fair_mutex_grants_in_arrival_order() {
    let m = Arc::new(ReentrantMutex::new_fair(()));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let held = m.lock();
    let mut handles = Vec::new();
    for id in 1..=3 {
        let m = Arc::clone(&m);
        let order = Arc::clone(&order);
        handles.push(std::thread::spawn(move || {
            let _guard = m.lock();
            order.lock().unwrap().push(id);
        }));
        // give each waiter time to enqueue before the next arrives
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(held);
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn interruptible_lock_fails_when_interrupted() {
    let m = Arc::new(ReentrantMutex::new(()));
    let held = m.lock();

    let (tx, rx) = channel();
    let waiter = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || {
            tx.send(thread::current()).unwrap();
            m.lock_interruptibly().map(|_| ())
        })
    };
    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    handle.interrupt();

    assert!(waiter.join().unwrap().is_err());
    // the waiter left the lock untouched
    drop(held);
    assert!(m.try_lock().is_some());
}

#[test]
fn interrupt_pending_on_entry_fails_immediately() {
    let m = ReentrantMutex::new(());
    thread::current().interrupt();
    assert!(m.lock_interruptibly().is_err());
    // the flag was consumed and the mutex is free
    assert!(!thread::interrupted());
    assert!(m.try_lock().is_some());
}

#[test]
fn plain_lock_defers_interruption() {
    let m = Arc::new(ReentrantMutex::new(()));
    let held = m.lock();

    let (tx, rx) = channel();
    let waiter = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || {
            tx.send(thread::current()).unwrap();
            let _guard = m.lock();
            // the interrupt did not abort the acquisition; the flag is
            // still pending
            thread::interrupted()
        })
    };
    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    handle.interrupt();
    std::thread::sleep(Duration::from_millis(50));
    drop(held);

    assert!(waiter.join().unwrap());
}

#[test]
fn timed_lock_times_out() {
    let m = Arc::new(ReentrantMutex::new(()));
    let _held = m.lock();

    let m2 = Arc::clone(&m);
    let waiter = std::thread::spawn(move || {
        m2.try_lock_for(Duration::from_millis(50)).map(|_| ())
    });
    assert_eq!(waiter.join().unwrap(), Err(TimedLockError::TimedOut));
}

#[test]
fn zero_duration_never_parks() {
    let m = Arc::new(ReentrantMutex::new(()));
    let _held = m.lock();

    let m2 = Arc::clone(&m);
    let waiter = std::thread::spawn(move || {
        let start = std::time::Instant::now();
        let result = m2.try_lock_for(Duration::ZERO).map(|_| ());
        (result, start.elapsed())
    });
    let (result, elapsed) = waiter.join().unwrap();
    assert_eq!(result, Err(TimedLockError::TimedOut));
    assert!(elapsed < Duration::from_millis(500));
}

#[test]
fn timed_lock_succeeds_when_released() {
    let m = Arc::new(ReentrantMutex::new(()));
    let held = m.lock();

    let m2 = Arc::clone(&m);
    let waiter =
        std::thread::spawn(move || m2.try_lock_for(Duration::from_secs(10)).map(|_| ()).is_ok());
    std::thread::sleep(Duration::from_millis(50));
    drop(held);
    assert!(waiter.join().unwrap());
}

#[test]
fn force_unlock_releases() {
    let m = Arc::new(ReentrantMutex::new(()));
    std::mem::forget(m.lock());
    assert!(m.held_by_current());
    // SAFETY: the guard above was leaked, not dropped.
    unsafe { m.force_unlock() };
    assert!(!m.held_by_current());
}
