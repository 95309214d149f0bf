use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_exec::{ScheduleError, Timer};
use strand_sync::time::Instant;

use crate::init_logging;

fn await_count(counter: &AtomicUsize, at_least: usize, within: Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while std::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= at_least {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    counter.load(Ordering::SeqCst) >= at_least
}

#[test]
fn one_shot_fires_once() {
    init_logging();
    let timer = Timer::new();
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = Arc::clone(&fired);
        timer
            .schedule(Duration::from_millis(20), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(await_count(&fired, 1, Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn no_task_fires_early() {
    init_logging();
    let timer = Timer::new();
    let fired_at = Arc::new(Mutex::new(None));
    let trigger = Instant::now() + Duration::from_millis(100);

    {
        let fired_at = Arc::clone(&fired_at);
        timer
            .schedule_at(trigger, move || {
                *fired_at.lock().unwrap() = Some(Instant::now());
            })
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(500));
    let fired_at = fired_at.lock().unwrap().expect("task never fired");
    assert!(fired_at >= trigger);
}

#[test]
fn tasks_fire_in_trigger_order() {
    init_logging();
    let timer = Timer::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();

    // schedule out of order
    for (label, delay_ms) in [(3, 150), (1, 50), (2, 100)] {
        let order = Arc::clone(&order);
        timer
            .schedule_at(base + Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(label);
            })
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn fixed_rate_keeps_firing() {
    init_logging();
    let timer = Timer::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let handle = {
        let fired = Arc::clone(&fired);
        timer
            .schedule_fixed_rate(Duration::from_millis(10), Duration::from_millis(50), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    assert!(await_count(&fired, 4, Duration::from_secs(5)));
    handle.cancel();
    std::thread::sleep(Duration::from_millis(150));
    let settled = fired.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(150));
    // cancelled: the count no longer moves
    assert_eq!(fired.load(Ordering::SeqCst), settled);
}

#[test]
fn fixed_delay_keeps_firing() {
    init_logging();
    let timer = Timer::new();
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = Arc::clone(&fired);
        timer
            .schedule_fixed_delay(
                Duration::from_millis(10),
                Duration::from_millis(30),
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }

    assert!(await_count(&fired, 3, Duration::from_secs(5)));
}

#[test]
fn cancel_before_firing_prevents_execution() {
    init_logging();
    let timer = Timer::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let handle = {
        let fired = Arc::clone(&fired);
        timer
            .schedule(Duration::from_millis(200), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    assert!(handle.cancel());
    // a second cancel prevented nothing
    assert!(!handle.cancel());
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn purge_removes_cancelled_entries() {
    init_logging();
    let timer = Timer::new();
    let far = Duration::from_secs(3600);

    let h1 = timer.schedule(far, || {}).unwrap();
    let _h2 = timer.schedule(far, || {}).unwrap();
    let h3 = timer.schedule(far, || {}).unwrap();

    h1.cancel();
    h3.cancel();
    assert_eq!(timer.purge(), 2);
    assert_eq!(timer.purge(), 0);
}

#[test]
fn schedule_after_cancel_fails() {
    init_logging();
    let timer = Timer::new();
    timer.cancel();
    assert_eq!(
        timer.schedule(Duration::from_millis(1), || {}).unwrap_err(),
        ScheduleError::Cancelled
    );
}

#[test]
fn zero_period_is_rejected() {
    init_logging();
    let timer = Timer::new();
    assert_eq!(
        timer
            .schedule_fixed_rate(Duration::ZERO, Duration::ZERO, || {})
            .unwrap_err(),
        ScheduleError::InvalidPeriod
    );
}

#[test]
fn panicking_action_kills_the_timer() {
    init_logging();
    let timer = Timer::new();
    timer
        .schedule(Duration::from_millis(10), || panic!("timer task failure"))
        .unwrap();

    // wait for the worker to die
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        std::thread::sleep(Duration::from_millis(20));
        if timer.schedule(Duration::from_millis(1), || {}).is_err() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timer accepted work after its thread should have died"
        );
    }
}
