use std::collections::HashSet;
use std::sync::mpsc::channel;
use std::time::Duration;

use strand_sync::queue::{LinkedQueue, PollTimeoutError};
use strand_sync::thread;

#[test]
fn zero_capacity_is_rejected() {
    assert!(LinkedQueue::<i32>::with_capacity(0).is_err());
}

#[test]
fn fifo_order() {
    let q = LinkedQueue::with_capacity(10).unwrap();
    q.put(1).unwrap();
    q.put(2).unwrap();
    q.put(3).unwrap();
    assert_eq!(q.len(), 3);
    assert_eq!(q.take().unwrap(), 1);
    assert_eq!(q.take().unwrap(), 2);
    assert_eq!(q.take().unwrap(), 3);
    assert!(q.is_empty());
}

#[test]
fn bounded_buffer_handoff() {
    // capacity 3; the producer blocks on its 4th put until a take frees a
    // slot; the consumer sees every element exactly once, in order
    let q = LinkedQueue::with_capacity(3).unwrap();

    let producer = {
        let q = q.clone();
        std::thread::spawn(move || {
            for item in ['a', 'b', 'c', 'd'] {
                q.put(item).unwrap();
            }
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    // the 4th put is still blocked
    assert_eq!(q.len(), 3);

    assert_eq!(q.take().unwrap(), 'a');
    assert_eq!(q.take().unwrap(), 'b');
    assert_eq!(q.take().unwrap(), 'c');
    producer.join().unwrap();
    assert_eq!(q.take().unwrap(), 'd');

    assert!(q.is_empty());
    assert_eq!(q.len(), 0);
}

#[test]
fn offer_and_poll_never_block() {
    let q = LinkedQueue::with_capacity(1).unwrap();
    assert_eq!(q.poll(), None);
    assert!(q.offer(1).is_ok());
    assert_eq!(q.offer(2), Err(2));
    assert_eq!(q.poll(), Some(1));
    assert_eq!(q.poll(), None);
}

#[test]
fn timed_offer_returns_the_element() {
    let q = LinkedQueue::with_capacity(1).unwrap();
    q.put("full").unwrap();
    let result = q.offer_for("spare", Duration::from_millis(50));
    match result {
        Err(e) => {
            assert!(e.is_timeout());
            assert_eq!(e.into_inner(), "spare");
        }
        Ok(()) => panic!("offer into a full queue succeeded"),
    }
}

#[test]
fn timed_poll_times_out_then_succeeds() {
    let q = LinkedQueue::<i32>::with_capacity(4).unwrap();
    assert_eq!(
        q.poll_for(Duration::from_millis(50)),
        Err(PollTimeoutError::TimedOut)
    );

    let producer = {
        let q = q.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            q.put(9).unwrap();
        })
    };
    assert_eq!(q.poll_for(Duration::from_secs(10)), Ok(9));
    producer.join().unwrap();
}

#[test]
fn interrupted_take_leaves_queue_intact() {
    let q = LinkedQueue::<i32>::with_capacity(4).unwrap();

    let (tx, rx) = channel();
    let consumer = {
        let q = q.clone();
        std::thread::spawn(move || {
            tx.send(thread::current()).unwrap();
            q.take()
        })
    };
    let handle = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    handle.interrupt();

    assert!(consumer.join().unwrap().is_err());
    // nothing was consumed and the queue still works
    q.put(5).unwrap();
    assert_eq!(q.take().unwrap(), 5);
}

#[test]
fn interrupting_one_consumer_does_not_strand_another() {
    let q = LinkedQueue::<i32>::with_capacity(4).unwrap();

    let (tx1, rx1) = channel();
    let first = {
        let q = q.clone();
        std::thread::spawn(move || {
            tx1.send(thread::current()).unwrap();
            q.take()
        })
    };
    let second = {
        let q = q.clone();
        std::thread::spawn(move || q.take())
    };
    std::thread::sleep(Duration::from_millis(100));

    let handle = rx1.recv().unwrap();
    handle.interrupt();
    assert!(first.join().unwrap().is_err());

    // the interrupted consumer must not have swallowed the wakeup path:
    // the remaining consumer still receives the element
    q.put(7).unwrap();
    assert_eq!(second.join().unwrap(), Ok(7));
}

#[test]
fn remove_relinks_the_list() {
    let q = LinkedQueue::with_capacity(5).unwrap();
    for item in [1, 2, 3] {
        q.put(item).unwrap();
    }
    assert!(q.remove(&2));
    assert!(!q.remove(&9));
    assert_eq!(q.to_vec(), vec![1, 3]);

    // removing the tail keeps later puts linked correctly
    assert!(q.remove(&3));
    q.put(4).unwrap();
    assert_eq!(q.to_vec(), vec![1, 4]);
}

#[test]
fn snapshot_views() {
    let q = LinkedQueue::with_capacity(5).unwrap();
    for item in [10, 20, 30] {
        q.put(item).unwrap();
    }
    assert_eq!(q.peek(), Some(10));
    assert_eq!(q.len(), 3);
    assert_eq!(q.remaining_capacity(), 2);
    assert_eq!(q.iter().collect::<Vec<_>>(), vec![10, 20, 30]);
    // the snapshot did not consume anything
    assert_eq!(q.take().unwrap(), 10);
}

#[test]
fn concurrent_producers_and_consumers_lose_nothing() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 200;
    let q = LinkedQueue::with_capacity(8).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.put(p * PER_PRODUCER + i).unwrap();
                }
            })
        })
        .collect();

    let consumer = {
        let q = q.clone();
        std::thread::spawn(move || {
            let mut seen = HashSet::new();
            for _ in 0..PRODUCERS * PER_PRODUCER {
                assert!(seen.insert(q.take().unwrap()));
            }
            seen
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }
    let seen = consumer.join().unwrap();
    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
    assert!(q.is_empty());
}
