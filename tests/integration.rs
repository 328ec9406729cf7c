use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::Rng;

use eon::{ConfigBuilder, Dict, HashValue, Queue};

const THREADS: u64 = 4;

fn hv(value: u128) -> HashValue {
    HashValue::new(value)
}

#[test]
fn concurrent_inserts_then_read_back() {
    const WRITERS: u64 = 8;
    const PER_THREAD: u64 = 10_000;

    let dict: Arc<Dict<u64>> = Arc::new(Dict::new());

    let handles: Vec<_> = (0..WRITERS)
        .map(|tid| {
            let dict = Arc::clone(&dict);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = (tid * PER_THREAD + i) as u128 + 1;
                    dict.put(hv(key), (tid << 32) | i, true);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(dict.len(), WRITERS * PER_THREAD);

    let mut sum = 0u64;
    for tid in 0..WRITERS {
        for i in 0..PER_THREAD {
            let key = (tid * PER_THREAD + i) as u128 + 1;
            let value = dict.get(hv(key)).expect("inserted key is missing");
            assert_eq!(value >> 32, tid);
            sum += value & 0xffff_ffff;
        }
    }

    // each thread contributed 0 + 1 + ... + (n - 1)
    assert_eq!(sum, WRITERS * (PER_THREAD * (PER_THREAD - 1) / 2));
}

#[test]
fn racing_puts_leave_one_winner() {
    for _ in 0..50 {
        let dict: Arc<Dict<&str>> = Arc::new(Dict::new());
        let barrier = Arc::new(Barrier::new(2));

        let a = {
            let dict = Arc::clone(&dict);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dict.put(hv(42), "a", true);
            })
        };
        let b = {
            let dict = Arc::clone(&dict);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                dict.put(hv(42), "b", true);
            })
        };
        a.join().unwrap();
        b.join().unwrap();

        let winner = dict.get(hv(42)).expect("one of the writes must survive");
        assert!(winner == "a" || winner == "b");

        let view = dict.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].item, winner);
    }
}

#[test]
fn concurrent_writers_migrate_cooperatively() {
    const PER_THREAD: u64 = 5_000;

    // a tiny initial store forces a long chain of migrations under load
    let dict: Arc<Dict<u64>> = Arc::new(Dict::with_capacity_log(2));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let dict = Arc::clone(&dict);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = (tid * PER_THREAD + i) as u128 + 1;
                    dict.put(hv(key), key as u64, true);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 1..=(THREADS * PER_THREAD) as u128 {
        assert_eq!(dict.get(hv(key)), Some(key as u64));
    }
}

#[test]
fn randomized_mixed_operations() {
    const KEYS: u128 = 64;

    let dict: Arc<Dict<u64>> = Arc::new(Dict::with_capacity_log(4));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let dict = Arc::clone(&dict);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for round in 0..10_000u64 {
                    let key = rng.gen_range(1..=KEYS);
                    match rng.gen_range(0..4) {
                        0 => drop(dict.remove(hv(key))),
                        1 => drop(dict.get(hv(key))),
                        _ => drop(dict.put(hv(key), round, true)),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // quiescent: the view, the counters and point reads must agree
    let view = dict.view();
    assert_eq!(view.len() as u64, dict.len());

    let mut seen = HashSet::new();
    for entry in &view {
        assert!(seen.insert(entry.hv), "duplicate key in view");
        assert_eq!(dict.get(entry.hv), Some(entry.item));
    }
}

#[test]
fn queue_per_producer_order_survives_drain() {
    const PER_PRODUCER: u64 = 512;

    let queue: Arc<Queue<(u64, u64)>> = Arc::new(Queue::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for mid in 0..PER_PRODUCER {
                    queue.enqueue((tid, mid));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut drained = 0;
    let mut last_mid = vec![None::<u64>; THREADS as usize];
    while let Some((tid, mid)) = queue.dequeue() {
        drained += 1;
        let last = &mut last_mid[tid as usize];
        assert!(last.map_or(true, |last| last < mid), "per-producer order violated");
        *last = Some(mid);
    }

    assert_eq!(drained, THREADS * PER_PRODUCER);
    assert_eq!(queue.dequeue(), None);
}

#[test]
fn producer_consumer_handoff() {
    const ITEMS: u64 = 100_000;

    let queue: Arc<Queue<u64>> = Arc::new(Queue::new());

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for value in 0..ITEMS {
                queue.enqueue(value);
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut expected = 0u64;
            while expected < ITEMS {
                match queue.dequeue() {
                    Some(value) => {
                        assert_eq!(value, expected);
                        expected += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_eq!(queue.dequeue(), None);
}

#[test]
fn queue_segment_churn_loses_nothing() {
    const PER_THREAD: u64 = 2_500;

    // 16 cells per segment forces constant rollover and retirement
    let config = ConfigBuilder::new().segment_size_log(4).build();
    let queue: Arc<Queue<u64>> = Arc::new(Queue::with_config(config));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    queue.enqueue(tid * 10_000 + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut drained = HashSet::new();
    while let Some(value) = queue.dequeue() {
        assert!(drained.insert(value), "value {} dequeued twice", value);
    }

    assert_eq!(drained.len() as u64, THREADS * PER_THREAD);
    for tid in 0..THREADS {
        for i in 0..PER_THREAD {
            assert!(drained.contains(&(tid * 10_000 + i)));
        }
    }
}

#[test]
fn dict_reclamation_is_exact() {
    let token = Arc::new(());
    let dict: Arc<Dict<Arc<()>>> = Arc::new(Dict::with_capacity_log(3));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let dict = Arc::clone(&dict);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                for i in 0..500u128 {
                    let key = tid as u128 * 1_000 + i + 1;
                    dict.put(hv(key), Arc::clone(&token), true);
                    if i % 3 == 0 {
                        dict.remove(hv(key));
                    }
                    if i % 7 == 0 {
                        dict.put(hv(key), Arc::clone(&token), true);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // the workers flushed their retire lists on exit; dropping the table
    // releases the remaining live records
    let dict = Arc::try_unwrap(dict).ok().expect("no other handles remain");
    drop(dict);

    assert_eq!(Arc::strong_count(&token), 1);
}

#[test]
fn queue_reclamation_is_exact() {
    let token = Arc::new(());
    let config = ConfigBuilder::new().segment_size_log(2).build();
    let queue: Arc<Queue<Arc<()>>> = Arc::new(Queue::with_config(config));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                for i in 0..1_000 {
                    queue.enqueue(Arc::clone(&token));
                    if i % 2 == 0 {
                        drop(queue.dequeue());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let queue = Arc::try_unwrap(queue).ok().expect("no other handles remain");
    drop(queue);

    assert_eq!(Arc::strong_count(&token), 1);
}
