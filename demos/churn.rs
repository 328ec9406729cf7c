//! Hammers the hash table and the queue from several threads and prints a
//! short summary. With `--features counters` the run also reports the
//! internal operation counters.
//!
//! ```text
//! cargo run --example churn --release --features counters
//! ```

use std::sync::Arc;
use std::thread;

use eon::{Dict, HashValue, Queue};

const THREADS: u64 = 4;
const OPS_PER_THREAD: u64 = 100_000;
const KEY_SPACE: u64 = 4_096;

fn main() {
    let dict: Arc<Dict<u64>> = Arc::new(Dict::new());
    let queue: Arc<Queue<u64>> = Arc::new(Queue::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let dict = Arc::clone(&dict);
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut dequeued = 0u64;
                for i in 0..OPS_PER_THREAD {
                    let key = (tid.wrapping_mul(2_654_435_761).wrapping_add(i) % KEY_SPACE) + 1;
                    let hv = HashValue::new(key as u128);
                    match i % 5 {
                        0 => drop(dict.remove(hv)),
                        1 | 2 => drop(dict.put(hv, i, true)),
                        _ => drop(dict.get(hv)),
                    }

                    queue.enqueue(tid * OPS_PER_THREAD + i);
                    if i % 2 == 0 {
                        dequeued += u64::from(queue.dequeue().is_some());
                    }
                }
                dequeued
            })
        })
        .collect();

    let dequeued: u64 = handles.into_iter().map(|handle| handle.join().unwrap()).sum();

    println!(
        "dict: {} live entries after {} mixed operations",
        dict.len(),
        THREADS * OPS_PER_THREAD
    );
    println!(
        "queue: {} dequeued concurrently, {} left behind",
        dequeued,
        queue.len()
    );

    let view = dict.view();
    println!("view: {} entries, first insertions first", view.len());

    #[cfg(feature = "counters")]
    {
        let mut out = std::io::stdout();
        eon::counters::report_alltime(&mut out).unwrap();
    }
}
