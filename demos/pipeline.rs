//! Ordered pipeline demo
//!
//! A producer feeds tagged events into one ordered queue; a pool of
//! workers processes them concurrently and forwards each event to a
//! plain output queue. The main thread drains the output and checks
//! that the original order survived the parallel processing.
//!
//! Run with `cargo run --example pipeline` (RUST_LOG=info for the
//! scheduler's cold-path logging).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use evq::{Event, QueueParams, Scheduler, SyncMode, ThreadType, WaitMode, GROUP_ALL};

const EVENTS: u64 = 200_000;
const WORKERS: usize = 4;
const BURST: usize = 16;

fn main() {
    env_logger::init();

    let sched = Scheduler::with_defaults().expect("scheduler init");
    let rx = sched
        .queue_create(&QueueParams::scheduled(SyncMode::Ordered, 2, GROUP_ALL))
        .expect("rx queue");
    // Sized to hold the whole run so forwarding never backpressures.
    let tx = sched
        .queue_create(&QueueParams::plain().with_size(1 << 18))
        .expect("tx queue");

    let start = Instant::now();

    let producer = {
        let sched = Arc::clone(&sched);
        thread::spawn(move || {
            let mut next = 1u64;
            let mut burst = [Event::NULL; BURST];
            while next <= EVENTS {
                let n = (EVENTS - next + 1).min(BURST as u64) as usize;
                for (i, slot) in burst[..n].iter_mut().enumerate() {
                    *slot = Event(next + i as u64);
                }
                let mut sent = 0;
                while sent < n {
                    sent += sched.enqueue(rx, &burst[sent..n]).expect("enqueue");
                    if sent < n {
                        thread::yield_now();
                    }
                }
                next += n as u64;
            }
        })
    };

    let drained = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let sched = Arc::clone(&sched);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                let mut worker = sched.thread_attach(ThreadType::Worker).expect("attach");
                let mut out = [Event::NULL; BURST];
                while drained.load(Ordering::Acquire) < EVENTS as usize {
                    let (_, n) = worker.schedule_multi(WaitMode::NoWait, &mut out);
                    if n > 0 {
                        worker.enqueue(tx, &out[..n]).expect("forward");
                    }
                }
                worker.detach().expect("detach");
            })
        })
        .collect();

    // Drain the output, verifying the total order end to end.
    let mut expect = 1u64;
    let mut out = [Event::NULL; 64];
    while expect <= EVENTS {
        let n = sched.queue_deq(tx, &mut out).expect("drain");
        for ev in &out[..n] {
            assert_eq!(ev.0, expect, "order violated");
            expect += 1;
        }
        drained.store((expect - 1) as usize, Ordering::Release);
        if n == 0 {
            thread::yield_now();
        }
    }

    producer.join().unwrap();
    for w in workers {
        w.join().unwrap();
    }

    let elapsed = start.elapsed();
    let rate = EVENTS as f64 / elapsed.as_secs_f64() / 1e6;
    println!("{EVENTS} events through {WORKERS} workers in {elapsed:?} ({rate:.2} Mev/s)");
    println!("stats: {:?}", sched.stats());
}
