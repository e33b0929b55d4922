use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use sigperf::profiler::ThreadLifecycle;
use sigperf::util::current_tid;
use sigperf::{create_for_thread, destroy_for_thread};

/// Stands in for a runtime's thread notifications: workers report their own
/// start and exit, and counters follow while a session is subscribed.
#[derive(Debug, Default)]
pub(crate) struct WorkerRegistry {
    subscribed: AtomicBool,
}

impl WorkerRegistry {
    pub(crate) fn thread_started(&self, tid: i32) {
        if !self.subscribed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = create_for_thread(tid) {
            warn!("thread {} will not be sampled: {}", tid, err);
        }
    }

    pub(crate) fn thread_exited(&self, tid: i32) {
        if self.subscribed.load(Ordering::Acquire) {
            destroy_for_thread(tid);
        }
    }
}

impl ThreadLifecycle for WorkerRegistry {
    fn subscribe(&self) {
        self.subscribed.store(true, Ordering::Release);
    }

    fn unsubscribe(&self) {
        self.subscribed.store(false, Ordering::Release);
    }
}

/// Mixes arithmetic with small allocations so that both CPU and allocator
/// events fire.
fn work(round: u64) -> u64 {
    let mut hash = round;
    for i in 0..1000u64 {
        hash = hash.wrapping_mul(0x100_0000_01b3) ^ i;
    }
    let buffer: Vec<u8> = Vec::with_capacity(64 + (hash % 4096) as usize);
    black_box(buffer);
    hash
}

pub(crate) fn spawn_workers(
    count: usize,
    registry: Arc<WorkerRegistry>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<Vec<JoinHandle<u64>>> {
    (0..count)
        .map(|i| {
            let registry = registry.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("sigperf-worker-{}", i))
                .spawn(move || {
                    let tid = current_tid();
                    registry.thread_started(tid);
                    debug!("worker {} started", tid);

                    let mut rounds = 0;
                    while !stop.load(Ordering::Relaxed) {
                        black_box(work(rounds));
                        rounds += 1;
                    }

                    registry.thread_exited(tid);
                    rounds
                })
        })
        .collect()
}
