use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, span, Level};

use crate::util::StackFrame;

/// One captured overflow, handed to the sink from the signal handler of the
/// sampled thread.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub tid: i32,
    /// Counter value or the value of the event's weight argument.
    pub weight: u64,
    pub frame: StackFrame,
    /// Native call chain, leaf first. Empty unless call chain capture is enabled.
    pub call_chain: &'a [u64],
}

impl Sample<'_> {
    /// Innermost address of the sample.
    pub fn leaf(&self) -> u64 {
        self.call_chain.first().copied().unwrap_or(self.frame.pc)
    }
}

/// Receives samples. `record_sample` runs inside a signal handler, so
/// implementations must not allocate, block or take locks that the
/// interrupted thread might hold.
pub trait SampleSink: Send + Sync {
    fn record_sample(&self, sample: &Sample<'_>);
}

pub type ThreadSafeSink = Arc<dyn SampleSink>;

/// Discards every sample, useful for testing.
#[derive(Debug, Default)]
pub struct NullCollector {}

impl NullCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleSink for NullCollector {
    fn record_sample(&self, _sample: &Sample<'_>) {}
}

const LEAF_TABLE_SIZE: usize = 4096;
const MAX_PROBES: usize = 32;

#[derive(Default)]
struct LeafEntry {
    /// 0 means the entry is free.
    address: AtomicU64,
    samples: AtomicU64,
    weight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafCount {
    pub address: u64,
    pub samples: u64,
    pub weight: u64,
}

/// Aggregates samples in memory using atomics only: totals plus a fixed size
/// open addressing table keyed by leaf address. Leaves that don't fit are
/// counted as dropped.
pub struct AggregatorCollector {
    samples: AtomicU64,
    weight: AtomicU64,
    dropped_leaves: AtomicU64,
    leaves: Box<[LeafEntry]>,
}

impl Default for AggregatorCollector {
    fn default() -> Self {
        Self {
            samples: AtomicU64::new(0),
            weight: AtomicU64::new(0),
            dropped_leaves: AtomicU64::new(0),
            leaves: (0..LEAF_TABLE_SIZE).map(|_| LeafEntry::default()).collect(),
        }
    }
}

impl AggregatorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn dropped_leaves(&self) -> u64 {
        self.dropped_leaves.load(Ordering::Relaxed)
    }

    fn bucket(address: u64) -> usize {
        (address.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize % LEAF_TABLE_SIZE
    }

    fn entry_for(&self, address: u64) -> Option<&LeafEntry> {
        let start = Self::bucket(address);
        for probe in 0..MAX_PROBES {
            let entry = &self.leaves[(start + probe) % LEAF_TABLE_SIZE];
            match entry
                .address
                .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(entry),
                Err(current) if current == address => return Some(entry),
                Err(_) => continue,
            }
        }
        None
    }

    /// The `n` leaves with the most samples, heaviest first.
    pub fn top(&self, n: usize) -> Vec<LeafCount> {
        let _span = span!(Level::DEBUG, "AggregatorCollector.top").entered();

        let mut leaves: Vec<LeafCount> = self
            .leaves
            .iter()
            .filter_map(|entry| {
                let address = entry.address.load(Ordering::Acquire);
                (address != 0).then(|| LeafCount {
                    address,
                    samples: entry.samples.load(Ordering::Relaxed),
                    weight: entry.weight.load(Ordering::Relaxed),
                })
            })
            .collect();
        debug!("found {} unique leaves", leaves.len());

        leaves.sort_by(|a, b| {
            b.samples
                .cmp(&a.samples)
                .then(b.weight.cmp(&a.weight))
                .then(a.address.cmp(&b.address))
        });
        leaves.truncate(n);
        leaves
    }
}

impl SampleSink for AggregatorCollector {
    fn record_sample(&self, sample: &Sample<'_>) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.weight.fetch_add(sample.weight, Ordering::Relaxed);

        let leaf = sample.leaf();
        if leaf == 0 {
            return;
        }
        match self.entry_for(leaf) {
            Some(entry) => {
                entry.samples.fetch_add(1, Ordering::Relaxed);
                entry.weight.fetch_add(sample.weight, Ordering::Relaxed);
            }
            None => {
                self.dropped_leaves.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
