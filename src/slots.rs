use std::ops::Range;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::perf_events::{close_counter, disable};
use crate::ring_buffer::RingMapping;

/// Slots are committed in chunks of this many thread ids.
pub const CHUNK_SLOTS: usize = 1024;

/// Per-thread counter state.
///
/// The counter handle and the ring mapping are torn down independently and
/// both teardowns are idempotent. The mapping is only dereferenced with its
/// guard held; readers only ever try the guard so they never wait on a
/// teardown.
#[derive(Default)]
pub struct Slot {
    /// 0 when no counter is open.
    fd: AtomicI32,
    ring: spin::Mutex<Option<RingMapping>>,
}

impl Slot {
    pub fn fd(&self) -> c_int {
        self.fd.load(Ordering::Acquire)
    }

    pub fn is_mapped(&self) -> bool {
        self.ring.lock().is_some()
    }

    /// Stores a freshly opened counter, replacing whatever the slot held.
    pub fn install(&self, fd: c_int, ring: Option<RingMapping>) {
        self.destroy();
        *self.ring.lock() = ring;
        self.fd.store(fd, Ordering::Release);
    }

    /// Disables and closes the counter, then unmaps its ring buffer.
    pub fn destroy(&self) {
        let fd = self.fd.swap(0, Ordering::AcqRel);
        if fd != 0 {
            if let Err(e) = disable(fd) {
                debug!("failed to disable counter fd={}: {}", fd, e);
            }
            if let Err(e) = close_counter(fd) {
                warn!("failed to close counter fd={}: errno {}", fd, e);
            }
        }

        let mut ring = self.ring.lock();
        if ring.is_some() {
            *ring = None;
        }
    }

    /// Decodes the latest call chain without waiting: a slot being torn down
    /// or read elsewhere yields an empty chain.
    pub fn try_call_chain(&self, max_depth: usize, excluded: &Range<u64>, out: &mut [u64]) -> usize {
        let Some(ring) = self.ring.try_lock() else {
            return 0;
        };
        match ring.as_ref() {
            Some(ring) => ring.latest_call_chain(max_depth, excluded, out),
            None => 0,
        }
    }
}

/// One slot per possible thread id, indexed by the id itself.
///
/// Capacity is fixed at construction. Slots are committed lazily, a chunk at
/// a time, so that a large `pid_max` only costs the chunk index up front.
/// Lookups of committed slots are lock free and never allocate.
pub struct SlotTable {
    capacity: usize,
    chunks: Box<[OnceLock<Box<[Slot]>>]>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let chunks = capacity.div_ceil(CHUNK_SLOTS);
        SlotTable {
            capacity,
            chunks: (0..chunks).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, tid: i32) -> Option<(usize, usize)> {
        let tid = usize::try_from(tid).ok()?;
        if tid >= self.capacity {
            return None;
        }
        Some((tid / CHUNK_SLOTS, tid % CHUNK_SLOTS))
    }

    /// Slot for `tid` if its chunk has been committed. Async-signal-safe.
    pub fn get(&self, tid: i32) -> Option<&Slot> {
        let (chunk, offset) = self.index(tid)?;
        self.chunks[chunk].get().map(|slots| &slots[offset])
    }

    /// Slot for `tid`, committing its chunk if needed. `None` when `tid` is
    /// beyond the capacity.
    pub fn get_or_commit(&self, tid: i32) -> Option<&Slot> {
        let (chunk, offset) = self.index(tid)?;
        let slots = self.chunks[chunk]
            .get_or_init(|| (0..CHUNK_SLOTS).map(|_| Slot::default()).collect());
        Some(&slots[offset])
    }

    /// Every committed slot with its thread id. Uncommitted slots are empty.
    pub fn committed(&self) -> impl Iterator<Item = (i32, &Slot)> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(chunk, slots)| slots.get().map(|slots| (chunk, slots)))
            .flat_map(move |(chunk, slots)| {
                slots
                    .iter()
                    .enumerate()
                    .map(move |(offset, slot)| ((chunk * CHUNK_SLOTS + offset) as i32, slot))
            })
            .filter(move |(tid, _)| (*tid as usize) < self.capacity)
    }

    pub fn destroy_all(&self) {
        for (_, slot) in self.committed() {
            slot.destroy();
        }
    }
}

impl Drop for SlotTable {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
