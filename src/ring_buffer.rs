//! Call chain decoding from a counter's mmap'd ring buffer.
//!
//! The kernel publishes `data_head` in the control page and appends records
//! to the data pages that follow it. We read `data_head` (volatile, then an
//! acquire fence), decode from `data_tail`, and hand the space back by
//! advancing `data_tail`.

use std::mem;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use memmap2::MmapRaw;
use perf_event_open_sys::bindings::{perf_event_header, perf_event_mmap_page, PERF_RECORD_SAMPLE};

/// Call chain entries at or above this value are context markers such as
/// `PERF_CONTEXT_USER`, not addresses.
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

const HEADER_SIZE: u64 = mem::size_of::<perf_event_header>() as u64;

/// An mmap'd counter ring buffer, exclusively owned by one slot.
pub struct RingMapping {
    mmap: MmapRaw,
    page_size: usize,
}

impl RingMapping {
    pub fn new(mmap: MmapRaw, page_size: usize) -> Self {
        RingMapping { mmap, page_size }
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Decodes the most recent sample's call chain into `out`, see
    /// [`RingView::latest_call_chain`]. Returns the number of addresses written.
    pub fn latest_call_chain(&self, max_depth: usize, excluded: &Range<u64>, out: &mut [u64]) -> usize {
        match unsafe { RingView::new(self.mmap.as_mut_ptr(), self.mmap.len(), self.page_size) } {
            Some(view) => view.latest_call_chain(max_depth, excluded, out),
            None => 0,
        }
    }

    pub fn read_tail(&self) -> u64 {
        match unsafe { RingView::new(self.mmap.as_mut_ptr(), self.mmap.len(), self.page_size) } {
            Some(view) => view.read_tail(),
            None => 0,
        }
    }
}

/// Borrowed view over a mapped ring buffer: one control page followed by a
/// power-of-two sized data region.
pub struct RingView {
    base: *mut u8,
    page_size: usize,
    data_size: u64,
}

impl RingView {
    /// Returns `None` if the mapping has no data pages or the data region is
    /// not a power of two.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` readable and writable bytes laid out like a
    /// perf event mmap region, live for as long as the view is used.
    pub unsafe fn new(base: *mut u8, len: usize, page_size: usize) -> Option<Self> {
        if base.is_null() || len <= page_size || page_size < mem::size_of::<perf_event_mmap_page>() {
            return None;
        }
        let data_size = (len - page_size) as u64;
        if !data_size.is_power_of_two() {
            return None;
        }

        Some(RingView {
            base,
            page_size,
            data_size,
        })
    }

    fn control(&self) -> *mut perf_event_mmap_page {
        self.base as *mut perf_event_mmap_page
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(ptr::addr_of!((*self.control()).data_head)) };
        fence(Ordering::Acquire);
        head
    }

    pub fn read_tail(&self) -> u64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.control()).data_tail)) }
    }

    fn write_tail(&self, value: u64) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.control()).data_tail), value) };
    }

    /// Reads an 8-byte word at cursor `position`. Records are 8-byte aligned
    /// so a word never straddles the end of the data region.
    fn read_u64(&self, position: u64) -> u64 {
        let offset = (position & (self.data_size - 1)) as usize;
        unsafe { ptr::read_unaligned(self.base.add(self.page_size + offset) as *const u64) }
    }

    fn read_header(&self, position: u64) -> perf_event_header {
        let offset = (position & (self.data_size - 1)) as usize;
        unsafe {
            ptr::read_unaligned(self.base.add(self.page_size + offset) as *const perf_event_header)
        }
    }

    /// Scans unread records for the first `PERF_RECORD_SAMPLE` and copies its
    /// call chain into `out`, stopping at `max_depth` entries or at the first
    /// address inside `excluded`. Context markers are skipped.
    ///
    /// Only the latest overflow matters: the read cursor always jumps to the
    /// observed `data_head`, dropping records that were not inspected.
    pub fn latest_call_chain(&self, max_depth: usize, excluded: &Range<u64>, out: &mut [u64]) -> usize {
        let max_depth = max_depth.min(out.len());
        let head = self.read_head();
        let mut position = self.read_tail();
        let mut depth = 0;

        while position < head {
            let header = self.read_header(position);
            let size = header.size as u64;
            if size < HEADER_SIZE {
                break;
            }

            if header.type_ == PERF_RECORD_SAMPLE {
                let nr = self.read_u64(position + HEADER_SIZE);
                // Never trust `nr` past the end of the record.
                let capacity = size.saturating_sub(HEADER_SIZE + 8) / 8;
                let mut entry = position + HEADER_SIZE + 8;

                for _ in 0..nr.min(capacity) {
                    if depth >= max_depth {
                        break;
                    }
                    let ip = self.read_u64(entry);
                    entry += 8;

                    if ip >= PERF_CONTEXT_MAX {
                        continue;
                    }
                    if excluded.contains(&ip) {
                        break;
                    }
                    out[depth] = ip;
                    depth += 1;
                }
                break;
            }

            position += size;
        }

        if head > self.read_tail() {
            self.write_tail(head);
        }
        depth
    }
}

/// Anonymous mappings laid out like a counter's ring buffer.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    use memmap2::MmapOptions;

    use crate::util::page_size;

    pub(crate) const PERF_CONTEXT_USER: u64 = -512i64 as u64;

    pub(crate) struct FakeRing {
        pub(crate) mapping: RingMapping,
        pub(crate) head: u64,
    }

    impl FakeRing {
        pub(crate) fn new() -> Self {
            let mmap = MmapOptions::new().len(2 * page_size()).map_anon().unwrap();
            FakeRing {
                mapping: RingMapping::new(MmapRaw::from(mmap), page_size()),
                head: 0,
            }
        }

        pub(crate) fn base(&self) -> *mut u8 {
            self.mapping.mmap.as_mut_ptr()
        }

        pub(crate) fn set_cursors(&mut self, position: u64) {
            self.head = position;
            let control = self.base() as *mut perf_event_mmap_page;
            unsafe {
                (*control).data_head = position;
                (*control).data_tail = position;
            }
        }

        pub(crate) fn write_u64(&self, position: u64, value: u64) {
            let offset = (position % page_size() as u64) as usize;
            unsafe { ptr::write_unaligned(self.base().add(page_size() + offset) as *mut u64, value) };
        }

        pub(crate) fn push_record(&mut self, type_: u32, words: &[u64]) {
            let size = HEADER_SIZE + 8 * words.len() as u64;
            let header = perf_event_header {
                type_,
                misc: 0,
                size: size as u16,
            };
            let header: u64 = unsafe { mem::transmute(header) };
            self.write_u64(self.head, header);
            for (i, word) in words.iter().enumerate() {
                self.write_u64(self.head + HEADER_SIZE + 8 * i as u64, *word);
            }
            self.head += size;

            let control = self.base() as *mut perf_event_mmap_page;
            unsafe { (*control).data_head = self.head };
        }

        pub(crate) fn push_sample(&mut self, ips: &[u64]) {
            let mut words = vec![ips.len() as u64];
            words.extend_from_slice(ips);
            self.push_record(PERF_RECORD_SAMPLE, &words);
        }

        pub(crate) fn call_chain(&self, max_depth: usize, excluded: Range<u64>) -> Vec<u64> {
            let mut out = [0u64; 64];
            let depth = self.mapping.latest_call_chain(max_depth, &excluded, &mut out);
            out[..depth].to_vec()
        }

        pub(crate) fn into_mapping(self) -> RingMapping {
            self.mapping
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use memmap2::MmapOptions;
    use perf_event_open_sys::bindings::PERF_RECORD_MMAP;

    use crate::util::page_size;

    use super::fake::{FakeRing, PERF_CONTEXT_USER};

    #[test]
    fn test_empty_ring() {
        let ring = FakeRing::new();
        assert_eq!(ring.call_chain(16, 0..0), Vec::<u64>::new());
        assert_eq!(ring.mapping.read_tail(), 0);
    }

    #[test]
    fn test_decodes_first_sample_and_skips_context_markers() {
        let mut ring = FakeRing::new();
        ring.push_record(PERF_RECORD_MMAP, &[1, 2, 3]);
        ring.push_sample(&[PERF_CONTEXT_USER, 0x10, 0x20, 0x30]);
        ring.push_sample(&[0x40]);

        assert_eq!(ring.call_chain(16, 0..0), vec![0x10, 0x20, 0x30]);
        // Everything up to the observed head is consumed, including the
        // second sample.
        assert_eq!(ring.mapping.read_tail(), ring.head);
        assert_eq!(ring.call_chain(16, 0..0), Vec::<u64>::new());
    }

    #[test]
    fn test_max_depth_and_output_length() {
        let mut ring = FakeRing::new();
        ring.push_sample(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.call_chain(2, 0..0), vec![1, 2]);

        ring.push_sample(&[1, 2, 3, 4, 5]);
        let mut out = [0u64; 3];
        assert_eq!(ring.mapping.latest_call_chain(100, &(0..0), &mut out), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_stops_at_excluded_range() {
        let mut ring = FakeRing::new();
        ring.push_sample(&[0x100, 0x200, 0x5000, 0x300]);

        let chain = ring.call_chain(16, 0x4000..0x6000);
        assert_eq!(chain, vec![0x100, 0x200]);
        assert!(chain.iter().all(|ip| !(0x4000..0x6000).contains(ip)));
    }

    #[test]
    fn test_records_wrap_around_the_data_region() {
        let mut ring = FakeRing::new();
        let start = page_size() as u64 - 16;
        ring.set_cursors(start);
        ring.push_sample(&[0xa, 0xb, 0xc]);

        assert_eq!(ring.call_chain(16, 0..0), vec![0xa, 0xb, 0xc]);
        assert_eq!(ring.mapping.read_tail(), start + HEADER_SIZE + 32);
    }

    #[test]
    fn test_zero_sized_header_ends_scan() {
        let mut ring = FakeRing::new();
        ring.push_record(PERF_RECORD_MMAP, &[]);
        // Header claims zero bytes, so the following sample is never reached.
        ring.write_u64(0, 0);
        ring.push_sample(&[0x1]);

        assert_eq!(ring.call_chain(16, 0..0), Vec::<u64>::new());
        assert_eq!(ring.mapping.read_tail(), ring.head);
    }

    #[test]
    fn test_tail_is_monotonic() {
        let mut ring = FakeRing::new();
        let mut last_tail = ring.mapping.read_tail();

        for i in 0..200u64 {
            ring.push_sample(&[i + 1, i + 2]);
            if i % 3 == 0 {
                ring.push_record(PERF_RECORD_MMAP, &[i]);
            }
            ring.call_chain(1 + (i as usize % 4), 0..0);

            let tail = ring.mapping.read_tail();
            assert!(tail >= last_tail);
            assert_eq!(tail, ring.head);
            last_tail = tail;
        }
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let mmap = MmapOptions::new().len(page_size()).map_anon().unwrap();
        let mapping = RingMapping::new(MmapRaw::from(mmap), page_size());
        let mut out = [0u64; 4];
        assert_eq!(mapping.latest_call_chain(4, &(0..0), &mut out), 0);

        let mmap = MmapOptions::new().len(4 * page_size()).map_anon().unwrap();
        let base = MmapRaw::from(mmap);
        assert!(unsafe { RingView::new(base.as_mut_ptr(), base.len(), page_size()) }.is_none());
    }
}
