//! The classic provided-buffer pool.
//!
//! Fixed-size recv buffers in one contiguous 32-byte-aligned allocation,
//! addressed by 16-bit buffer ids. Buffers the kernel has consumed come
//! back one id at a time; the free side is kept as a short list of
//! contiguous [`Range`]s so republishing needs few `PROVIDE_BUFFERS`
//! submissions, each covering a whole run of ids.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use io_uring::{opcode, squeue};

use super::{aligned_buffer_size, BGID, BUFFER_ALIGN};
use crate::error::{Result, RingmarkError};

/// A contiguous run of free buffer ids, `start..start + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u16,
    pub count: u16,
}

impl Range {
    fn single(idx: u16) -> Self {
        Range { start: idx, count: 1 }
    }

    /// Absorb a single id adjacent to either end.
    fn merge_index(&mut self, idx: u16) -> bool {
        if self.start > 0 && idx == self.start - 1 {
            self.start = idx;
            self.count += 1;
            true
        } else if u32::from(idx) == u32::from(self.start) + u32::from(self.count) {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Absorb an adjacent range.
    fn merge_range(&mut self, other: Range) -> bool {
        if u32::from(self.start) + u32::from(self.count) == u32::from(other.start) {
            self.count += other.count;
            true
        } else if u32::from(other.start) + u32::from(other.count) == u32::from(self.start) {
            self.start = other.start;
            self.count += other.count;
            true
        } else {
            false
        }
    }

    fn sort_key(&self) -> u32 {
        (u32::from(self.start) << 16) | u32::from(self.count)
    }
}

/// Owner of the pool's backing memory, aligned for the kernel's benefit.
struct AlignedStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedStorage {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(BUFFER_ALIGN), BUFFER_ALIGN)
            .map_err(|e| RingmarkError::config(format!("bad pool layout: {e}")))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            RingmarkError::Io(std::io::Error::from(std::io::ErrorKind::OutOfMemory))
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for AlignedStorage {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The pool is owned and mutated by exactly one engine thread; the raw
// pointer is only shared with the kernel.
unsafe impl Send for AlignedStorage {}

/// The classic `PROVIDE_BUFFERS` pool.
pub struct ClassicPool {
    storage: AlignedStorage,
    count: u32,
    size_per_buffer: usize,
    low_watermark: usize,
    /// Free ranges awaiting publication, most recently touched last.
    to_provide: Vec<Range>,
    /// Scratch for `compact`, reused across calls.
    scratch: Vec<Range>,
    /// Total ids across `to_provide`.
    pending: usize,
}

impl ClassicPool {
    pub fn new(count: u32, recv_size: usize, low_watermark: u32) -> Result<Self> {
        if count == 0 || count >= u32::from(u16::MAX) {
            return Err(RingmarkError::config(format!(
                "provided buffer count {count} out of range"
            )));
        }
        let size_per_buffer = aligned_buffer_size(recv_size);
        let storage = AlignedStorage::new(size_per_buffer * count as usize)?;

        // The whole pool starts on the user side as one range; the engine
        // force-publishes it before the first accept.
        let mut to_provide = Vec::with_capacity(128);
        to_provide.push(Range { start: 0, count: count as u16 });

        Ok(Self {
            storage,
            count,
            size_per_buffer,
            low_watermark: low_watermark as usize,
            to_provide,
            scratch: Vec::with_capacity(128),
            pending: count as usize,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size_per_buffer(&self) -> usize {
        self.size_per_buffer
    }

    /// Ids currently held on the user side awaiting publication.
    pub fn pending_publish(&self) -> usize {
        self.pending
    }

    pub fn can_publish(&self) -> bool {
        !self.to_provide.is_empty()
    }

    pub fn needs_publish(&self) -> bool {
        self.pending > self.low_watermark
    }

    /// Free ranges, exposed for invariant checks.
    pub fn free_ranges(&self) -> &[Range] {
        &self.to_provide
    }

    /// Return one buffer id to the free side.
    ///
    /// Tries the most recent range first, then the one before it; recv
    /// completions come back almost sorted, with out-of-order-by-one the
    /// common exception (1,3,2 merges 2 into 3, then (2,3) into 1).
    pub fn return_index(&mut self, idx: u16) {
        debug_assert!(u32::from(idx) < self.count, "buffer id {idx} out of range");
        let n = self.to_provide.len();
        if n == 0 {
            self.to_provide.push(Range::single(idx));
        } else if self.to_provide[n - 1].merge_index(idx) {
            // merged into the back range
        } else if n >= 2 && self.to_provide[n - 2].merge_index(idx) {
            let back = self.to_provide[n - 1];
            if self.to_provide[n - 2].merge_range(back) {
                self.to_provide.pop();
            }
        } else {
            self.to_provide.push(Range::single(idx));
        }
        self.pending += 1;
    }

    /// Sort and coalesce the free ranges. Idempotent; called
    /// opportunistically before publishing.
    pub fn compact(&mut self) {
        match self.to_provide.len() {
            0 | 1 => return,
            2 => {
                // Common case given how completions are ordered.
                let second = self.to_provide[1];
                if self.to_provide[0].merge_range(second) {
                    self.to_provide.pop();
                }
                return;
            }
            _ => {}
        }
        self.to_provide.sort_unstable_by_key(Range::sort_key);
        self.scratch.clear();
        let mut back = self.to_provide[0];
        for &r in &self.to_provide[1..] {
            if !back.merge_range(r) {
                self.scratch.push(back);
                back = r;
            }
        }
        self.scratch.push(back);
        std::mem::swap(&mut self.to_provide, &mut self.scratch);
    }

    /// Pop the most recent free range into a `PROVIDE_BUFFERS` submission.
    ///
    /// The submission is marked to skip its success completion; once the
    /// kernel absorbs it, the covered ids are kernel-owned until recv
    /// completions carry them back.
    pub fn publish_one(&mut self) -> Option<squeue::Entry> {
        let r = self.to_provide.pop()?;
        self.pending -= r.count as usize;
        debug_assert!(!self.to_provide.is_empty() || self.pending == 0);
        let addr = self.buffer_ptr(r.start);
        Some(
            opcode::ProvideBuffers::new(addr, self.size_per_buffer as i32, r.count, BGID, r.start)
                .build()
                .flags(squeue::Flags::SKIP_SUCCESS)
                .user_data(0),
        )
    }

    /// Payload of buffer `idx`, limited to `len` received bytes.
    pub fn get_data(&self, idx: u16, len: usize) -> &[u8] {
        debug_assert!(len <= self.size_per_buffer);
        unsafe { std::slice::from_raw_parts(self.buffer_ptr(idx), len) }
    }

    fn buffer_ptr(&self, idx: u16) -> *mut u8 {
        debug_assert!(u32::from(idx) < self.count);
        unsafe { self.storage.ptr.as_ptr().add(idx as usize * self.size_per_buffer) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained(pool: &mut ClassicPool) -> &mut ClassicPool {
        // Simulate the initial publish so every id is kernel-owned.
        while pool.publish_one().is_some() {}
        pool
    }

    #[test]
    fn test_starts_with_whole_pool_pending() {
        let pool = ClassicPool::new(8, 100, 2).unwrap();
        assert_eq!(pool.pending_publish(), 8);
        assert_eq!(pool.free_ranges(), &[Range { start: 0, count: 8 }]);
        assert!(pool.needs_publish());
        assert_eq!(pool.size_per_buffer(), 128);
    }

    #[test]
    fn test_publish_one_consumes_ranges() {
        let mut pool = ClassicPool::new(8, 64, 2).unwrap();
        assert!(pool.publish_one().is_some());
        assert_eq!(pool.pending_publish(), 0);
        assert!(!pool.can_publish());
        assert!(pool.publish_one().is_none());
    }

    #[test]
    fn test_in_order_returns_form_one_range() {
        let mut pool = ClassicPool::new(8, 64, 8).unwrap();
        drained(&mut pool);
        for i in 0..8 {
            pool.return_index(i);
        }
        assert_eq!(pool.free_ranges(), &[Range { start: 0, count: 8 }]);
        assert_eq!(pool.pending_publish(), 8);
    }

    #[test]
    fn test_out_of_order_by_one_merges() {
        // The 1,3,2 pattern: 2 merges into 3, then (2,3) into 1.
        let mut pool = ClassicPool::new(8, 64, 8).unwrap();
        drained(&mut pool);
        for i in [1u16, 3, 2] {
            pool.return_index(i);
        }
        assert_eq!(pool.free_ranges(), &[Range { start: 1, count: 3 }]);
    }

    #[test]
    fn test_compact_after_any_permutation() {
        // Every permutation of 0..k coalesces to a single range.
        fn permutations(items: &mut Vec<u16>, k: usize, out: &mut Vec<Vec<u16>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            for i in 0..k {
                items.swap(i, k - 1);
                permutations(items, k - 1, out);
                items.swap(i, k - 1);
            }
        }
        let mut perms = Vec::new();
        permutations(&mut (0u16..5).collect::<Vec<_>>(), 5, &mut perms);
        for perm in perms {
            let mut pool = ClassicPool::new(5, 64, 5).unwrap();
            drained(&mut pool);
            for &i in &perm {
                pool.return_index(i);
            }
            pool.compact();
            assert_eq!(
                pool.free_ranges(),
                &[Range { start: 0, count: 5 }],
                "permutation {perm:?} failed to coalesce"
            );
            assert_eq!(pool.pending_publish(), 5);
        }
    }

    #[test]
    fn test_scattered_returns_watermark() {
        // Scenario: count=4, watermark=1, return [2,0,3,1].
        let mut pool = ClassicPool::new(4, 64, 1).unwrap();
        drained(&mut pool);
        assert!(!pool.needs_publish());
        for i in [2u16, 0, 3, 1] {
            pool.return_index(i);
        }
        pool.compact();
        assert_eq!(pool.free_ranges(), &[Range { start: 0, count: 4 }]);
        assert!(pool.needs_publish());
    }

    #[test]
    fn test_pending_equals_sum_of_ranges() {
        let mut pool = ClassicPool::new(16, 64, 4).unwrap();
        drained(&mut pool);
        for i in [0u16, 5, 2, 9, 14, 3, 6, 1] {
            pool.return_index(i);
            let sum: usize = pool.free_ranges().iter().map(|r| r.count as usize).sum();
            assert_eq!(sum, pool.pending_publish());
        }
        pool.compact();
        let sum: usize = pool.free_ranges().iter().map(|r| r.count as usize).sum();
        assert_eq!(sum, pool.pending_publish());
    }

    #[test]
    fn test_compact_is_idempotent() {
        let mut pool = ClassicPool::new(8, 64, 8).unwrap();
        drained(&mut pool);
        for i in [7u16, 0, 4, 2, 6, 1] {
            pool.return_index(i);
        }
        pool.compact();
        let once = pool.free_ranges().to_vec();
        pool.compact();
        assert_eq!(pool.free_ranges(), once.as_slice());
    }

    #[test]
    fn test_rejects_bad_counts() {
        assert!(ClassicPool::new(0, 64, 1).is_err());
        assert!(ClassicPool::new(u32::from(u16::MAX), 64, 1).is_err());
    }
}
