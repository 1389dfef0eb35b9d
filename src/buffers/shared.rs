//! The shared user/kernel buffer ring provider.
//!
//! One anonymous mapping holds a power-of-two descriptor ring followed by
//! the payload slots. Every descriptor is seeded at construction and the
//! tail published once; afterwards buffers go back to the kernel by
//! rewriting ring entries and advancing the tail with a release store,
//! with no submissions and no syscalls. The kernel owns slot positions in
//! `[head, tail)`; this side never reads `head`, making the
//! synchronization one-way.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use io_uring::Submitter;

use super::{aligned_buffer_size, BGID};
use crate::error::{Result, RingmarkError};

/// Returned ids are staged and written out in batches of this many, so a
/// release store happens once per batch rather than once per buffer.
const STAGE_CAPACITY: usize = 32;

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Shared buffer ring provider (`register_buf_ring` variant).
pub struct SharedRingPool {
    base: *mut u8,
    mmap_len: usize,
    ring_entries: u32,
    ring_mask: u32,
    count: u32,
    size_per_buffer: usize,
    payload_base: *mut u8,

    tail_cached: u16,
    /// Lifetime count of published descriptors, monotonic.
    total_published: u64,
    staged: [u16; STAGE_CAPACITY],
    staged_len: usize,
}

// Owned and mutated by one engine thread only; the mapping is shared with
// the kernel through the registered ring, not with other threads.
unsafe impl Send for SharedRingPool {}

impl SharedRingPool {
    pub fn new(count: u32, recv_size: usize, huge_pages: bool) -> Result<Self> {
        if count == 0 || count >= u32::from(u16::MAX) {
            return Err(RingmarkError::config(format!(
                "provided buffer count {count} out of range"
            )));
        }
        let ring_entries = count.next_power_of_two();
        if ring_entries > 32_768 {
            return Err(RingmarkError::config(format!(
                "buffer ring of {ring_entries} entries exceeds the registrable maximum"
            )));
        }
        let ring_mask = ring_entries - 1;
        let size_per_buffer = aligned_buffer_size(recv_size);

        let ring_mem = aligned_buffer_size(
            ring_entries as usize * std::mem::size_of::<BufRingEntry>(),
        );
        let mut mmap_len = ring_mem + count as usize * size_per_buffer;

        let mut flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        if huge_pages {
            mmap_len = mmap_len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;
            flags |= libc::MAP_HUGETLB;
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(if huge_pages {
                RingmarkError::config(format!(
                    "mmap of {mmap_len} bytes with huge pages failed ({err}); \
                     are huge pages reserved?"
                ))
            } else {
                RingmarkError::Io(err)
            });
        }

        let mut pool = Self {
            base: base.cast(),
            mmap_len,
            ring_entries,
            ring_mask,
            count,
            size_per_buffer,
            payload_base: unsafe { base.cast::<u8>().add(ring_mem) },
            tail_cached: 0,
            total_published: 0,
            staged: [0; STAGE_CAPACITY],
            staged_len: 0,
        };

        // Seed every descriptor and hand the full pool to the kernel with
        // a single tail publication.
        for i in 0..count as u16 {
            pool.write_descriptor(pool.tail_cached, i);
            pool.tail_cached = pool.tail_cached.wrapping_add(1);
        }
        pool.total_published = u64::from(count);
        pool.publish_tail();

        Ok(pool)
    }

    /// Register the ring memory with the kernel. Must happen once before
    /// any buffer-select recv is submitted.
    pub fn register(&self, submitter: &Submitter<'_>) -> Result<()> {
        unsafe {
            submitter.register_buf_ring(self.base as u64, self.ring_entries as u16, BGID)?;
        }
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size_per_buffer(&self) -> usize {
        self.size_per_buffer
    }

    /// Ids staged but not yet visible to the kernel.
    pub fn staged(&self) -> usize {
        self.staged_len
    }

    /// Lifetime count of descriptors published; never decreases.
    pub fn total_published(&self) -> u64 {
        self.total_published
    }

    /// Return buffer `idx` to the kernel, batched.
    pub fn return_index(&mut self, idx: u16) {
        debug_assert!(u32::from(idx) < self.count, "buffer id {idx} out of range");
        self.staged[self.staged_len] = idx;
        self.staged_len += 1;
        if self.staged_len < STAGE_CAPACITY {
            return;
        }
        self.staged_len = 0;
        for i in 0..STAGE_CAPACITY {
            self.write_descriptor(self.tail_cached, self.staged[i]);
            self.tail_cached = self.tail_cached.wrapping_add(1);
        }
        self.total_published += STAGE_CAPACITY as u64;
        self.publish_tail();
    }

    /// Payload of buffer `idx`, limited to `len` received bytes.
    pub fn get_data(&self, idx: u16, len: usize) -> &[u8] {
        debug_assert!(len <= self.size_per_buffer);
        unsafe { std::slice::from_raw_parts(self.buffer_ptr(idx), len) }
    }

    fn buffer_ptr(&self, idx: u16) -> *mut u8 {
        debug_assert!(u32::from(idx) < self.count);
        unsafe { self.payload_base.add(idx as usize * self.size_per_buffer) }
    }

    /// Fill the ring descriptor at `tail & mask` for buffer `bid`.
    fn write_descriptor(&mut self, tail: u16, bid: u16) {
        let slot = (u32::from(tail) & self.ring_mask) as usize;
        unsafe {
            let entry = self.base.cast::<BufRingEntry>().add(slot);
            (*entry).set_addr(self.buffer_ptr(bid) as u64);
            (*entry).set_len(self.size_per_buffer as u32);
            (*entry).set_bid(bid);
        }
    }

    /// Release-store the cached tail so all descriptor writes above are
    /// visible to the kernel before the advance.
    fn publish_tail(&self) {
        unsafe {
            let tail_ptr = BufRingEntry::tail(self.base.cast::<BufRingEntry>());
            (*tail_ptr.cast::<AtomicU16>()).store(self.tail_cached, Ordering::Release);
        }
    }
}

impl Drop for SharedRingPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.mmap_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_publishes_full_pool() {
        let pool = SharedRingPool::new(8, 100, false).unwrap();
        assert_eq!(pool.count(), 8);
        assert_eq!(pool.size_per_buffer(), 128);
        assert_eq!(pool.total_published(), 8);
        assert_eq!(pool.staged(), 0);
        assert_eq!(pool.tail_cached, 8);
    }

    #[test]
    fn test_ring_entries_rounded_to_power_of_two() {
        let pool = SharedRingPool::new(100, 64, false).unwrap();
        assert_eq!(pool.ring_entries, 128);
        assert_eq!(pool.ring_mask, 127);
    }

    #[test]
    fn test_returns_stage_until_batch() {
        let mut pool = SharedRingPool::new(64, 64, false).unwrap();
        let before = pool.total_published();
        for i in 0..(STAGE_CAPACITY - 1) as u16 {
            pool.return_index(i);
        }
        assert_eq!(pool.staged(), STAGE_CAPACITY - 1);
        assert_eq!(pool.total_published(), before);

        pool.return_index((STAGE_CAPACITY - 1) as u16);
        assert_eq!(pool.staged(), 0);
        assert_eq!(pool.total_published(), before + STAGE_CAPACITY as u64);
    }

    #[test]
    fn test_tail_is_monotonic() {
        let mut pool = SharedRingPool::new(64, 64, false).unwrap();
        let mut last = pool.total_published();
        for round in 0..8 {
            for i in 0..STAGE_CAPACITY as u16 {
                pool.return_index((round * 7 + i) % 64);
            }
            assert!(pool.total_published() >= last, "tail went backwards");
            last = pool.total_published();
        }
        assert_eq!(last, 64 + 8 * STAGE_CAPACITY as u64);
    }

    #[test]
    fn test_payload_slots_are_distinct() {
        let pool = SharedRingPool::new(4, 64, false).unwrap();
        let a = pool.get_data(0, 64).as_ptr() as usize;
        let b = pool.get_data(1, 64).as_ptr() as usize;
        assert_eq!(b - a, pool.size_per_buffer());
    }

    #[test]
    fn test_rejects_oversized_pool() {
        assert!(SharedRingPool::new(0, 64, false).is_err());
        assert!(SharedRingPool::new(40_000, 64, false).is_err());
    }
}
