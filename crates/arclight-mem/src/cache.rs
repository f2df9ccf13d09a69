//! # Reclaim Cache
//!
//! Freed, cache-eligible buffers are parked here instead of being returned
//! to the kernel, keyed by a coarse placement bucket. A later allocation
//! with a compatible size/alignment/bucket takes the buffer back without
//! any ioctl.
//!
//! Buffers may enter the cache while the GPU is still using them; their
//! attached fences travel along and are checked (without blocking) at
//! reclaim time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use arclight_core::driver::{BoDomain, BoFlags};

use crate::block::MemoryBlock;
use crate::sync::SubmitFence;

// =============================================================================
// BUCKETS
// =============================================================================

/// Compute the cache bucket for a placement.
///
/// Domain bits and placement-relevant flag bits are kept disjoint so that
/// subtly different combinations never collapse into the same bucket — a
/// VRAM buffer must never satisfy a GTT-only request.
pub fn bucket_key(domain: BoDomain, flags: BoFlags) -> u32 {
    domain.bits() | (flags.intersection(BoFlags::PLACEMENT).bits() << 4)
}

// =============================================================================
// ENTRIES
// =============================================================================

struct CacheEntry {
    block: MemoryBlock,
    fences: VecDeque<SubmitFence>,
    deadline: Instant,
}

impl CacheEntry {
    /// Non-blocking: has all attached work retired?
    fn is_idle(&mut self) -> bool {
        while let Some(front) = self.fences.front() {
            if front.wait(0, false) {
                self.fences.pop_front();
            } else {
                return false;
            }
        }
        true
    }

    fn compatible(&self, size: u64, alignment: u64, size_factor: u64) -> bool {
        let bs = self.block.size().as_bytes();
        if bs < size {
            return false;
        }
        // Be lenient with size, but not so lenient that small requests pin
        // huge buffers.
        if bs > size.saturating_mul(size_factor) {
            return false;
        }
        self.block.va().is_aligned(alignment)
    }
}

#[derive(Default)]
struct CacheInner {
    buckets: BTreeMap<u32, VecDeque<CacheEntry>>,
    total_size: u64,
    num_buffers: usize,
}

impl CacheInner {
    fn release_expired(&mut self) {
        let now = Instant::now();
        let mut freed = 0u64;
        let mut count = 0usize;
        for entries in self.buckets.values_mut() {
            while let Some(front) = entries.front() {
                if front.deadline <= now {
                    let dead = entries.pop_front().unwrap();
                    freed += dead.block.size().as_bytes();
                    count += 1;
                } else {
                    break;
                }
            }
        }
        self.total_size -= freed;
        self.num_buffers -= count;
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Bucketed reclaim cache for real buffer allocations
pub struct ReclaimCache {
    inner: Mutex<CacheInner>,
    /// Unused buffers are released after this long
    ttl: Duration,
    /// A cached buffer up to this factor larger than the request still
    /// counts as a hit
    size_factor: u64,
    /// Total bytes the cache may hold
    max_size: u64,
}

impl ReclaimCache {
    /// Create a cache
    pub fn new(ttl: Duration, size_factor: u64, max_size: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            size_factor,
            max_size,
        }
    }

    /// Park a released buffer, or free it right away when the cache is
    /// over budget.
    pub fn add(&self, bucket: u32, block: MemoryBlock, fences: VecDeque<SubmitFence>) {
        let size = block.size().as_bytes();
        let mut inner = self.inner.lock().unwrap();

        // Expire stale entries first; they only make the budget check
        // fail spuriously.
        inner.release_expired();

        if inner.total_size + size > self.max_size {
            // Dropping the block frees it through the kernel.
            log::debug!("arclight: reclaim cache full, freeing buffer directly");
            return;
        }

        inner.total_size += size;
        inner.num_buffers += 1;
        let deadline = Instant::now() + self.ttl;
        inner.buckets.entry(bucket).or_default().push_back(CacheEntry {
            block,
            fences,
            deadline,
        });
    }

    /// Try to take a compatible, idle buffer out of the cache.
    pub fn reclaim(&self, bucket: u32, size: u64, alignment: u64) -> Option<MemoryBlock> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let entries = inner.buckets.get_mut(&bucket)?;

        let now = Instant::now();
        let mut i = 0;
        let mut found: Option<usize> = None;
        while i < entries.len() {
            if entries[i].compatible(size, alignment, self.size_factor) {
                if entries[i].is_idle() {
                    found = Some(i);
                }
                // Entries age front-to-back; a busy compatible buffer
                // means the rest are at least as busy, so stop either way.
                break;
            }
            if entries[i].deadline <= now {
                let dead = entries.remove(i).unwrap();
                inner.total_size -= dead.block.size().as_bytes();
                inner.num_buffers -= 1;
                continue;
            }
            i += 1;
        }

        let idx = found?;
        let entry = entries.remove(idx).unwrap();
        inner.total_size -= entry.block.size().as_bytes();
        inner.num_buffers -= 1;
        Some(entry.block)
    }

    /// Free every cached buffer. Used when the kernel runs out of memory.
    pub fn purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.clear();
        inner.total_size = 0;
        inner.num_buffers = 0;
    }

    /// Number of parked buffers
    pub fn num_buffers(&self) -> usize {
        self.inner.lock().unwrap().num_buffers
    }

    /// Total parked bytes
    pub fn cache_size(&self) -> u64 {
        self.inner.lock().unwrap().total_size
    }
}
