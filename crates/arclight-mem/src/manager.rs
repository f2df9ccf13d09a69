//! # Buffer Manager
//!
//! The device-wide buffer registry: creation (reclaim cache → slab → fresh
//! kernel allocation), import/export, per-domain telemetry and the global
//! table of live real buffers used by the submit-everything diagnostic
//! mode.
//!
//! Lock order (leaves last): a slab group lock may be taken while
//! acquiring the reclaim-cache lock, which may be taken while acquiring
//! the global buffer-table lock. No lock in this chain is ever acquired
//! in the opposite direction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arclight_core::driver::{BoDomain, BoFlags, DriverRef, ExportKind};
use arclight_core::error::{Error, Result};
use arclight_core::types::{BufferHandle, ByteSize, DeviceInfo};

use crate::block::MemoryBlock;
use crate::bo::Bo;
use crate::cache::{bucket_key, ReclaimCache};
use crate::slab::SlabPool;

// =============================================================================
// CONFIG
// =============================================================================

/// Below this much VRAM the device effectively has none; VRAM requests
/// fall back to write-combined GTT.
const VRAM_USELESS_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Tuning knobs for the buffer manager
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// How long an unused buffer may sit in the reclaim cache
    pub cache_ttl: Duration,
    /// A cached buffer up to this factor larger than a request is a hit
    pub cache_size_factor: u64,
    /// Cap on total cached bytes; defaults to (vram + gtt) / 8
    pub max_cache_size: Option<u64>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(500),
            cache_size_factor: 2,
            max_cache_size: None,
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State shared by every buffer, block and slab of one device
pub(crate) struct MemShared {
    pub(crate) driver: DriverRef,
    pub(crate) info: DeviceInfo,
    pub(crate) cache: ReclaimCache,
    pub(crate) slabs: SlabPool,
    next_id: AtomicU64,
    allocated_vram: AtomicU64,
    allocated_gtt: AtomicU64,
    buffer_wait_time: AtomicU64,
    /// Every live real block, id → kernel handle. Touched only on
    /// create/destroy, guarded by one coarse lock.
    global: Mutex<BTreeMap<u64, BufferHandle>>,
}

impl MemShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn account_alloc(
        &self,
        id: u64,
        handle: BufferHandle,
        domain: BoDomain,
        size: ByteSize,
    ) {
        let aligned = size.align_up(self.info.gart_page_size).as_bytes();
        if domain.contains(BoDomain::VRAM) {
            self.allocated_vram.fetch_add(aligned, Ordering::Relaxed);
        } else if domain.contains(BoDomain::GTT) {
            self.allocated_gtt.fetch_add(aligned, Ordering::Relaxed);
        }
        self.global.lock().unwrap().insert(id, handle);
    }

    pub(crate) fn account_free(&self, id: u64, domain: BoDomain, size: ByteSize) {
        let aligned = size.align_up(self.info.gart_page_size).as_bytes();
        if domain.contains(BoDomain::VRAM) {
            self.allocated_vram.fetch_sub(aligned, Ordering::Relaxed);
        } else if domain.contains(BoDomain::GTT) {
            self.allocated_gtt.fetch_sub(aligned, Ordering::Relaxed);
        }
        self.global.lock().unwrap().remove(&id);
    }

    /// Create a real (standalone) buffer: reclaim cache first, then a
    /// fresh kernel allocation with one purge-and-retry.
    pub(crate) fn create_real(
        self: &Arc<Self>,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Result<Bo> {
        // Page-align; small buffers benefit most since it widens cache
        // reuse.
        let size = size.align_up(self.info.gart_page_size);
        let bucket = bucket_key(domain, flags);
        let cacheable = flags.contains(BoFlags::REUSABLE);

        if cacheable {
            if let Some(block) = self.cache.reclaim(bucket, size.as_bytes(), alignment) {
                log::trace!("arclight: cache hit for {size} in {domain:?}");
                return Ok(Bo::new_real(self, block, true, bucket, flags));
            }
        }

        let block = match MemoryBlock::alloc(self, size, alignment, domain, flags) {
            Ok(b) => b,
            Err(_) => {
                // Under memory pressure: give everything idle back to the
                // kernel, then retry exactly once.
                self.cache.purge();
                MemoryBlock::alloc(self, size, alignment, domain, flags)?
            }
        };
        Ok(Bo::new_real(self, block, cacheable, bucket, flags))
    }
}

// =============================================================================
// BUFFER MANAGER
// =============================================================================

/// Device-wide buffer object registry
#[derive(Clone)]
pub struct BufferManager {
    shared: Arc<MemShared>,
}

impl BufferManager {
    /// Create the manager for one device
    pub fn new(driver: DriverRef, info: DeviceInfo, config: MemConfig) -> Self {
        let max_cache = config.max_cache_size.unwrap_or(
            (info.vram_size.as_bytes() + info.gtt_size.as_bytes()) / 8,
        );
        let shared = Arc::new(MemShared {
            cache: ReclaimCache::new(config.cache_ttl, config.cache_size_factor, max_cache),
            slabs: SlabPool::new(),
            next_id: AtomicU64::new(1),
            allocated_vram: AtomicU64::new(0),
            allocated_gtt: AtomicU64::new(0),
            buffer_wait_time: AtomicU64::new(0),
            global: Mutex::new(BTreeMap::new()),
            driver,
            info,
        });
        Self { shared }
    }

    /// Device info the manager was built with
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Kernel driver
    pub fn driver(&self) -> &DriverRef {
        &self.shared.driver
    }

    /// Create a buffer object.
    ///
    /// Small, compatible requests come from the slab sub-allocator;
    /// everything else is a real allocation served by the reclaim cache or
    /// a fresh kernel allocation. Zero-size requests are rejected — a
    /// missing buffer is a fatal inability to proceed with a draw, never
    /// something to ignore.
    pub fn create_buffer(
        &self,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Result<Bo> {
        if size == ByteSize::ZERO || domain.is_empty() {
            return Err(Error::InvalidParameter);
        }

        // Don't place anything in VRAM the device barely has. The kernel
        // is free to migrate buffers anyway; this only picks the initial
        // domain.
        let (domain, flags) = if domain.contains(BoDomain::VRAM)
            && self.shared.info.vram_size.as_bytes() <= VRAM_USELESS_THRESHOLD
        {
            (BoDomain::GTT, flags | BoFlags::GTT_WC)
        } else {
            (domain, flags)
        };

        if SlabPool::suitable(size, alignment, flags) {
            match self.shared.slabs.alloc(&self.shared, size, domain, flags) {
                Ok(bo) => return Ok(bo),
                Err(_) => {
                    // Slab growth failed: empty the reclaim cache and try
                    // once more before falling through to a real
                    // allocation.
                    self.shared.cache.purge();
                    if let Ok(bo) = self.shared.slabs.alloc(&self.shared, size, domain, flags) {
                        return Ok(bo);
                    }
                }
            }
        }

        match self.shared.create_real(size, alignment, domain, flags) {
            Ok(bo) => Ok(bo),
            Err(_) => {
                // Last resort: retire idle slabs too, then retry once.
                self.shared.slabs.reclaim_idle();
                self.shared.cache.purge();
                self.shared.create_real(size, alignment, domain, flags)
            }
        }
    }

    /// Allocate a raw memory block outside the buffer-object lifecycle.
    ///
    /// Used for winsys-internal pages (user fence words) that must never
    /// appear in a buffer list or the reclaim cache.
    pub fn create_block(
        &self,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Result<MemoryBlock> {
        MemoryBlock::alloc(&self.shared, size, alignment, domain, flags)
    }

    /// Wrap caller-owned host memory as a GTT buffer
    pub fn buffer_from_ptr(&self, ptr: *mut u8, size: ByteSize) -> Result<Bo> {
        let block = MemoryBlock::from_user_ptr(&self.shared, ptr, size)?;
        let bucket = bucket_key(BoDomain::GTT, BoFlags::empty());
        Ok(Bo::new_real(&self.shared, block, false, bucket, BoFlags::empty()))
    }

    /// Import a buffer another process exported
    pub fn import_buffer(&self, external: u64, kind: ExportKind) -> Result<Bo> {
        let imported = self.shared.driver.import(external, kind)?;
        let block = MemoryBlock::from_import(
            &self.shared,
            imported.handle,
            imported.size,
            imported.alignment,
            imported.domain,
        )?;
        let bucket = bucket_key(imported.domain, BoFlags::empty());
        let bo = Bo::new_real(&self.shared, block, false, bucket, BoFlags::empty());
        bo.mark_shared();
        Ok(bo)
    }

    /// Export a buffer for another process. Slab entries resolve to their
    /// parent's real handle. Marks the buffer shared (one-way).
    pub fn export_buffer(&self, bo: &Bo, kind: ExportKind) -> Result<u64> {
        let external = self.shared.driver.export(bo.kernel_handle(), kind)?;
        bo.mark_shared();
        Ok(external)
    }

    /// Free all idle cached memory (reclaim cache and fully idle slabs)
    pub fn purge(&self) {
        self.shared.slabs.reclaim_idle();
        self.shared.cache.purge();
    }

    /// Bytes currently allocated in a domain
    pub fn allocated(&self, domain: BoDomain) -> ByteSize {
        let v = if domain.contains(BoDomain::VRAM) {
            self.shared.allocated_vram.load(Ordering::Relaxed)
        } else {
            self.shared.allocated_gtt.load(Ordering::Relaxed)
        };
        ByteSize::from_bytes(v)
    }

    /// Number of live real blocks
    pub fn num_live_blocks(&self) -> usize {
        self.shared.global.lock().unwrap().len()
    }

    /// Kernel handles of every live real block, for the
    /// submit-everything diagnostic mode
    pub fn all_buffer_handles(&self) -> Vec<BufferHandle> {
        self.shared
            .global
            .lock()
            .unwrap()
            .values()
            .copied()
            .collect()
    }

    /// Record time a caller spent blocked on buffer waits
    pub fn add_buffer_wait_time(&self, ns: u64) {
        self.shared
            .buffer_wait_time
            .fetch_add(ns, Ordering::Relaxed);
    }

    /// Total time callers spent blocked on buffer waits
    pub fn buffer_wait_time(&self) -> u64 {
        self.shared.buffer_wait_time.load(Ordering::Relaxed)
    }

    /// Number of buffers parked in the reclaim cache
    pub fn cached_buffers(&self) -> usize {
        self.shared.cache.num_buffers()
    }

    /// Number of live slabs
    pub fn slab_count(&self) -> usize {
        self.shared.slabs.slab_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_core::driver::{BoUsage, DeviceDriver};
    use arclight_core::soft::SoftDevice;

    fn manager() -> (Arc<SoftDevice>, BufferManager) {
        let dev = Arc::new(SoftDevice::new());
        let info = dev.query_info().unwrap();
        let mgr = BufferManager::new(dev.clone(), info, MemConfig::default());
        (dev, mgr)
    }

    #[test]
    fn test_create_and_release() {
        let (_dev, mgr) = manager();
        let bo = mgr
            .create_buffer(
                ByteSize::from_mib(1),
                4096,
                BoDomain::GTT,
                BoFlags::NO_SUBALLOC,
            )
            .unwrap();
        assert!(mgr.allocated(BoDomain::GTT).as_bytes() >= 1024 * 1024);
        assert_eq!(mgr.num_live_blocks(), 1);
        drop(bo);
        // not REUSABLE: freed immediately
        assert_eq!(mgr.num_live_blocks(), 0);
        assert_eq!(mgr.allocated(BoDomain::GTT).as_bytes(), 0);
    }

    #[test]
    fn test_reclaim_idempotence() {
        let (_dev, mgr) = manager();
        let flags = BoFlags::NO_SUBALLOC | BoFlags::REUSABLE;
        let bo = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        let va = bo.va();
        drop(bo);
        assert_eq!(mgr.cached_buffers(), 1);

        // A compatible request gets the same underlying block back.
        let bo2 = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        assert_eq!(bo2.va(), va);
        assert_eq!(mgr.cached_buffers(), 0);
    }

    #[test]
    fn test_cache_buckets_never_collapse() {
        let (_dev, mgr) = manager();
        let flags = BoFlags::NO_SUBALLOC | BoFlags::REUSABLE;
        let vram = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::VRAM, flags)
            .unwrap();
        let vram_va = vram.va();
        drop(vram);
        assert_eq!(mgr.cached_buffers(), 1);

        // A GTT-only request must not be served from the cached VRAM
        // buffer.
        let gtt = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        assert_ne!(gtt.va(), vram_va);
    }

    #[test]
    fn test_busy_buffer_not_reclaimed() {
        let (dev, mgr) = manager();
        dev.set_manual_completion(true);
        let flags = BoFlags::NO_SUBALLOC | BoFlags::REUSABLE;
        let bo = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        let va = bo.va();

        // Attach an unsignalled fence, as a flush would.
        let fence =
            crate::sync::SubmitFence::new_pending(dev.clone(), 1, arclight_core::EngineType::Graphics);
        fence.submitted(1, None);
        bo.add_fence(&fence);
        assert!(!bo.can_reclaim());
        drop(bo);
        assert_eq!(mgr.cached_buffers(), 1);

        // The cached entry is still covered by the fence: a fresh block
        // must be handed out instead.
        let bo2 = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        assert_ne!(bo2.va(), va);

        // Once the fence signals, the parked buffer is reusable again.
        dev.complete_up_to(1, arclight_core::EngineType::Graphics, 1);
        drop(bo2);
        let bo3 = mgr
            .create_buffer(ByteSize::from_mib(1), 4096, BoDomain::GTT, flags)
            .unwrap();
        // Either cached block is acceptable; the one covered by the
        // signalled fence is oldest, so it comes back first.
        assert_eq!(bo3.va(), va);
    }

    #[test]
    fn test_slab_consolidation() {
        let (_dev, mgr) = manager();
        // 1000 small buffers land in a handful of slab parents, not 1000
        // kernel allocations.
        let mut bos = Vec::new();
        for _ in 0..1000 {
            bos.push(
                mgr.create_buffer(
                    ByteSize::KIB_4,
                    4096,
                    BoDomain::VRAM,
                    BoFlags::empty(),
                )
                .unwrap(),
            );
        }
        assert!(bos.iter().all(|b| b.is_slab_entry()));
        let parents = mgr.num_live_blocks();
        assert!(parents <= 8, "expected few slab parents, got {parents}");

        // No two live entries overlap.
        let mut ranges: Vec<(u64, u64)> = bos
            .iter()
            .map(|b| (b.va().raw(), b.va().raw() + b.size().as_bytes()))
            .collect();
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "slab entries overlap");
        }

        drop(bos);
        mgr.purge();
        assert_eq!(mgr.slab_count(), 0);
        assert_eq!(mgr.num_live_blocks(), 0);
        assert_eq!(mgr.allocated(BoDomain::VRAM).as_bytes(), 0);
    }

    #[test]
    fn test_wait_fast_path() {
        let (_dev, mgr) = manager();
        let bo = mgr
            .create_buffer(ByteSize::KIB_4, 4096, BoDomain::GTT, BoFlags::empty())
            .unwrap();
        // No active ioctls, no fences: a zero-timeout wait reports idle.
        assert!(bo.wait(0, BoUsage::WRITE));
    }

    #[test]
    fn test_alloc_failure_purges_and_retries() {
        let (dev, mgr) = manager();
        let flags = BoFlags::NO_SUBALLOC | BoFlags::REUSABLE;
        // Park one buffer in the cache so the retry path has something to
        // release.
        drop(
            mgr.create_buffer(ByteSize::from_mib(2), 4096, BoDomain::GTT, flags)
                .unwrap(),
        );
        assert_eq!(mgr.cached_buffers(), 1);

        dev.fail_next_alloc();
        // Different bucket, so the cache cannot satisfy it directly; the
        // first kernel allocation fails, the purge-and-retry succeeds.
        let bo = mgr.create_buffer(
            ByteSize::from_mib(2),
            4096,
            BoDomain::VRAM,
            BoFlags::NO_SUBALLOC,
        );
        assert!(bo.is_ok());
        assert_eq!(mgr.cached_buffers(), 0);
    }

    #[test]
    fn test_export_marks_shared() {
        let (_dev, mgr) = manager();
        let bo = mgr
            .create_buffer(
                ByteSize::from_mib(1),
                4096,
                BoDomain::GTT,
                BoFlags::NO_SUBALLOC,
            )
            .unwrap();
        assert!(!bo.is_shared());
        let external = mgr.export_buffer(&bo, ExportKind::Fd).unwrap();
        assert!(bo.is_shared());

        let imported = mgr.import_buffer(external, ExportKind::Fd).unwrap();
        assert!(imported.is_shared());
        assert_eq!(imported.size(), bo.size());
    }

    #[test]
    fn test_slab_entry_export_uses_parent() {
        let (_dev, mgr) = manager();
        let bo = mgr
            .create_buffer(ByteSize::KIB_4, 4096, BoDomain::GTT, BoFlags::empty())
            .unwrap();
        assert!(bo.is_slab_entry());
        // Export detaches to the parent's real handle.
        let external = mgr.export_buffer(&bo, ExportKind::Fd).unwrap();
        assert_eq!(external, bo.kernel_handle().id());
        assert!(bo.is_shared());
    }

    #[test]
    fn test_user_ptr_buffer() {
        let (_dev, mgr) = manager();
        let mut backing = vec![0u8; 4096];
        let bo = mgr
            .buffer_from_ptr(backing.as_mut_ptr(), ByteSize::KIB_4)
            .unwrap();
        let ptr = bo.map().unwrap();
        assert_eq!(ptr.as_ptr(), backing.as_mut_ptr());
        drop(bo);
    }
}
