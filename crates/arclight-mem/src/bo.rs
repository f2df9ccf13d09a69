//! # Buffer Objects
//!
//! The addressable unit GPU commands reference. A buffer object is either
//! *real* (owns its own [`MemoryBlock`]) or a *slab entry* (a fixed-size
//! slice of a larger real buffer, used for small allocations).
//!
//! Reference counting is shared ownership over [`Bo`] clones; the
//! externally observable pieces of the original lifecycle — the one-way
//! `is_shared` flag, the in-flight ioctl counter, the attached fence list
//! and the cache-return-instead-of-free branch — are modelled explicitly.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arclight_core::driver::{BoDomain, BoFlags, BoUsage, TIMEOUT_INFINITE};
use arclight_core::error::{Error, Result};
use arclight_core::os_time;
use arclight_core::types::{BufferHandle, ByteSize, GpuAddr};

use crate::block::MemoryBlock;
use crate::manager::MemShared;
use crate::slab::SlabRef;
use crate::sync::SubmitFence;

// =============================================================================
// KIND
// =============================================================================

pub(crate) enum BoKind {
    /// Standalone kernel allocation
    Real {
        /// Taken out in drop to be freed or returned to the cache
        block: Option<MemoryBlock>,
        /// Creator asked for reclaim-cache eligibility
        cacheable: bool,
        /// Reclaim cache bucket
        bucket: u32,
    },
    /// Fixed-size slice of a slab parent
    Slab {
        slab: SlabRef,
        index: u16,
        va: GpuAddr,
        map_ptr: Option<NonNull<u8>>,
        parent_handle: BufferHandle,
    },
}

// =============================================================================
// BUFFER OBJECT DATA
// =============================================================================

pub(crate) struct BoData {
    id: u64,
    size: ByteSize,
    alignment: u64,
    domain: BoDomain,
    flags: BoFlags,
    kind: BoKind,
    /// How many reference lists currently hold this buffer
    num_cs_references: AtomicU32,
    /// How many submit ioctls referencing this buffer are in flight
    num_active_ioctls: AtomicU32,
    /// One-way false→true once exported to another process
    is_shared: AtomicBool,
    /// Most recent submissions using this buffer, oldest first
    fences: Mutex<VecDeque<SubmitFence>>,
    mem: Weak<MemShared>,
}

// SAFETY: the slab map pointer aliases the parent block's kernel-pinned
// mapping; concurrent structural state is behind atomics and the fence
// mutex.
unsafe impl Send for BoData {}
unsafe impl Sync for BoData {}

impl Drop for BoData {
    fn drop(&mut self) {
        let fences = std::mem::take(self.fences.get_mut().unwrap());
        match &mut self.kind {
            BoKind::Real {
                block,
                cacheable,
                bucket,
            } => {
                let block = block.take().expect("real bo lost its block");
                if *cacheable && !self.is_shared.load(Ordering::Relaxed) {
                    if let Some(mem) = self.mem.upgrade() {
                        mem.cache.add(*bucket, block, fences);
                        return;
                    }
                }
                drop(block);
            }
            BoKind::Slab { slab, index, .. } => {
                slab.lock().unwrap().release_entry(*index, fences);
            }
        }
    }
}

// =============================================================================
// BUFFER OBJECT HANDLE
// =============================================================================

/// Shared handle to a buffer object
#[derive(Clone)]
pub struct Bo {
    data: Arc<BoData>,
}

impl Bo {
    pub(crate) fn new_real(
        mem: &Arc<MemShared>,
        block: MemoryBlock,
        cacheable: bool,
        bucket: u32,
        flags: BoFlags,
    ) -> Self {
        let data = BoData {
            id: mem.next_id(),
            size: block.size(),
            alignment: block.alignment(),
            domain: block.domain(),
            flags,
            kind: BoKind::Real {
                block: Some(block),
                cacheable,
                bucket,
            },
            num_cs_references: AtomicU32::new(0),
            num_active_ioctls: AtomicU32::new(0),
            is_shared: AtomicBool::new(false),
            fences: Mutex::new(VecDeque::new()),
            mem: Arc::downgrade(mem),
        };
        Self {
            data: Arc::new(data),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_slab_entry(
        mem: &Arc<MemShared>,
        slab: SlabRef,
        index: u16,
        va: GpuAddr,
        map_ptr: Option<NonNull<u8>>,
        parent_handle: BufferHandle,
        entry_size: ByteSize,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Self {
        let data = BoData {
            id: mem.next_id(),
            size: entry_size,
            alignment: entry_size.as_bytes(),
            domain,
            flags,
            kind: BoKind::Slab {
                slab,
                index,
                va,
                map_ptr,
                parent_handle,
            },
            num_cs_references: AtomicU32::new(0),
            num_active_ioctls: AtomicU32::new(0),
            is_shared: AtomicBool::new(false),
            fences: Mutex::new(VecDeque::new()),
            mem: Arc::downgrade(mem),
        };
        Self {
            data: Arc::new(data),
        }
    }

    /// Monotonically increasing unique id
    #[inline]
    pub fn id(&self) -> u64 {
        self.data.id
    }

    /// Buffer size
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.data.size
    }

    /// Alignment
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.data.alignment
    }

    /// Placement domain
    #[inline]
    pub fn domain(&self) -> BoDomain {
        self.data.domain
    }

    /// Creation flags
    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.data.flags
    }

    /// GPU virtual address
    pub fn va(&self) -> GpuAddr {
        match &self.data.kind {
            BoKind::Real { block, .. } => block.as_ref().map(|b| b.va()).unwrap_or_default(),
            BoKind::Slab { va, .. } => *va,
        }
    }

    /// Is this a slab entry rather than a standalone allocation?
    pub fn is_slab_entry(&self) -> bool {
        matches!(self.data.kind, BoKind::Slab { .. })
    }

    /// The kernel handle residency and export operate on. Slab entries
    /// resolve to their parent's real handle.
    pub fn kernel_handle(&self) -> BufferHandle {
        match &self.data.kind {
            BoKind::Real { block, .. } => {
                block.as_ref().map(|b| b.handle()).unwrap_or_else(BufferHandle::null)
            }
            BoKind::Slab { parent_handle, .. } => *parent_handle,
        }
    }

    /// CPU pointer to the buffer contents (unsynchronized)
    pub fn map(&self) -> Result<NonNull<u8>> {
        match &self.data.kind {
            BoKind::Real { block, .. } => block.as_ref().ok_or(Error::MappingFailed)?.map(),
            BoKind::Slab { map_ptr, .. } => map_ptr.ok_or(Error::MappingFailed),
        }
    }

    /// Release a mapping obtained with [`Self::map`].
    ///
    /// Mappings are persistent: the pointer stays valid until the buffer
    /// is destroyed, and the actual kernel unmap happens when the backing
    /// block is released. This exists for interface parity with kernel
    /// interfaces that refcount map/unmap pairs.
    pub fn unmap(&self) {}

    /// Two handles to the same buffer object?
    #[inline]
    pub fn ptr_eq(&self, other: &Bo) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    // -------------------------------------------------------------------------
    // Sharing
    // -------------------------------------------------------------------------

    /// Has this buffer been exported to another process?
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.data.is_shared.load(Ordering::Acquire)
    }

    /// Mark the buffer as shared. One-way transition.
    #[inline]
    pub fn mark_shared(&self) {
        self.data.is_shared.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Submission tracking
    // -------------------------------------------------------------------------

    /// Number of reference lists holding this buffer
    #[inline]
    pub fn cs_ref_count(&self) -> u32 {
        self.data.num_cs_references.load(Ordering::Acquire)
    }

    /// Note that a reference list took hold of this buffer
    pub fn inc_cs_references(&self) {
        self.data.num_cs_references.fetch_add(1, Ordering::AcqRel);
    }

    /// Note that a reference list released this buffer
    pub fn dec_cs_references(&self) {
        let prev = self.data.num_cs_references.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Number of submit ioctls in flight that reference this buffer
    #[inline]
    pub fn active_ioctls(&self) -> u32 {
        self.data.num_active_ioctls.load(Ordering::Acquire)
    }

    /// Mark a submit ioctl referencing this buffer as started
    pub fn inc_active_ioctls(&self) {
        self.data.num_active_ioctls.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a submit ioctl referencing this buffer as finished
    pub fn dec_active_ioctls(&self) {
        let prev = self.data.num_active_ioctls.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Attach the fence of the submission that now uses this buffer.
    /// Signalled fences at the front are pruned opportunistically so the
    /// list stays short for frequently reused buffers.
    pub fn add_fence(&self, fence: &SubmitFence) {
        let mut fences = self.data.fences.lock().unwrap();
        while let Some(front) = fences.front() {
            if front.wait(0, false) {
                fences.pop_front();
            } else {
                break;
            }
        }
        fences.push_back(fence.clone());
    }

    /// Walk the attached fences, calling `f` on each unsignalled one.
    /// Signalled fences are pruned. Used for cross-queue dependency
    /// resolution at flush time.
    pub fn for_each_busy_fence(&self, mut f: impl FnMut(&SubmitFence) -> Result<()>) -> Result<()> {
        let mut fences = self.data.fences.lock().unwrap();
        let mut i = 0;
        while i < fences.len() {
            if fences[i].wait(0, false) {
                let _ = fences.remove(i);
            } else {
                f(&fences[i])?;
                i += 1;
            }
        }
        Ok(())
    }

    /// Can the buffer be recycled right now? True only when no live
    /// reference list holds it and every attached fence has signalled
    /// (checked without blocking).
    pub fn can_reclaim(&self) -> bool {
        if self.cs_ref_count() != 0 {
            return false;
        }
        let mut fences = self.data.fences.lock().unwrap();
        while let Some(front) = fences.front() {
            if front.wait(0, false) {
                fences.pop_front();
            } else {
                return false;
            }
        }
        true
    }

    /// Wait until the GPU is done with this buffer, bounded by
    /// `timeout_ns`. A zero timeout is a pure non-blocking status check.
    ///
    /// The usage parameter exists for interface parity with synchronized
    /// mappings; every attached fence is waited on regardless of
    /// direction.
    pub fn wait(&self, timeout_ns: u64, _usage: BoUsage) -> bool {
        // Shared buffers cannot rely on process-local fences; other
        // processes submit work we never see. Ask the kernel instead.
        if self.is_shared() {
            let driver = match self.data.mem.upgrade() {
                Some(m) => m.driver.clone(),
                None => return true,
            };
            return match driver.wait_buffer_idle(self.kernel_handle(), timeout_ns) {
                Ok(idle) => idle,
                Err(e) => {
                    log::error!("arclight: buffer idle query failed: {e}");
                    false
                }
            };
        }

        // A submission from another thread may still be inside the
        // ioctl; its fence has no sequence number yet.
        if self.active_ioctls() > 0 {
            if timeout_ns == 0 {
                return false;
            }
            if !self.wait_active_ioctls(timeout_ns) {
                return false;
            }
        }

        if timeout_ns == 0 {
            let mut fences = self.data.fences.lock().unwrap();
            while let Some(front) = fences.front() {
                if front.wait(0, false) {
                    fences.pop_front();
                } else {
                    return false;
                }
            }
            return true;
        }

        let deadline = os_time::absolute_timeout(timeout_ns);

        // Take references so waiting happens without the lock held.
        let snapshot: Vec<SubmitFence> = {
            let fences = self.data.fences.lock().unwrap();
            fences.iter().cloned().collect()
        };

        let mut idle = true;
        for fence in &snapshot {
            if !fence.wait(deadline, true) {
                idle = false;
            }
        }

        // Prune what signalled so the next wait amortizes to O(1).
        {
            let mut fences = self.data.fences.lock().unwrap();
            while let Some(front) = fences.front() {
                if front.wait(0, false) {
                    fences.pop_front();
                } else {
                    break;
                }
            }
        }

        idle
    }

    fn wait_active_ioctls(&self, timeout_ns: u64) -> bool {
        let deadline = os_time::absolute_timeout(timeout_ns);
        while self.active_ioctls() > 0 {
            if timeout_ns != TIMEOUT_INFINITE && os_time::expired(deadline) {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    /// Number of fences currently attached (for diagnostics)
    pub fn fence_count(&self) -> usize {
        self.data.fences.lock().unwrap().len()
    }
}

impl core::fmt::Debug for Bo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bo")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("va", &self.va())
            .field("slab_entry", &self.is_slab_entry())
            .finish()
    }
}

static_assertions::assert_impl_all!(Bo: Send, Sync);
