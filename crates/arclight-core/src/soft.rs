//! # Software Device
//!
//! A pure host-memory implementation of [`DeviceDriver`]: the analogue of a
//! no-op winsys. Buffers live in process memory, virtual addresses come
//! from a bump allocator, and submissions complete either immediately or
//! under manual control.
//!
//! Used by the unit tests of every winsys crate and by bring-up tooling;
//! it additionally records each submission (buffer list, dependencies and
//! the words of every indirect buffer) so tests can inspect exactly what
//! would have reached the kernel.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::driver::*;
use crate::error::{Error, Result};
use crate::os_time;
use crate::types::*;

// =============================================================================
// INTERNAL STATE
// =============================================================================

struct SoftAlloc {
    ptr: *mut u8,
    layout: Option<Layout>,
    size: u64,
    alignment: u64,
    domain: BoDomain,
    /// Kernel handles are per-process references; imports bump this and
    /// each free drops one.
    refs: u32,
}

// SAFETY: the pointer refers to a heap allocation owned by this entry (or
// caller-owned user memory per the alloc_from_ptr contract); the surrounding
// mutex serializes all structural access.
unsafe impl Send for SoftAlloc {}

struct QueueState {
    next_seq: u64,
    completed: u64,
}

/// A recorded submission, exposed to tests
#[derive(Debug, Clone)]
pub struct SoftSubmission {
    /// Submission context id
    pub ctx_id: u64,
    /// Target engine
    pub engine: EngineType,
    /// Assigned sequence number
    pub seq: u64,
    /// Kernel handles of the buffer list
    pub buffers: Vec<u64>,
    /// Wait dependencies
    pub deps: Vec<FenceDep>,
    /// Snapshot of each indirect buffer's first-chunk words
    pub ib_words: Vec<Vec<u32>>,
    user_fence: Option<(u64, u64)>,
}

struct SoftState {
    next_handle: u64,
    next_va: u64,
    next_range: u64,
    allocations: HashMap<u64, SoftAlloc>,
    ranges: HashMap<u64, (u64, u64)>,
    bindings: BTreeMap<u64, (u64, u64)>,
    queues: HashMap<(u64, EngineType), QueueState>,
    submissions: Vec<SoftSubmission>,
    exports: HashMap<u64, u64>,
}

impl SoftState {
    fn alloc_for_va(&self, va: u64) -> Option<(u64, &SoftAlloc, u64)> {
        let (&start, &(handle, bound_size)) = self.bindings.range(..=va).next_back()?;
        if va >= start + bound_size {
            return None;
        }
        let a = self.allocations.get(&handle)?;
        Some((handle, a, va - start))
    }

    fn seq_completed(&self, dep: FenceDep) -> bool {
        self.queues
            .get(&(dep.ctx_id, dep.engine))
            .is_some_and(|q| q.completed >= dep.seq)
    }

    fn complete_locked(&mut self, ctx_id: u64, engine: EngineType, seq: u64) {
        let q = self
            .queues
            .entry((ctx_id, engine))
            .or_insert(QueueState {
                next_seq: 1,
                completed: 0,
            });
        if seq <= q.completed {
            return;
        }
        q.completed = seq;
        if q.next_seq <= seq {
            q.next_seq = seq + 1;
        }

        // Mirror the completed value into every user fence covered by it.
        let writes: Vec<(u64, u64, u64)> = self
            .submissions
            .iter()
            .filter(|s| s.ctx_id == ctx_id && s.engine == engine && s.seq <= seq)
            .filter_map(|s| s.user_fence.map(|(h, off)| (h, off, s.seq)))
            .collect();
        for (handle, offset, value) in writes {
            if let Some(a) = self.allocations.get(&handle) {
                debug_assert!(offset + 8 <= a.size);
                // SAFETY: offset checked against the allocation size.
                unsafe {
                    (a.ptr.add(offset as usize) as *mut u64).write_volatile(value);
                }
            }
        }
    }
}

// =============================================================================
// SOFT DEVICE
// =============================================================================

/// Host-memory [`DeviceDriver`] implementation
pub struct SoftDevice {
    token: u64,
    info: DeviceInfo,
    state: Mutex<SoftState>,
    manual_completion: AtomicBool,
    fail_next_alloc: AtomicBool,
    fail_next_submit: AtomicBool,
    num_allocs: AtomicU64,
    num_frees: AtomicU64,
    num_submits: AtomicU64,
    num_fence_queries: AtomicU64,
    num_idle_queries: AtomicU64,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl SoftDevice {
    /// Create a software device with default info
    pub fn new() -> Self {
        Self::with_info(DeviceInfo::default())
    }

    /// Create a software device reporting the given info
    pub fn with_info(info: DeviceInfo) -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            info,
            state: Mutex::new(SoftState {
                next_handle: 1,
                next_va: 0x10_0000,
                next_range: 1,
                allocations: HashMap::new(),
                ranges: HashMap::new(),
                bindings: BTreeMap::new(),
                queues: HashMap::new(),
                submissions: Vec::new(),
                exports: HashMap::new(),
            }),
            manual_completion: AtomicBool::new(false),
            fail_next_alloc: AtomicBool::new(false),
            fail_next_submit: AtomicBool::new(false),
            num_allocs: AtomicU64::new(0),
            num_frees: AtomicU64::new(0),
            num_submits: AtomicU64::new(0),
            num_fence_queries: AtomicU64::new(0),
            num_idle_queries: AtomicU64::new(0),
        }
    }

    /// Switch to manual completion: submissions stay busy until
    /// [`Self::complete_up_to`] or [`Self::complete_all`] is called.
    pub fn set_manual_completion(&self, manual: bool) {
        self.manual_completion.store(manual, Ordering::Relaxed);
    }

    /// Retire all work up to `seq` on one queue
    pub fn complete_up_to(&self, ctx_id: u64, engine: EngineType, seq: u64) {
        let mut st = self.state.lock().unwrap();
        st.complete_locked(ctx_id, engine, seq);
    }

    /// Retire all outstanding work on every queue
    pub fn complete_all(&self) {
        let mut st = self.state.lock().unwrap();
        let targets: Vec<(u64, EngineType, u64)> = st
            .queues
            .iter()
            .map(|(&(ctx, eng), q)| (ctx, eng, q.next_seq.saturating_sub(1)))
            .collect();
        for (ctx, eng, seq) in targets {
            st.complete_locked(ctx, eng, seq);
        }
    }

    /// Make the next `alloc` call fail
    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::Relaxed);
    }

    /// Make the next `submit` call fail
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::Relaxed);
    }

    /// Snapshot of all recorded submissions
    pub fn submissions(&self) -> Vec<SoftSubmission> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Number of submit calls that reached the device
    pub fn submit_count(&self) -> u64 {
        self.num_submits.load(Ordering::Relaxed)
    }

    /// Number of kernel fence queries issued
    pub fn fence_query_count(&self) -> u64 {
        self.num_fence_queries.load(Ordering::Relaxed)
    }

    /// Number of cross-process idle queries issued
    pub fn idle_query_count(&self) -> u64 {
        self.num_idle_queries.load(Ordering::Relaxed)
    }

    /// Number of live kernel allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    fn handle_busy(&self, st: &SoftState, handle: u64) -> bool {
        st.submissions.iter().any(|s| {
            s.buffers.contains(&handle)
                && !st.seq_completed(FenceDep {
                    ctx_id: s.ctx_id,
                    engine: s.engine,
                    seq: s.seq,
                })
        })
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap();
        for (_, a) in st.allocations.drain() {
            if let Some(layout) = a.layout {
                // SAFETY: allocated with the same layout in alloc().
                unsafe { dealloc(a.ptr, layout) };
            }
        }
    }
}

impl DeviceDriver for SoftDevice {
    fn device_token(&self) -> u64 {
        self.token
    }

    fn query_info(&self) -> Result<DeviceInfo> {
        Ok(self.info.clone())
    }

    fn alloc(
        &self,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        _flags: BoFlags,
    ) -> Result<BufferHandle> {
        if self.fail_next_alloc.swap(false, Ordering::Relaxed) {
            return Err(Error::AllocationFailed);
        }
        if size.as_bytes() == 0 || domain.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let align = alignment.max(8).next_power_of_two() as usize;
        let layout = Layout::from_size_align(size.as_bytes() as usize, align)
            .map_err(|_| Error::InvalidParameter)?;
        // SAFETY: layout has non-zero size (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }

        let mut st = self.state.lock().unwrap();
        let id = st.next_handle;
        st.next_handle += 1;
        st.allocations.insert(
            id,
            SoftAlloc {
                ptr,
                layout: Some(layout),
                size: size.as_bytes(),
                alignment,
                domain,
                refs: 1,
            },
        );
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(BufferHandle::new(id))
    }

    fn alloc_from_ptr(&self, ptr: *mut u8, size: ByteSize) -> Result<BufferHandle> {
        if ptr.is_null() || size.as_bytes() == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut st = self.state.lock().unwrap();
        let id = st.next_handle;
        st.next_handle += 1;
        st.allocations.insert(
            id,
            SoftAlloc {
                ptr,
                layout: None,
                size: size.as_bytes(),
                alignment: 1,
                domain: BoDomain::GTT,
                refs: 1,
            },
        );
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(BufferHandle::new(id))
    }

    fn free(&self, handle: BufferHandle) {
        let mut st = self.state.lock().unwrap();
        if let Some(a) = st.allocations.get_mut(&handle.id()) {
            a.refs -= 1;
            if a.refs > 0 {
                return;
            }
            let a = st.allocations.remove(&handle.id()).unwrap();
            if let Some(layout) = a.layout {
                // SAFETY: allocated with the same layout in alloc().
                unsafe { dealloc(a.ptr, layout) };
            }
            self.num_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn map(&self, handle: BufferHandle) -> Result<*mut u8> {
        let st = self.state.lock().unwrap();
        st.allocations
            .get(&handle.id())
            .map(|a| a.ptr)
            .ok_or(Error::InvalidHandle)
    }

    fn unmap(&self, _handle: BufferHandle) {}

    fn reserve_va(&self, size: ByteSize, alignment: u64) -> Result<(GpuAddr, VaRangeHandle)> {
        let mut st = self.state.lock().unwrap();
        let align = alignment.max(4096);
        let va = (st.next_va + align - 1) & !(align - 1);
        st.next_va = va + size.as_bytes();
        let id = st.next_range;
        st.next_range += 1;
        st.ranges.insert(id, (va, size.as_bytes()));
        Ok((GpuAddr::new(va), VaRangeHandle::new(id)))
    }

    fn release_va(&self, range: VaRangeHandle) {
        self.state.lock().unwrap().ranges.remove(&range.id());
    }

    fn bind_va(&self, handle: BufferHandle, va: GpuAddr, size: ByteSize) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if !st.allocations.contains_key(&handle.id()) {
            return Err(Error::InvalidHandle);
        }
        st.bindings
            .insert(va.raw(), (handle.id(), size.as_bytes()));
        Ok(())
    }

    fn unbind_va(&self, _handle: BufferHandle, va: GpuAddr, _size: ByteSize) {
        self.state.lock().unwrap().bindings.remove(&va.raw());
    }

    fn export(&self, handle: BufferHandle, _kind: ExportKind) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        if !st.allocations.contains_key(&handle.id()) {
            return Err(Error::InvalidHandle);
        }
        let external = handle.id();
        st.exports.insert(external, handle.id());
        Ok(external)
    }

    fn import(&self, external: u64, _kind: ExportKind) -> Result<ImportedBuffer> {
        let mut st = self.state.lock().unwrap();
        let &handle = st.exports.get(&external).ok_or(Error::NotFound)?;
        let a = st.allocations.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        a.refs += 1;
        Ok(ImportedBuffer {
            handle: BufferHandle::new(handle),
            size: ByteSize::from_bytes(a.size),
            alignment: a.alignment,
            domain: a.domain,
        })
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<u64> {
        self.num_submits.fetch_add(1, Ordering::Relaxed);
        if self.fail_next_submit.swap(false, Ordering::Relaxed) {
            return Err(Error::SubmissionFailed);
        }
        if request.ibs.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let mut st = self.state.lock().unwrap();

        // Validate the buffer list before accepting anything.
        for b in request.buffers {
            if !st.allocations.contains_key(&b.handle.id()) {
                return Err(Error::BufferListFailed);
            }
        }

        // Snapshot the words of every IB's first chunk.
        let mut ib_words = Vec::with_capacity(request.ibs.len());
        for ib in request.ibs {
            let Some((_, a, off)) = st.alloc_for_va(ib.va.raw()) else {
                log::warn!("soft device: IB address {} is not bound", ib.va);
                return Err(Error::SubmissionFailed);
            };
            let bytes = ib.size_dw as u64 * 4;
            if off + bytes > a.size {
                log::warn!("soft device: IB range escapes its buffer");
                return Err(Error::SubmissionFailed);
            }
            let mut words = vec![0u32; ib.size_dw as usize];
            // SAFETY: range checked against the allocation above.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    a.ptr.add(off as usize) as *const u32,
                    words.as_mut_ptr(),
                    ib.size_dw as usize,
                );
            }
            ib_words.push(words);
        }

        let key = (request.ctx_id, request.engine);
        let q = st.queues.entry(key).or_insert(QueueState {
            next_seq: 1,
            completed: 0,
        });
        let seq = q.next_seq;
        q.next_seq += 1;

        st.submissions.push(SoftSubmission {
            ctx_id: request.ctx_id,
            engine: request.engine,
            seq,
            buffers: request.buffers.iter().map(|b| b.handle.id()).collect(),
            deps: request.deps.to_vec(),
            ib_words,
            user_fence: request.user_fence.map(|u| (u.handle.id(), u.offset)),
        });

        if !self.manual_completion.load(Ordering::Relaxed) {
            st.complete_locked(request.ctx_id, request.engine, seq);
        }
        Ok(seq)
    }

    fn query_fence(&self, dep: FenceDep, timeout_ns: u64, absolute: bool) -> Result<bool> {
        self.num_fence_queries.fetch_add(1, Ordering::Relaxed);
        let deadline = if absolute {
            timeout_ns
        } else {
            os_time::absolute_timeout(timeout_ns)
        };
        loop {
            if self.state.lock().unwrap().seq_completed(dep) {
                return Ok(true);
            }
            if os_time::expired(deadline) || timeout_ns == 0 {
                return Ok(false);
            }
            std::thread::yield_now();
        }
    }

    fn wait_buffer_idle(&self, handle: BufferHandle, timeout_ns: u64) -> Result<bool> {
        self.num_idle_queries.fetch_add(1, Ordering::Relaxed);
        let deadline = os_time::absolute_timeout(timeout_ns);
        loop {
            {
                let st = self.state.lock().unwrap();
                if !self.handle_busy(&st, handle.id()) {
                    return Ok(true);
                }
            }
            if os_time::expired(deadline) || timeout_ns == 0 {
                return Ok(false);
            }
            std::thread::yield_now();
        }
    }

    fn query_heap_usage(&self, domain: BoDomain) -> Result<ByteSize> {
        let st = self.state.lock().unwrap();
        let total = st
            .allocations
            .values()
            .filter(|a| a.domain.intersects(domain))
            .map(|a| a.size)
            .sum();
        Ok(ByteSize::from_bytes(total))
    }
}
