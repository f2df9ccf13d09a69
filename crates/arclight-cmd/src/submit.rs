//! # Submission Context
//!
//! Groups everything needed to post a command stream to the device: the
//! main stream plus optional constant-engine siblings, a double-buffered
//! pair of submission states, a fence per flush and the hand-off to the
//! background worker.
//!
//! The caller only ever writes into the *front* state; a flush finalizes
//! it, swaps it with the quiescent *back* state and hands the old front to
//! the kernel (directly or through the worker) while the caller keeps
//! writing.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arclight_core::driver::{
    BoUsage, BufferListEntry, EngineType, FenceDep, IbFlags, IbInfo, RefPriority, SubmitRequest,
    UserFenceInfo, TIMEOUT_INFINITE,
};
use arclight_core::error::{Error, Result};
use arclight_core::os_time;
use arclight_core::types::ByteSize;
use arclight_mem::{Bo, SubmitFence, UserFenceLoc};

use crate::device::DeviceShared;
use crate::reflist::ReferenceList;
use crate::stream::CommandStream;
use crate::worker::{FlushSlot, SubmitWorker};

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Flush behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        /// Hand the kernel submission to the background worker and
        /// return immediately
        const ASYNC = 1 << 0;
    }
}

/// Which stream of a context an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// The main command stream
    Main,
    /// The constant-engine sibling
    Const,
    /// The constant-engine preamble sibling
    ConstPreamble,
}

/// How long a flush waits for another thread's submission to register
/// its fence before giving up with `Error::Timeout`.
const DEP_HANDOFF_TIMEOUT_NS: u64 = 1_000_000_000;

// =============================================================================
// SUBMISSION STATE
// =============================================================================

/// One of the two interchangeable backing states of a context
pub(crate) struct CsState {
    pub(crate) reflist: ReferenceList,
    pub(crate) ibs: Vec<IbInfo>,
    pub(crate) fence: Option<SubmitFence>,
    pub(crate) deps: Vec<FenceDep>,
}

impl CsState {
    fn new() -> Self {
        Self {
            reflist: ReferenceList::new(),
            ibs: Vec::new(),
            fence: None,
            deps: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.reflist.reset();
        self.ibs.clear();
        self.fence = None;
        self.deps.clear();
    }
}

// =============================================================================
// SUBMIT JOB
// =============================================================================

/// Run one kernel submission from a prepared state. Called on the worker
/// thread for asynchronous flushes and inline otherwise. Returns the
/// reset state for reuse as a future front.
pub(crate) fn submit_job(
    device: &Arc<DeviceShared>,
    ctx_id: u64,
    engine: EngineType,
    user_fence: Option<UserFenceLoc>,
    mut state: CsState,
) -> CsState {
    let fence = state
        .fence
        .clone()
        .expect("submitted state carries a fence");

    // Build the kernel buffer list. Slab entries resolve to their parent
    // handle, so the list is deduplicated again at handle granularity.
    let mut by_handle: BTreeMap<u64, u8> = BTreeMap::new();
    if device.config.all_buffers {
        // Diagnostic mode: make every live buffer resident.
        for handle in device.bufmgr.all_buffer_handles() {
            by_handle.insert(handle.id(), RefPriority::NORMAL.kernel_class());
        }
    } else {
        for e in state.reflist.entries() {
            let h = e.bo.kernel_handle().id();
            let class = by_handle.get(&h).copied().unwrap_or(0);
            by_handle.insert(h, class.max(e.kernel_class));
        }
    }
    let buffers: Vec<BufferListEntry> = by_handle
        .into_iter()
        .map(|(id, priority_class)| BufferListEntry {
            handle: arclight_core::types::BufferHandle::new(id),
            priority_class,
        })
        .collect();

    let user_fence_info = if engine.has_user_fence() {
        user_fence.as_ref().map(|u| UserFenceInfo {
            handle: u.handle(),
            offset: u.offset(),
        })
    } else {
        None
    };

    let request = SubmitRequest {
        ctx_id,
        engine,
        buffers: &buffers,
        ibs: &state.ibs,
        deps: &state.deps,
        user_fence: user_fence_info,
    };

    match device.driver.submit(&request) {
        Ok(seq) => {
            let loc = if engine.has_user_fence() {
                user_fence
            } else {
                None
            };
            fence.submitted(seq, loc);
        }
        Err(Error::SubmissionNoMemory) => {
            log::error!("arclight: not enough memory for command submission");
            fence.signal_error();
        }
        Err(e) => {
            log::error!("arclight: the command stream has been rejected: {e}");
            fence.signal_error();
        }
    }

    for e in state.reflist.entries() {
        e.bo.dec_active_ioctls();
    }
    state.reset();
    state
}

// =============================================================================
// SECONDARY STREAMS
// =============================================================================

/// A standalone stream built outside any context, later spliced into a
/// primary stream together with its references.
pub struct SecondaryStream {
    pub(crate) stream: CommandStream,
    pub(crate) reflist: ReferenceList,
}

impl SecondaryStream {
    /// Ensure room for `dw` more dwords
    pub fn check_space(&mut self, dw: u32) -> bool {
        self.stream.check_space(dw, &mut self.reflist)
    }

    /// Append encoded words
    pub fn emit(&mut self, words: &[u32]) {
        self.stream.emit(words);
    }

    /// Register a buffer
    pub fn register_buffer(
        &mut self,
        bo: &Bo,
        usage: BoUsage,
        priority: RefPriority,
    ) -> Result<usize> {
        self.reflist.add(bo, usage, priority)
    }

    /// Register a buffer and emit its address (or a relocation slot)
    pub fn emit_va(
        &mut self,
        bo: &Bo,
        usage: BoUsage,
        priority: RefPriority,
        delta: u64,
    ) -> Result<usize> {
        self.stream
            .emit_va(&mut self.reflist, bo, usage, priority, delta)
    }

    /// Dwords recorded so far
    pub fn total_dw(&self) -> u32 {
        self.stream.total_dw()
    }
}

// =============================================================================
// SUBMISSION CONTEXT
// =============================================================================

/// A command submission context for one engine
pub struct SubmitContext {
    device: Arc<DeviceShared>,
    ctx_id: u64,
    engine: EngineType,

    main: CommandStream,
    const_stream: Option<CommandStream>,
    preamble_stream: Option<CommandStream>,

    front: CsState,
    spare: Option<CsState>,
    slot: Arc<FlushSlot>,
    worker: Option<SubmitWorker>,

    user_fence: Option<UserFenceLoc>,
    next_fence: Option<SubmitFence>,
    num_flushes: u64,
}

impl SubmitContext {
    pub(crate) fn new(device: Arc<DeviceShared>, engine: EngineType) -> Result<Self> {
        let ctx_id = device.next_ctx_id.fetch_add(1, Ordering::Relaxed);

        // One mapped page per context mirrors completed sequence numbers
        // for ioctl-free polling. It is winsys-internal and never enters
        // a buffer list.
        let user_fence = if engine.has_user_fence() {
            let page = device.bufmgr.create_block(
                ByteSize::from_bytes(device.info.gart_page_size),
                device.info.gart_page_size,
                arclight_core::BoDomain::GTT,
                arclight_core::BoFlags::CPU_ACCESS,
            )?;
            let ptr = page.map()?;
            // SAFETY: freshly allocated page of gart_page_size bytes.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), 0, device.info.gart_page_size as usize)
            };
            Some(UserFenceLoc::new(Arc::new(page), 0))
        } else {
            None
        };

        let main = CommandStream::new(
            device.bufmgr.clone(),
            device.encoder.clone(),
            engine,
            IbFlags::empty(),
            true,
        )?;

        let slot = Arc::new(FlushSlot::new());
        let worker = if device.config.use_worker {
            Some(
                SubmitWorker::spawn(
                    device.clone(),
                    ctx_id,
                    engine,
                    user_fence.clone(),
                    slot.clone(),
                )
                .map_err(|_| Error::OutOfMemory)?,
            )
        } else {
            None
        };

        device.num_contexts.fetch_add(1, Ordering::Relaxed);

        Ok(Self {
            device,
            ctx_id,
            engine,
            main,
            const_stream: None,
            preamble_stream: None,
            front: CsState::new(),
            spare: Some(CsState::new()),
            slot,
            worker,
            user_fence,
            next_fence: None,
            num_flushes: 0,
        })
    }

    /// Context identity (also the kernel fence namespace)
    #[inline]
    pub fn ctx_id(&self) -> u64 {
        self.ctx_id
    }

    /// Engine this context submits to
    #[inline]
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Number of flushes that reached the kernel
    #[inline]
    pub fn num_flushes(&self) -> u64 {
        self.num_flushes
    }

    fn stream_mut(&mut self, kind: StreamKind) -> Result<&mut CommandStream> {
        match kind {
            StreamKind::Main => Ok(&mut self.main),
            StreamKind::Const => self.const_stream.as_mut().ok_or(Error::NotFound),
            StreamKind::ConstPreamble => self.preamble_stream.as_mut().ok_or(Error::NotFound),
        }
    }

    /// Attach the constant-engine sibling stream. Graphics only, once.
    pub fn add_const_stream(&mut self) -> Result<()> {
        if self.engine != EngineType::Graphics || self.const_stream.is_some() {
            return Err(Error::NotSupported);
        }
        self.const_stream = Some(CommandStream::new(
            self.device.bufmgr.clone(),
            self.device.encoder.clone(),
            self.engine,
            IbFlags::CONST,
            true,
        )?);
        Ok(())
    }

    /// Attach the constant-engine preamble sibling. Requires the const
    /// stream.
    pub fn add_const_preamble_stream(&mut self) -> Result<()> {
        if self.const_stream.is_none() || self.preamble_stream.is_some() {
            return Err(Error::NotSupported);
        }
        self.preamble_stream = Some(CommandStream::new(
            self.device.bufmgr.clone(),
            self.device.encoder.clone(),
            self.engine,
            IbFlags::CONST | IbFlags::PREAMBLE,
            true,
        )?);
        Ok(())
    }

    /// Build a standalone secondary stream for later splicing
    pub fn create_secondary_stream(&self) -> Result<SecondaryStream> {
        Ok(SecondaryStream {
            stream: CommandStream::new(
                self.device.bufmgr.clone(),
                self.device.encoder.clone(),
                self.engine,
                IbFlags::empty(),
                false,
            )?,
            reflist: ReferenceList::new(),
        })
    }

    /// Ensure a stream has room for `dw` more dwords. False means the
    /// caller must flush first.
    pub fn check_space(&mut self, kind: StreamKind, dw: u32) -> bool {
        let front = &mut self.front;
        let stream = match kind {
            StreamKind::Main => &mut self.main,
            StreamKind::Const => match self.const_stream.as_mut() {
                Some(s) => s,
                None => return false,
            },
            StreamKind::ConstPreamble => match self.preamble_stream.as_mut() {
                Some(s) => s,
                None => return false,
            },
        };
        stream.check_space(dw, &mut front.reflist)
    }

    /// Append words to a stream. Space must have been reserved.
    pub fn emit(&mut self, kind: StreamKind, words: &[u32]) -> Result<()> {
        self.stream_mut(kind)?.emit(words);
        Ok(())
    }

    /// Register a buffer with the submission's reference list
    pub fn register_buffer(
        &mut self,
        bo: &Bo,
        usage: BoUsage,
        priority: RefPriority,
    ) -> Result<usize> {
        self.front.reflist.add(bo, usage, priority)
    }

    /// Register a buffer and emit its address into a stream
    pub fn emit_va(
        &mut self,
        kind: StreamKind,
        bo: &Bo,
        usage: BoUsage,
        priority: RefPriority,
        delta: u64,
    ) -> Result<usize> {
        let front = &mut self.front;
        let stream = match kind {
            StreamKind::Main => &mut self.main,
            StreamKind::Const => self.const_stream.as_mut().ok_or(Error::NotFound)?,
            StreamKind::ConstPreamble => {
                self.preamble_stream.as_mut().ok_or(Error::NotFound)?
            }
        };
        stream.emit_va(&mut front.reflist, bo, usage, priority, delta)
    }

    /// Splice a secondary stream (words + references) into the main
    /// stream
    pub fn splice(&mut self, secondary: &SecondaryStream) -> Result<()> {
        self.main
            .splice(&secondary.stream, &secondary.reflist, &mut self.front.reflist)
    }

    /// Is a buffer referenced by the not-yet-flushed front state with any
    /// of the given usage bits?
    pub fn is_buffer_referenced(&mut self, bo: &Bo, usage: BoUsage) -> bool {
        match self.front.reflist.lookup(bo) {
            Some(i) => self
                .front
                .reflist
                .get(i)
                .map(|e| e.usage.intersects(usage))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Fence for the *next* flush. Callers holding it before the flush
    /// observe exactly the submission that flush performs.
    pub fn get_next_fence(&mut self) -> SubmitFence {
        self.next_fence
            .get_or_insert_with(|| {
                SubmitFence::new_pending(self.device.driver.clone(), self.ctx_id, self.engine)
            })
            .clone()
    }

    /// Memory pulled in by the front state so far
    pub fn query_memory_usage(&self) -> u64 {
        self.front.reflist.used_vram() + self.front.reflist.used_gtt()
    }

    /// Would `vram`/`gtt` more bytes of references still fit comfortably?
    pub fn memory_below_limit(&self, vram: ByteSize, gtt: ByteSize) -> bool {
        let info = &self.device.info;
        let mut vram = vram.as_bytes() + self.front.reflist.used_vram();
        let mut gtt = gtt.as_bytes() + self.front.reflist.used_gtt();

        // Anything above the VRAM size spills to GTT.
        if vram > info.vram_size.as_bytes() {
            gtt += vram - info.vram_size.as_bytes();
            vram = info.vram_size.as_bytes();
        }
        let _ = vram;
        gtt < info.gtt_size.as_bytes() * 7 / 10
    }

    /// Snapshot of the front reference list (buffer, merged priorities)
    pub fn get_buffer_list(&self) -> Vec<(Bo, u64)> {
        self.front
            .reflist
            .entries()
            .map(|e| (e.bo.clone(), e.priority_usage))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Submit everything written since the last flush.
    ///
    /// Returns the submission's fence, or `None` when there was nothing
    /// to submit (the reference list is reset and no kernel call is
    /// made).
    pub fn flush(&mut self, flags: FlushFlags) -> Result<Option<SubmitFence>> {
        // 1. Pad every stream to its fetch granularity. Constant streams
        //    must never be empty once attached.
        self.main.pad(false);
        if let Some(s) = self.const_stream.as_mut() {
            s.pad(true);
        }
        if let Some(s) = self.preamble_stream.as_mut() {
            s.pad(true);
        }

        // 2. Nothing to do: reset the reference list and the stream
        //    backing, skip the kernel entirely. A fence pre-minted for
        //    this flush covers no work, so it is already complete.
        if self.main.is_empty() || self.device.config.noop_submit {
            if let Some(fence) = self.next_fence.take() {
                fence.signal_retired();
            }
            self.front.reset();
            self.reset_streams()?;
            return Ok(None);
        }

        // 3. Contract check, residency of the stream chunks, relocation
        //    patch-up, finalization.
        self.main.register_chunks(&mut self.front.reflist)?;
        if let Some(s) = self.const_stream.as_ref() {
            s.register_chunks(&mut self.front.reflist)?;
        }
        if let Some(s) = self.preamble_stream.as_ref() {
            s.register_chunks(&mut self.front.reflist)?;
        }

        self.main.apply_relocs(&self.front.reflist);

        let result: Result<()> = (|| {
            self.front.ibs.clear();
            if let Some(s) = self.preamble_stream.as_mut() {
                let ib = s.finalize()?;
                self.front.ibs.push(ib);
            }
            if let Some(s) = self.const_stream.as_mut() {
                let ib = s.finalize()?;
                self.front.ibs.push(ib);
            }
            let ib = self.main.finalize()?;
            self.front.ibs.push(ib);
            Ok(())
        })();
        if let Err(e) = result {
            // The stream is corrupt; drop the work on the floor rather
            // than hand garbage to the hardware.
            self.front.reset();
            self.reset_streams()?;
            return Err(e);
        }

        // 4. Mint (or adopt) the fence for this submission.
        let fence = self.next_fence.take().unwrap_or_else(|| {
            SubmitFence::new_pending(self.device.driver.clone(), self.ctx_id, self.engine)
        });

        // 5. Cross-queue hazards become explicit kernel dependencies;
        //    same-queue ordering is already guaranteed by the kernel.
        let ctx_id = self.ctx_id;
        let engine = self.engine;
        let mut deps: Vec<FenceDep> = Vec::new();
        for e in self.front.reflist.entries() {
            e.bo.for_each_busy_fence(|f| {
                if f.same_queue(ctx_id, engine) {
                    return Ok(());
                }
                // The fence may still be mid-submission on another
                // thread; wait (bounded) for its sequence number.
                if let Some(dep) = f.wait_submitted(DEP_HANDOFF_TIMEOUT_NS)? {
                    if !deps.contains(&dep) {
                        deps.push(dep);
                    }
                }
                Ok(())
            })?;
        }
        self.front.deps = deps;

        // 6. Publish the fence on every referenced buffer and count the
        //    ioctl as in flight before anything can observe it.
        for e in self.front.reflist.entries() {
            e.bo.inc_active_ioctls();
            e.bo.add_fence(&fence);
        }
        self.front.fence = Some(fence.clone());

        // 7. Make sure the previous submission released the other state,
        //    then swap front and back.
        self.sync_flush();
        let back = self
            .spare
            .take()
            .expect("back state missing after sync_flush");
        let submit_state = std::mem::replace(&mut self.front, back);

        self.num_flushes += 1;
        self.device.num_flushes.fetch_add(1, Ordering::Relaxed);

        // 8. Submit: hand off to the worker or run inline.
        if flags.contains(FlushFlags::ASYNC) && self.worker.is_some() {
            self.slot.mark_outstanding();
            self.worker.as_ref().unwrap().enqueue(submit_state);
        } else {
            let state = submit_job(
                &self.device,
                self.ctx_id,
                self.engine,
                self.user_fence.clone(),
                submit_state,
            );
            self.spare = Some(state);
        }

        // 9. Fresh backing so the caller keeps writing immediately.
        self.reset_streams()?;

        Ok(Some(fence))
    }

    fn reset_streams(&mut self) -> Result<()> {
        self.main.reset_for_next()?;
        if let Some(s) = self.const_stream.as_mut() {
            s.reset_for_next()?;
        }
        if let Some(s) = self.preamble_stream.as_mut() {
            s.reset_for_next()?;
        }
        Ok(())
    }

    /// Block until any previously enqueued asynchronous submission has
    /// been picked up and completed by the worker. Safe (a no-op) when no
    /// worker exists.
    pub fn sync_flush(&mut self) {
        if self.worker.is_none() {
            return;
        }
        if let Some(state) = self.slot.wait_and_take() {
            self.spare = Some(state);
        }
    }

    /// Map a buffer with synchronization against this context's pending
    /// and submitted work.
    ///
    /// Mapping for write waits until the GPU is completely done with the
    /// buffer; mapping for read only waits for pending GPU writes. With
    /// `nonblocking`, a busy buffer triggers an asynchronous flush and
    /// reports [`Error::Busy`] instead of waiting.
    pub fn map_buffer(
        &mut self,
        bo: &Bo,
        usage: BoUsage,
        nonblocking: bool,
    ) -> Result<NonNull<u8>> {
        let conflict_usage = if usage.contains(BoUsage::WRITE) {
            BoUsage::RW
        } else {
            BoUsage::WRITE
        };
        let referenced = self.is_buffer_referenced(bo, conflict_usage);

        if nonblocking {
            if referenced {
                self.flush(FlushFlags::ASYNC)?;
                return Err(Error::Busy);
            }
            if !bo.wait(0, usage) {
                return Err(Error::Busy);
            }
        } else {
            if referenced {
                self.flush(FlushFlags::empty())?;
            }
            let start = os_time::now_ns();
            bo.wait(TIMEOUT_INFINITE, usage);
            self.device
                .bufmgr
                .add_buffer_wait_time(os_time::now_ns() - start);
        }

        bo.map()
    }
}

impl Drop for SubmitContext {
    fn drop(&mut self) {
        // Wait out any in-flight submission before tearing the worker
        // down.
        self.sync_flush();
        self.worker.take();
        self.device.num_contexts.fetch_sub(1, Ordering::Relaxed);
    }
}

static_assertions::assert_impl_all!(SubmitContext: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use arclight_core::driver::{BoDomain, BoFlags};
    use arclight_core::soft::SoftDevice;

    fn device_with(config: DeviceConfig) -> (Arc<SoftDevice>, Device) {
        let soft = Arc::new(SoftDevice::new());
        let dev = Device::open(soft.clone(), config).unwrap();
        (soft, dev)
    }

    fn device() -> (Arc<SoftDevice>, Device) {
        device_with(DeviceConfig::default())
    }

    fn data_buffer(dev: &Device) -> Bo {
        dev.buffers()
            .create_buffer(
                ByteSize::KIB_4,
                4096,
                BoDomain::GTT,
                BoFlags::NO_SUBALLOC,
            )
            .unwrap()
    }

    #[test]
    fn test_register_merges_usage() {
        let (_soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);

        let a = ctx
            .register_buffer(&bo, BoUsage::READ, RefPriority::NORMAL)
            .unwrap();
        let b = ctx
            .register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();
        assert_eq!(a, b);
        assert!(ctx.is_buffer_referenced(&bo, BoUsage::READ | BoUsage::WRITE));
        assert_eq!(ctx.get_buffer_list().len(), 1);
    }

    #[test]
    fn test_empty_flush_is_skipped() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);
        ctx.register_buffer(&bo, BoUsage::READ, RefPriority::NORMAL)
            .unwrap();

        let fence = ctx.flush(FlushFlags::empty()).unwrap();
        assert!(fence.is_none());
        assert_eq!(soft.submit_count(), 0);
        // The reference list was reset regardless.
        assert_eq!(bo.cs_ref_count(), 0);
        assert!(!ctx.is_buffer_referenced(&bo, BoUsage::RW));
    }

    #[test]
    fn test_sync_flush_without_worker_is_noop() {
        let (_soft, dev) = device_with(DeviceConfig {
            use_worker: false,
            ..Default::default()
        });
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        ctx.sync_flush();
        ctx.sync_flush();
    }

    #[test]
    fn test_flush_submits_and_signals() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);

        assert!(ctx.check_space(StreamKind::Main, 4));
        ctx.emit(StreamKind::Main, &[1, 2, 3, 4]).unwrap();
        ctx.register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();

        let fence = ctx.flush(FlushFlags::ASYNC).unwrap().unwrap();
        assert!(fence.wait(TIMEOUT_INFINITE, false));
        ctx.sync_flush();

        assert_eq!(soft.submit_count(), 1);
        let subs = soft.submissions();
        assert_eq!(subs.len(), 1);
        // Padded to the fetch granularity.
        assert_eq!(subs[0].ib_words[0].len() % 8, 0);
        assert_eq!(&subs[0].ib_words[0][..4], &[1, 2, 3, 4]);
        // The data buffer and the stream chunk are both resident.
        assert!(subs[0].buffers.contains(&bo.kernel_handle().id()));
        assert_eq!(subs[0].buffers.len(), 2);

        // After completion the buffer is reclaimable again.
        assert_eq!(bo.cs_ref_count(), 0);
        assert_eq!(bo.active_ioctls(), 0);
        assert!(bo.wait(0, BoUsage::RW));
    }

    #[test]
    fn test_next_fence_is_adopted_by_flush() {
        let (_soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();

        let early = ctx.get_next_fence();
        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[0x42]).unwrap();
        let flushed = ctx.flush(FlushFlags::empty()).unwrap().unwrap();

        assert!(early.ptr_eq(&flushed));
        assert!(early.wait(TIMEOUT_INFINITE, false));
        // The pre-minted fence was consumed.
        let next = ctx.get_next_fence();
        assert!(!next.ptr_eq(&early));
    }

    #[test]
    fn test_double_buffer_non_interference() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();

        assert!(ctx.check_space(StreamKind::Main, 2));
        ctx.emit(StreamKind::Main, &[0xAAAA, 0xBBBB]).unwrap();
        ctx.flush(FlushFlags::ASYNC).unwrap().unwrap();

        // Writes made after the flush must never show up in the
        // submitted range.
        assert!(ctx.check_space(StreamKind::Main, 2));
        ctx.emit(StreamKind::Main, &[0xCCCC, 0xDDDD]).unwrap();
        ctx.sync_flush();

        let subs = soft.submissions();
        assert_eq!(subs.len(), 1);
        let words = &subs[0].ib_words[0];
        assert_eq!(&words[..2], &[0xAAAA, 0xBBBB]);
        assert!(!words.contains(&0xCCCC));
        assert!(!words.contains(&0xDDDD));

        // The second batch goes out in its own submission.
        ctx.flush(FlushFlags::empty()).unwrap().unwrap();
        let subs = soft.submissions();
        assert_eq!(subs.len(), 2);
        assert_eq!(&subs[1].ib_words[0][..2], &[0xCCCC, 0xDDDD]);
    }

    #[test]
    fn test_flushes_are_ordered_per_context() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        for i in 0..8u32 {
            assert!(ctx.check_space(StreamKind::Main, 1));
            ctx.emit(StreamKind::Main, &[i]).unwrap();
            ctx.flush(FlushFlags::ASYNC).unwrap().unwrap();
        }
        ctx.sync_flush();
        let subs = soft.submissions();
        assert_eq!(subs.len(), 8);
        for (i, s) in subs.iter().enumerate() {
            assert_eq!(s.seq, i as u64 + 1);
            assert_eq!(s.ib_words[0][0], i as u32);
        }
    }

    #[test]
    fn test_cross_context_dependency() {
        let (soft, dev) = device();
        soft.set_manual_completion(true);
        let mut gfx = dev.create_context(EngineType::Graphics).unwrap();
        let mut dma = dev.create_context(EngineType::Dma).unwrap();
        let bo = data_buffer(&dev);

        assert!(gfx.check_space(StreamKind::Main, 1));
        gfx.emit(StreamKind::Main, &[1]).unwrap();
        gfx.register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();
        let gfx_fence = gfx.flush(FlushFlags::empty()).unwrap().unwrap();

        // The DMA submission touching the same buffer must carry an
        // explicit dependency on the graphics fence.
        assert!(dma.check_space(StreamKind::Main, 1));
        dma.emit(StreamKind::Main, &[2]).unwrap();
        dma.register_buffer(&bo, BoUsage::READ, RefPriority::NORMAL)
            .unwrap();
        dma.flush(FlushFlags::empty()).unwrap().unwrap();

        let subs = soft.submissions();
        assert_eq!(subs.len(), 2);
        let dep = subs[1].deps.iter().find(|d| d.engine == EngineType::Graphics);
        let dep = dep.expect("missing cross-context dependency");
        assert_eq!(dep.ctx_id, gfx.ctx_id());
        assert_eq!(dep.seq, 1);

        // Same-queue reuse adds no self-dependency.
        soft.complete_all();
        assert!(gfx_fence.wait(TIMEOUT_INFINITE, false));
        assert!(gfx.check_space(StreamKind::Main, 1));
        gfx.emit(StreamKind::Main, &[3]).unwrap();
        gfx.register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();
        gfx.flush(FlushFlags::empty()).unwrap().unwrap();
        let subs = soft.submissions();
        assert!(subs[2].deps.is_empty());
    }

    #[test]
    fn test_failed_submission_signals_fence() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        soft.fail_next_submit();

        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[9]).unwrap();
        let fence = ctx.flush(FlushFlags::ASYNC).unwrap().unwrap();

        // No waiter blocks on a rejected submission.
        assert!(fence.wait(TIMEOUT_INFINITE, false));
        ctx.sync_flush();
    }

    #[test]
    fn test_stream_overflow_is_loud() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Dma).unwrap();
        // Write past the budget without reserving: contract violation.
        let budget = {
            assert!(ctx.check_space(StreamKind::Main, 1));
            ctx.main.max_dw()
        };
        for i in 0..budget + 1 {
            // Push through the raw stream to bypass check_space.
            ctx.main.push(i);
        }
        assert_eq!(
            ctx.flush(FlushFlags::empty()).unwrap_err(),
            Error::StreamOverflow
        );
        assert_eq!(soft.submit_count(), 0);
        // The context recovered into a writable state.
        assert!(ctx.check_space(StreamKind::Main, 4));
        ctx.emit(StreamKind::Main, &[1, 2, 3, 4]).unwrap();
        assert!(ctx.flush(FlushFlags::empty()).unwrap().is_some());
    }

    #[test]
    fn test_const_siblings_flush_together() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        ctx.add_const_stream().unwrap();
        ctx.add_const_preamble_stream().unwrap();

        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[1]).unwrap();
        assert!(ctx.check_space(StreamKind::Const, 1));
        ctx.emit(StreamKind::Const, &[2]).unwrap();

        ctx.flush(FlushFlags::empty()).unwrap().unwrap();
        let subs = soft.submissions();
        // Preamble, const, then main: three hardware-visible IBs in one
        // submission.
        assert_eq!(subs[0].ib_words.len(), 3);
        // The empty preamble was force-padded to a full fetch group.
        assert_eq!(subs[0].ib_words[0].len(), 8);
        assert_eq!(subs[0].ib_words[1][0], 2);
        assert_eq!(subs[0].ib_words[2][0], 1);
    }

    #[test]
    fn test_const_stream_only_on_graphics() {
        let (_soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Compute).unwrap();
        assert_eq!(ctx.add_const_stream().unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn test_secondary_splice_end_to_end() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);

        let mut sec = ctx.create_secondary_stream().unwrap();
        assert!(sec.check_space(2));
        sec.emit(&[0x51, 0x52]);
        sec.register_buffer(&bo, BoUsage::READ, RefPriority::NORMAL)
            .unwrap();

        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[0x11]).unwrap();
        ctx.splice(&sec).unwrap();

        ctx.flush(FlushFlags::empty()).unwrap().unwrap();
        let subs = soft.submissions();
        assert_eq!(&subs[0].ib_words[0][..3], &[0x11, 0x51, 0x52]);
        assert!(subs[0].buffers.contains(&bo.kernel_handle().id()));
    }

    #[test]
    fn test_submit_all_buffers_mode() {
        let (soft, dev) = device_with(DeviceConfig {
            all_buffers: true,
            ..Default::default()
        });
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        // Live but unreferenced by the stream.
        let stranger = data_buffer(&dev);

        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[1]).unwrap();
        ctx.flush(FlushFlags::empty()).unwrap().unwrap();

        let subs = soft.submissions();
        assert!(subs[0].buffers.contains(&stranger.kernel_handle().id()));
    }

    #[test]
    fn test_noop_mode_skips_kernel() {
        let (soft, dev) = device_with(DeviceConfig {
            noop_submit: true,
            ..Default::default()
        });
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        assert!(ctx.check_space(StreamKind::Main, 4));
        ctx.emit(StreamKind::Main, &[1, 2, 3, 4]).unwrap();
        assert!(ctx.flush(FlushFlags::empty()).unwrap().is_none());
        assert_eq!(soft.submit_count(), 0);
    }

    #[test]
    fn test_map_buffer_flushes_referencing_stream() {
        let (soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);

        assert!(ctx.check_space(StreamKind::Main, 1));
        ctx.emit(StreamKind::Main, &[1]).unwrap();
        ctx.register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();

        // Mapping for read while the un-flushed stream writes the buffer
        // forces the flush.
        let ptr = ctx.map_buffer(&bo, BoUsage::READ, false).unwrap();
        assert!(!ptr.as_ptr().is_null());
        ctx.sync_flush();
        assert_eq!(soft.submit_count(), 1);
    }

    #[test]
    fn test_wait_buffer_unflushed_reference_fast_path() {
        let (_soft, dev) = device();
        let mut ctx = dev.create_context(EngineType::Graphics).unwrap();
        let bo = data_buffer(&dev);
        ctx.register_buffer(&bo, BoUsage::WRITE, RefPriority::NORMAL)
            .unwrap();

        // Referenced by an un-flushed stream only: no ioctls in flight,
        // no fences, so a zero-timeout wait reports idle.
        assert!(bo.wait(0, BoUsage::WRITE));
    }
}
