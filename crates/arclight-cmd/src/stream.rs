//! # Command Stream
//!
//! A cursor over one or more chained chunks of GPU-visible memory into
//! which encoded command words are written.
//!
//! Chunks are reclaim-cached buffers; when the current chunk runs out of
//! room and the engine supports it, a jump packet chains execution to a
//! freshly allocated continuation. Capacity always reserves space for the
//! worst-case padding plus the jump, so the chain path never needs a
//! second space check.
//!
//! Backing sizes follow the stream's lifetime maximum: every space check
//! raises the estimate, every finalization decays it by 1/32 so a one-time
//! spike does not pin large buffers forever.

use std::ptr::NonNull;
use std::sync::Arc;

use arclight_core::driver::{BoDomain, BoFlags, BoUsage, EngineType, IbFlags, IbInfo, RefPriority};
use arclight_core::encode::{CommandEncoder, CHAIN_LEN_DW};
use arclight_core::error::{Error, Result};
use arclight_core::types::{ByteSize, GpuAddr};
use arclight_mem::{Bo, BufferManager};

use crate::reflist::ReferenceList;

// =============================================================================
// SIZING
// =============================================================================

/// Smallest chunk allocated for a stream, in dwords (16 KiB)
const MIN_CHUNK_DW: u32 = 4 * 1024;

/// Flags for stream backing buffers: CPU-written, streaming, standalone,
/// recycled through the reclaim cache between submissions.
const CHUNK_FLAGS: BoFlags = BoFlags::CPU_ACCESS
    .union(BoFlags::GTT_WC)
    .union(BoFlags::NO_SUBALLOC)
    .union(BoFlags::REUSABLE);

// =============================================================================
// CHUNKS
// =============================================================================

struct Chunk {
    bo: Bo,
    ptr: NonNull<u32>,
    va: GpuAddr,
    /// Final dword count (closed chunks) or write cursor (current chunk)
    cdw: u32,
}

struct CurrentChunk {
    chunk: Chunk,
    /// Writer budget; excludes the padding + jump epilogue
    max_dw: u32,
    /// Real buffer capacity in dwords
    capacity_dw: u32,
}

// =============================================================================
// COMMAND STREAM
// =============================================================================

/// A growable, possibly chained stream of encoded command words
pub struct CommandStream {
    engine: EngineType,
    encoder: Arc<dyn CommandEncoder>,
    mem: BufferManager,
    ib_flags: IbFlags,
    has_chaining: bool,
    max_submit_dw: u32,
    has_virtual_memory: bool,

    current: CurrentChunk,
    /// Closed chunks in chain order
    prev: Vec<Chunk>,
    /// Total dwords in closed chunks
    prev_dw: u32,
    /// Chain-size slot in the last closed chunk, patched when the chunk
    /// it jumps to closes
    pending_size_patch: Option<NonNull<u32>>,

    /// Lifetime maximum of the logical stream size, in dwords
    max_size_dw: u32,
    /// Largest single space request ever seen
    max_check_space_dw: u32,
}

// SAFETY: chunk pointers alias kernel-pinned mappings owned by the chunk
// buffer objects held in `prev`/`current`; the stream is externally
// synchronized (single writer).
unsafe impl Send for CommandStream {}

impl CommandStream {
    /// Create a stream and allocate its first chunk
    pub(crate) fn new(
        mem: BufferManager,
        encoder: Arc<dyn CommandEncoder>,
        engine: EngineType,
        ib_flags: IbFlags,
        allow_chaining: bool,
    ) -> Result<Self> {
        let info = mem.info();
        let has_chaining =
            allow_chaining && engine.supports_chaining() && info.generation.has_ib_chaining();
        let max_submit_dw = info.max_submit_dw;
        let has_virtual_memory = info.has_virtual_memory;

        let current = Self::alloc_chunk(
            &mem,
            engine,
            has_chaining,
            max_submit_dw,
            MIN_CHUNK_DW,
            MIN_CHUNK_DW,
        )?;
        Ok(Self {
            engine,
            encoder,
            mem,
            ib_flags,
            has_chaining,
            max_submit_dw,
            has_virtual_memory,
            current,
            prev: Vec::new(),
            prev_dw: 0,
            pending_size_patch: None,
            max_size_dw: MIN_CHUNK_DW,
            max_check_space_dw: 0,
        })
    }

    /// Engine this stream targets
    #[inline]
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Per-submission IB flags
    #[inline]
    pub fn ib_flags(&self) -> IbFlags {
        self.ib_flags
    }

    /// Dwords written into the current chunk
    #[inline]
    pub fn cdw(&self) -> u32 {
        self.current.chunk.cdw
    }

    /// Writer budget of the current chunk
    #[inline]
    pub fn max_dw(&self) -> u32 {
        self.current.max_dw
    }

    /// Dwords written across all chunks
    #[inline]
    pub fn total_dw(&self) -> u32 {
        self.prev_dw + self.current.chunk.cdw
    }

    /// Nothing written since the last reset?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_dw() == 0
    }

    /// Number of chunks (closed + current)
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.prev.len() + 1
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Append one dword. Space must have been reserved via
    /// [`Self::check_space`].
    #[inline]
    pub fn push(&mut self, word: u32) {
        let cur = &mut self.current;
        // Writing past the buffer would hand garbage to the fetcher.
        assert!(
            cur.chunk.cdw < cur.capacity_dw,
            "command stream wrote past its reserved capacity"
        );
        // SAFETY: cdw < capacity_dw, checked above; the mapping is
        // pinned for the chunk's lifetime.
        unsafe {
            cur.chunk
                .ptr
                .as_ptr()
                .add(cur.chunk.cdw as usize)
                .write(word);
        }
        cur.chunk.cdw += 1;
    }

    /// Append a slice of dwords
    pub fn emit(&mut self, words: &[u32]) {
        for &w in words {
            self.push(w);
        }
    }

    /// Register a buffer and emit its 64-bit address, recording a
    /// relocation slot when the device lacks virtual addressing.
    pub fn emit_va(
        &mut self,
        reflist: &mut ReferenceList,
        bo: &Bo,
        usage: BoUsage,
        priority: RefPriority,
        delta: u64,
    ) -> Result<usize> {
        let index = reflist.add(bo, usage, priority)?;
        if self.has_virtual_memory {
            let va = bo.va().offset(delta);
            self.push(va.raw() as u32);
            self.push((va.raw() >> 32) as u32);
        } else {
            reflist.add_reloc(self.total_dw(), index, delta);
            self.push(0);
            self.push(0);
        }
        Ok(index)
    }

    // -------------------------------------------------------------------------
    // Space management
    // -------------------------------------------------------------------------

    /// Ensure room for `dw` more dwords, chaining to a new chunk when
    /// needed and possible. Returns false when the stream cannot grow
    /// (engine cannot chain, or the continuation could not be allocated);
    /// the caller must flush instead.
    pub fn check_space(&mut self, dw: u32, reflist: &mut ReferenceList) -> bool {
        self.max_check_space_dw = self.max_check_space_dw.max(dw);
        self.max_size_dw = self.max_size_dw.max(self.total_dw() + dw);

        if self.current.chunk.cdw + dw <= self.current.max_dw {
            return true;
        }

        if !self.has_chaining {
            return false;
        }
        if dw > self.max_submit_dw - Self::epilogue_dw(self.engine, true) {
            return false;
        }

        let new = match self.acquire_chunk(dw) {
            Ok(c) => c,
            Err(e) => {
                log::error!("arclight: failed to allocate a stream continuation: {e}");
                return false;
            }
        };

        // The continuation must be resident for the fetcher to follow
        // the jump.
        if reflist
            .add(&new.chunk.bo, BoUsage::READ, RefPriority::IB)
            .is_err()
        {
            return false;
        }

        self.chain_to(new);
        true
    }

    /// Close the current chunk with a jump to `new` and make `new`
    /// current.
    fn chain_to(&mut self, new: CurrentChunk) {
        let gran = self.engine.pad_granularity_dw();
        let nop = self.encoder.nop_word(self.engine);

        // Pad so the jump packet ends exactly on the fetch granularity.
        let target = (gran - CHAIN_LEN_DW % gran) % gran;
        while self.current.chunk.cdw % gran != target {
            self.push(nop);
        }

        let mut words = [0u32; CHAIN_LEN_DW as usize];
        let slot = self.encoder.encode_chain(new.chunk.va, &mut words);
        let slot_index = self.current.chunk.cdw + slot as u32;
        self.emit(&words);

        // This chunk is final now: patch its dword count into the jump
        // that leads here.
        let closed_cdw = self.current.chunk.cdw;
        self.patch_pending_size(closed_cdw);

        // SAFETY: slot_index < capacity_dw (the epilogue reservation);
        // the chunk's mapping lives on in `prev`.
        let patch_ptr = unsafe {
            NonNull::new_unchecked(self.current.chunk.ptr.as_ptr().add(slot_index as usize))
        };
        self.pending_size_patch = Some(patch_ptr);

        let closed = std::mem::replace(&mut self.current, new);
        self.prev_dw += closed.chunk.cdw;
        self.prev.push(closed.chunk);
    }

    fn patch_pending_size(&mut self, size_dw: u32) {
        if let Some(ptr) = self.pending_size_patch.take() {
            // SAFETY: the pointer targets the chain packet of a closed
            // chunk whose buffer is held in `prev`.
            let slot = unsafe { &mut *ptr.as_ptr() };
            self.encoder.patch_chain_size(slot, size_dw);
        }
    }

    fn epilogue_dw(engine: EngineType, chaining: bool) -> u32 {
        let pad = engine.pad_granularity_dw() - 1;
        if chaining {
            pad + CHAIN_LEN_DW
        } else {
            pad
        }
    }

    fn acquire_chunk(&self, needed_dw: u32) -> Result<CurrentChunk> {
        // Always leave room for the biggest space request ever seen;
        // the very next call may be exactly that size.
        Self::alloc_chunk(
            &self.mem,
            self.engine,
            self.has_chaining,
            self.max_submit_dw,
            self.max_size_dw,
            needed_dw.max(self.max_check_space_dw),
        )
    }

    fn alloc_chunk(
        mem: &BufferManager,
        engine: EngineType,
        has_chaining: bool,
        max_submit_dw: u32,
        max_size_dw: u32,
        needed_dw: u32,
    ) -> Result<CurrentChunk> {
        let mut size_dw = max_size_dw
            .max(needed_dw + Self::epilogue_dw(engine, has_chaining))
            .max(MIN_CHUNK_DW);
        if !has_chaining {
            // Everything must fit into this one buffer; be generous.
            size_dw = size_dw.saturating_mul(4);
        }
        let size_dw = size_dw.next_power_of_two().min(max_submit_dw);

        let bo = mem.create_buffer(
            ByteSize::from_bytes(size_dw as u64 * 4),
            mem.info().gart_page_size,
            BoDomain::GTT,
            CHUNK_FLAGS,
        )?;
        let ptr = bo.map()?.cast::<u32>();
        let va = bo.va();
        Ok(CurrentChunk {
            chunk: Chunk {
                bo,
                ptr,
                va,
                cdw: 0,
            },
            max_dw: size_dw - Self::epilogue_dw(engine, has_chaining),
            capacity_dw: size_dw,
        })
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Pad to the engine's fetch granularity with engine no-ops. With
    /// `force_nonempty`, an empty stream is padded up to one full group
    /// (constant-engine streams must never be zero length).
    pub fn pad(&mut self, force_nonempty: bool) {
        let gran = self.engine.pad_granularity_dw();
        let nop = self.encoder.nop_word(self.engine);
        while (force_nonempty && self.current.chunk.cdw == 0)
            || self.current.chunk.cdw % gran != 0
        {
            self.push(nop);
        }
    }

    /// Register every chunk of this stream for residency
    pub fn register_chunks(&self, reflist: &mut ReferenceList) -> Result<()> {
        for c in &self.prev {
            reflist.add(&c.bo, BoUsage::READ, RefPriority::IB)?;
        }
        reflist.add(&self.current.chunk.bo, BoUsage::READ, RefPriority::IB)?;
        Ok(())
    }

    /// Patch every recorded relocation with its resolved address
    pub fn apply_relocs(&mut self, reflist: &ReferenceList) {
        if self.has_virtual_memory {
            return;
        }
        for r in reflist.relocs() {
            let target = reflist.reloc_target(r);
            self.patch_words(r.offset_dw, &[target.raw() as u32, (target.raw() >> 32) as u32]);
        }
    }

    /// Rewrite dwords at a logical stream offset (spanning chunks)
    fn patch_words(&mut self, offset_dw: u32, words: &[u32]) {
        let mut base = 0u32;
        for c in self.prev.iter().chain(std::iter::once(&self.current.chunk)) {
            if offset_dw < base + c.cdw {
                let local = (offset_dw - base) as usize;
                debug_assert!(local + words.len() <= c.cdw as usize);
                for (i, &w) in words.iter().enumerate() {
                    // SAFETY: local + i < cdw <= capacity of the chunk.
                    unsafe { c.ptr.as_ptr().add(local + i).write(w) };
                }
                return;
            }
            base += c.cdw;
        }
        debug_assert!(false, "relocation offset outside the stream");
    }

    /// Close the stream for submission.
    ///
    /// Verifies the writer stayed within budget, patches the outstanding
    /// chain size, decays the size estimate for the next round and
    /// returns the kernel IB descriptor (first chunk address + length).
    pub fn finalize(&mut self) -> Result<IbInfo> {
        if self.current.chunk.cdw > self.current.max_dw {
            log::error!("arclight: command stream overflowed");
            return Err(Error::StreamOverflow);
        }

        let closing_cdw = self.current.chunk.cdw;
        self.patch_pending_size(closing_cdw);

        let (va, size_dw) = match self.prev.first() {
            Some(first) => (first.va, first.cdw),
            None => (self.current.chunk.va, self.current.chunk.cdw),
        };

        // Decay the running maximum so a single giant frame does not pin
        // giant buffers forever.
        self.max_size_dw = self.max_size_dw - self.max_size_dw / 32;
        self.max_size_dw = self.max_size_dw.max(MIN_CHUNK_DW);

        Ok(IbInfo {
            va,
            size_dw,
            flags: self.ib_flags,
        })
    }

    /// Drop all consumed chunks and start a fresh one so the caller can
    /// keep writing while the submission is in flight.
    pub fn reset_for_next(&mut self) -> Result<()> {
        self.prev.clear();
        self.prev_dw = 0;
        self.pending_size_patch = None;
        self.current = self.acquire_chunk(MIN_CHUNK_DW)?;
        Ok(())
    }

    /// Copy another (single-chunk, standalone) stream's words into this
    /// one verbatim, merging its reference list with relocation offsets
    /// shifted to the insertion point.
    pub fn splice(
        &mut self,
        other: &CommandStream,
        other_list: &ReferenceList,
        reflist: &mut ReferenceList,
    ) -> Result<()> {
        debug_assert!(other.prev.is_empty(), "spliced streams are single-chunk");
        let size = other.current.chunk.cdw;
        if size == 0 {
            return Ok(());
        }
        if !self.check_space(size, reflist) {
            return Err(Error::OutOfMemory);
        }

        let insert_at = self.total_dw();
        // SAFETY: reading back `cdw` dwords written into the other
        // stream's pinned chunk mapping.
        let words =
            unsafe { std::slice::from_raw_parts(other.current.chunk.ptr.as_ptr(), size as usize) };
        self.emit(words);

        reflist.append_shifted(other_list, insert_at)?;
        Ok(())
    }

    /// Read back every chunk's contents in chain order (diagnostics and
    /// tests)
    pub fn chunk_words(&self) -> Vec<Vec<u32>> {
        self.prev
            .iter()
            .chain(std::iter::once(&self.current.chunk))
            .map(|c| {
                // SAFETY: reading back the chunk's own written words.
                unsafe { std::slice::from_raw_parts(c.ptr.as_ptr(), c.cdw as usize) }.to_vec()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_core::encode::encoder_for;
    use arclight_core::soft::SoftDevice;
    use arclight_core::DeviceDriver;
    use arclight_mem::MemConfig;
    use std::sync::Arc;

    fn stream(engine: EngineType) -> (BufferManager, CommandStream, ReferenceList) {
        let dev = Arc::new(SoftDevice::new());
        let info = dev.query_info().unwrap();
        let mgr = BufferManager::new(dev, info.clone(), MemConfig::default());
        let encoder = encoder_for(info.generation).unwrap();
        let s = CommandStream::new(mgr.clone(), encoder, engine, IbFlags::empty(), true).unwrap();
        (mgr, s, ReferenceList::new())
    }

    #[test]
    fn test_simple_writes() {
        let (_mgr, mut s, mut list) = stream(EngineType::Graphics);
        assert!(s.check_space(3, &mut list));
        s.emit(&[1, 2, 3]);
        assert_eq!(s.total_dw(), 3);
        assert_eq!(s.chunk_count(), 1);
        assert_eq!(s.chunk_words()[0], vec![1, 2, 3]);
    }

    #[test]
    fn test_chaining_roundtrip() {
        let (_mgr, mut s, mut list) = stream(EngineType::Graphics);
        let first_capacity = s.max_dw();

        // Write well past one chunk in small packets; the concatenation
        // of all chunks minus padding and jumps must equal what was
        // written.
        let mut expected = Vec::new();
        let total = first_capacity + 2048;
        let mut word = 0x1000_0000u32;
        let mut written = 0;
        while written < total {
            assert!(s.check_space(4, &mut list));
            s.emit(&[word, word + 1, word + 2, word + 3]);
            expected.extend_from_slice(&[word, word + 1, word + 2, word + 3]);
            word += 4;
            written += 4;
        }

        // Exactly one continuation chunk.
        assert_eq!(s.chunk_count(), 2);
        // The continuation is resident.
        assert_eq!(list.len(), 1);

        let chunks = s.chunk_words();
        let nop = encoder_for(arclight_core::GpuGeneration::Gfx10)
            .unwrap()
            .nop_word(EngineType::Graphics);

        // First chunk: payload, nop padding, then the 4-dword jump.
        let c0 = &chunks[0];
        let mut c0_payload = &c0[..c0.len() - CHAIN_LEN_DW as usize];
        while let [head @ .., last] = c0_payload {
            if *last == nop {
                c0_payload = head;
            } else {
                break;
            }
        }

        let mut replayed = c0_payload.to_vec();
        replayed.extend_from_slice(&chunks[1]);
        assert_eq!(replayed, expected);
    }

    #[test]
    fn test_chain_size_patched_at_finalize() {
        let (_mgr, mut s, mut list) = stream(EngineType::Graphics);
        let budget = s.max_dw();
        // Fill the first chunk exactly, then force a chain.
        assert!(s.check_space(budget, &mut list));
        for i in 0..budget {
            s.push(i);
        }
        assert!(s.check_space(8, &mut list));
        s.emit(&[7; 8]);
        s.pad(false);

        let ib = s.finalize().unwrap();
        let chunks = s.chunk_words();
        assert_eq!(ib.size_dw, chunks[0].len() as u32);

        // The jump packet's size dword now carries the continuation's
        // final length.
        let jump = &chunks[0][chunks[0].len() - CHAIN_LEN_DW as usize..];
        assert_eq!(jump[3] & 0xF_FFFF, chunks[1].len() as u32);
    }

    #[test]
    fn test_no_chaining_engine_fails_check_space() {
        let (_mgr, mut s, mut list) = stream(EngineType::Dma);
        let budget = s.max_dw();
        assert!(s.check_space(budget, &mut list));
        for _ in 0..budget {
            s.push(0);
        }
        // Out of room and the DMA engine cannot follow jumps: the caller
        // must flush.
        assert!(!s.check_space(1, &mut list));
        assert_eq!(s.chunk_count(), 1);
    }

    #[test]
    fn test_padding_granularity() {
        let (_mgr, mut s, mut list) = stream(EngineType::Graphics);
        assert!(s.check_space(3, &mut list));
        s.emit(&[1, 2, 3]);
        s.pad(false);
        assert_eq!(s.total_dw() % 8, 0);

        // Video decode pads to 16.
        let (_mgr, mut v, mut vlist) = stream(EngineType::VideoDecode);
        assert!(v.check_space(3, &mut vlist));
        v.emit(&[1, 2, 3]);
        v.pad(false);
        assert_eq!(v.total_dw() % 16, 0);

        // An empty stream stays empty unless forced.
        let (_mgr, mut e, _elist) = stream(EngineType::Graphics);
        e.pad(false);
        assert_eq!(e.total_dw(), 0);
        e.pad(true);
        assert_eq!(e.total_dw(), 8);
    }

    #[test]
    fn test_size_estimate_decay() {
        let (_mgr, mut s, mut list) = stream(EngineType::Graphics);
        assert!(s.check_space(MIN_CHUNK_DW * 3, &mut list));
        let grown = s.max_size_dw;
        assert!(grown >= MIN_CHUNK_DW * 3);
        s.pad(true);
        s.finalize().unwrap();
        assert!(s.max_size_dw < grown);
    }

    #[test]
    fn test_splice_shifts_relocs() {
        // On a device without virtual addressing, streams record
        // relocation slots instead of raw addresses.
        let dev = Arc::new(SoftDevice::with_info(arclight_core::DeviceInfo {
            has_virtual_memory: false,
            ..Default::default()
        }));
        let info = dev.query_info().unwrap();
        let mgr = BufferManager::new(dev, info.clone(), MemConfig::default());
        let encoder = encoder_for(info.generation).unwrap();
        let mut primary = CommandStream::new(
            mgr.clone(),
            encoder.clone(),
            EngineType::Graphics,
            IbFlags::empty(),
            true,
        )
        .unwrap();
        let mut plist = ReferenceList::new();
        let mut secondary =
            CommandStream::new(mgr.clone(), encoder, EngineType::Graphics, IbFlags::empty(), false)
                .unwrap();
        let mut slist = ReferenceList::new();

        let data = mgr
            .create_buffer(
                ByteSize::KIB_4,
                4096,
                BoDomain::GTT,
                BoFlags::NO_SUBALLOC,
            )
            .unwrap();

        assert!(secondary.check_space(3, &mut slist));
        secondary.push(0xAA);
        secondary
            .emit_va(&mut slist, &data, BoUsage::READ, RefPriority::NORMAL, 0x40)
            .unwrap();
        assert_eq!(slist.relocs().len(), 1);
        assert_eq!(slist.relocs()[0].offset_dw, 1);

        // Put some words into the primary first so the shift is nonzero.
        assert!(primary.check_space(4, &mut plist));
        primary.emit(&[1, 2, 3, 4]);

        primary.splice(&secondary, &slist, &mut plist).unwrap();

        assert_eq!(plist.relocs().len(), 1);
        assert_eq!(plist.relocs()[0].offset_dw, 5);
        let entry = plist.relocs()[0].entry;
        assert!(plist.get(entry).unwrap().bo.ptr_eq(&data));

        // The copied words follow the primary's own.
        assert_eq!(
            &primary.chunk_words()[0][..7],
            &[1, 2, 3, 4, 0xAA, 0, 0]
        );

        // Patch-up resolves the slot at its shifted position.
        primary.apply_relocs(&plist);
        let expect = data.va().raw() + 0x40;
        assert_eq!(
            &primary.chunk_words()[0][5..7],
            &[expect as u32, (expect >> 32) as u32]
        );
    }

    #[test]
    fn test_apply_relocs_patches_stream() {
        let dev = Arc::new(SoftDevice::with_info(arclight_core::DeviceInfo {
            has_virtual_memory: false,
            ..Default::default()
        }));
        let info = dev.query_info().unwrap();
        let mgr = BufferManager::new(dev, info.clone(), MemConfig::default());
        let encoder = encoder_for(info.generation).unwrap();
        let mut s =
            CommandStream::new(mgr.clone(), encoder, EngineType::Graphics, IbFlags::empty(), true)
                .unwrap();
        let mut list = ReferenceList::new();

        let data = mgr
            .create_buffer(
                ByteSize::KIB_4,
                4096,
                BoDomain::GTT,
                BoFlags::NO_SUBALLOC,
            )
            .unwrap();

        assert!(s.check_space(2, &mut list));
        s.emit_va(&mut list, &data, BoUsage::READ, RefPriority::NORMAL, 0x10)
            .unwrap();
        // Placeholder until patch-up.
        assert_eq!(&s.chunk_words()[0][..2], &[0, 0]);

        s.apply_relocs(&list);
        let expect = data.va().raw() + 0x10;
        assert_eq!(
            &s.chunk_words()[0][..2],
            &[expect as u32, (expect >> 32) as u32]
        );
    }
}
