//! # Reference List
//!
//! The deduplicated table of every buffer object a command stream
//! references, finalized into the kernel buffer list at submission.
//!
//! A fixed-size hash over buffer ids keeps repeated registration of the
//! same working set O(1); collisions fall back to a backward linear scan
//! that also repairs the hash slot, biasing it toward the most recently
//! seen buffer.

use arclight_core::driver::{BoDomain, BoUsage, RefPriority};
use arclight_core::error::{Error, Result};
use arclight_core::types::GpuAddr;
use arclight_mem::Bo;

// =============================================================================
// ENTRIES
// =============================================================================

/// One referenced buffer with its merged usage
pub struct RefEntry {
    /// The buffer
    pub bo: Bo,
    /// OR of every requested usage
    pub usage: BoUsage,
    /// Placement domains the reference pulls in
    pub domains: BoDomain,
    /// Bitmask of every priority the buffer was registered with
    pub priority_usage: u64,
    /// Highest coarse kernel priority class seen
    pub kernel_class: u8,
}

/// A patchable address slot inside the stream, for devices without full
/// virtual addressing
#[derive(Debug, Clone, Copy)]
pub struct RelocRecord {
    /// Dword offset of the 64-bit address slot within the logical stream
    pub offset_dw: u32,
    /// Index of the referenced entry
    pub entry: usize,
    /// Byte offset added to the buffer's address
    pub delta: u64,
}

const HASH_SIZE: usize = 256;

// =============================================================================
// REFERENCE LIST
// =============================================================================

/// Deduplicated buffer reference table for one submission
pub struct ReferenceList {
    entries: Vec<RefEntry>,
    /// unique id → last known index, verified before trusting
    hash: [i32; HASH_SIZE],
    relocs: Vec<RelocRecord>,
    used_vram: u64,
    used_gtt: u64,
}

impl ReferenceList {
    /// Create an empty list with room for a typical working set
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(512),
            hash: [-1; HASH_SIZE],
            relocs: Vec::new(),
            used_vram: 0,
            used_gtt: 0,
        }
    }

    #[inline]
    fn hash_slot(bo: &Bo) -> usize {
        (bo.id() as usize) & (HASH_SIZE - 1)
    }

    /// Number of distinct buffers referenced
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No buffers referenced?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a buffer's index, repairing the hash slot on a collision hit.
    pub fn lookup(&mut self, bo: &Bo) -> Option<usize> {
        let slot = Self::hash_slot(bo);
        let i = self.hash[slot];
        if i >= 0 {
            let i = i as usize;
            if self.entries[i].bo.ptr_eq(bo) {
                return Some(i);
            }
        } else {
            return None;
        }

        // Hash collision: scan backward so recently added buffers are
        // found first, then point the slot at the match. Consecutive
        // registrations of the same buffer then hit the fast path.
        for i in (0..self.entries.len()).rev() {
            if self.entries[i].bo.ptr_eq(bo) {
                self.hash[slot] = i as i32;
                return Some(i);
            }
        }
        None
    }

    /// Register a buffer, merging usage/priority bits when it is already
    /// present. Returns the (stable within one generation) entry index.
    pub fn add(&mut self, bo: &Bo, usage: BoUsage, priority: RefPriority) -> Result<usize> {
        debug_assert!(priority.0 < 64);

        if let Some(i) = self.lookup(bo) {
            let entry = &mut self.entries[i];
            entry.usage |= usage;
            entry.priority_usage |= 1u64 << priority.0;
            entry.kernel_class = entry.kernel_class.max(priority.kernel_class());
            return Ok(i);
        }

        // Grow geometrically: at least +16 entries, or 1.3x, whichever is
        // larger. The list must not be touched when reservation fails.
        if self.entries.len() == self.entries.capacity() {
            let len = self.entries.len();
            let target = (len + 16).max(len + len * 3 / 10);
            self.entries
                .try_reserve_exact(target - len)
                .map_err(|_| Error::OutOfMemory)?;
        }

        let domains = bo.domain();
        if domains.contains(BoDomain::VRAM) {
            self.used_vram += bo.size().as_bytes();
        } else if domains.contains(BoDomain::GTT) {
            self.used_gtt += bo.size().as_bytes();
        }

        bo.inc_cs_references();
        let index = self.entries.len();
        self.entries.push(RefEntry {
            bo: bo.clone(),
            usage,
            domains,
            priority_usage: 1u64 << priority.0,
            kernel_class: priority.kernel_class(),
        });
        self.hash[Self::hash_slot(bo)] = index as i32;
        Ok(index)
    }

    /// Entry accessor
    pub fn get(&self, index: usize) -> Option<&RefEntry> {
        self.entries.get(index)
    }

    /// Iterate all entries
    pub fn entries(&self) -> impl Iterator<Item = &RefEntry> {
        self.entries.iter()
    }

    /// Record a patchable address slot
    pub fn add_reloc(&mut self, offset_dw: u32, entry: usize, delta: u64) {
        debug_assert!(entry < self.entries.len());
        self.relocs.push(RelocRecord {
            offset_dw,
            entry,
            delta,
        });
    }

    /// Relocation records
    pub fn relocs(&self) -> &[RelocRecord] {
        &self.relocs
    }

    /// Resolved address of a relocation record
    pub fn reloc_target(&self, r: &RelocRecord) -> GpuAddr {
        self.entries[r.entry].bo.va().offset(r.delta)
    }

    /// Merge another list into this one, shifting the other's relocation
    /// offsets by `shift_dw` (the splice insertion point). The relative
    /// order of the inherited records is preserved.
    pub fn append_shifted(&mut self, other: &ReferenceList, shift_dw: u32) -> Result<()> {
        for (i, e) in other.entries.iter().enumerate() {
            let new_index = match self.lookup(&e.bo) {
                Some(idx) => {
                    let entry = &mut self.entries[idx];
                    entry.usage |= e.usage;
                    entry.priority_usage |= e.priority_usage;
                    entry.kernel_class = entry.kernel_class.max(e.kernel_class);
                    idx
                }
                None => {
                    if self.entries.len() == self.entries.capacity() {
                        let len = self.entries.len();
                        let target = (len + 16).max(len + len * 3 / 10);
                        self.entries
                            .try_reserve_exact(target - len)
                            .map_err(|_| Error::OutOfMemory)?;
                    }
                    if e.domains.contains(BoDomain::VRAM) {
                        self.used_vram += e.bo.size().as_bytes();
                    } else if e.domains.contains(BoDomain::GTT) {
                        self.used_gtt += e.bo.size().as_bytes();
                    }
                    e.bo.inc_cs_references();
                    let index = self.entries.len();
                    self.entries.push(RefEntry {
                        bo: e.bo.clone(),
                        usage: e.usage,
                        domains: e.domains,
                        priority_usage: e.priority_usage,
                        kernel_class: e.kernel_class,
                    });
                    self.hash[Self::hash_slot(&e.bo)] = index as i32;
                    index
                }
            };

            for r in other.relocs.iter().filter(|r| r.entry == i) {
                self.relocs.push(RelocRecord {
                    offset_dw: r.offset_dw + shift_dw,
                    entry: new_index,
                    delta: r.delta,
                });
            }
        }
        Ok(())
    }

    /// VRAM bytes pulled in by this list
    pub fn used_vram(&self) -> u64 {
        self.used_vram
    }

    /// GTT bytes pulled in by this list
    pub fn used_gtt(&self) -> u64 {
        self.used_gtt
    }

    /// Release every reference and clear the hash. Indices handed out
    /// before the reset are invalid afterwards.
    pub fn reset(&mut self) {
        for e in &self.entries {
            e.bo.dec_cs_references();
        }
        self.entries.clear();
        self.relocs.clear();
        self.hash = [-1; HASH_SIZE];
        self.used_vram = 0;
        self.used_gtt = 0;
    }
}

impl Default for ReferenceList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReferenceList {
    fn drop(&mut self) {
        for e in &self.entries {
            e.bo.dec_cs_references();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_core::driver::BoFlags;
    use arclight_core::soft::SoftDevice;
    use arclight_core::types::ByteSize;
    use arclight_core::DeviceDriver;
    use arclight_mem::{BufferManager, MemConfig};
    use std::sync::Arc;

    fn manager() -> BufferManager {
        let dev = Arc::new(SoftDevice::new());
        let info = dev.query_info().unwrap();
        BufferManager::new(dev, info, MemConfig::default())
    }

    fn buffer(mgr: &BufferManager) -> Bo {
        mgr.create_buffer(
            ByteSize::KIB_4,
            4096,
            arclight_core::BoDomain::GTT,
            BoFlags::NO_SUBALLOC,
        )
        .unwrap()
    }

    #[test]
    fn test_no_duplicates_and_usage_merge() {
        let mgr = manager();
        let bo = buffer(&mgr);
        let mut list = ReferenceList::new();

        let a = list.add(&bo, BoUsage::READ, RefPriority::NORMAL).unwrap();
        let b = list.add(&bo, BoUsage::WRITE, RefPriority::IB).unwrap();
        assert_eq!(a, b);
        assert_eq!(list.len(), 1);

        let entry = list.get(a).unwrap();
        assert_eq!(entry.usage, BoUsage::READ | BoUsage::WRITE);
        assert_eq!(
            entry.priority_usage,
            (1 << RefPriority::NORMAL.0) | (1 << RefPriority::IB.0)
        );
        assert_eq!(entry.kernel_class, RefPriority::IB.kernel_class());
        assert_eq!(bo.cs_ref_count(), 1);
    }

    #[test]
    fn test_stable_indices() {
        let mgr = manager();
        let bos: Vec<Bo> = (0..64).map(|_| buffer(&mgr)).collect();
        let mut list = ReferenceList::new();
        let indices: Vec<usize> = bos
            .iter()
            .map(|bo| list.add(bo, BoUsage::READ, RefPriority::MIN).unwrap())
            .collect();
        for (i, bo) in bos.iter().enumerate() {
            assert_eq!(list.lookup(bo), Some(indices[i]));
        }
    }

    #[test]
    fn test_hash_collision_fallback() {
        let mgr = manager();
        // Buffer ids increase monotonically: two buffers 256 ids apart
        // collide in the 256-slot hash. Burn ids in between with
        // short-lived buffers.
        let first = buffer(&mgr);
        let mut collider = buffer(&mgr);
        while collider.id() % 256 != first.id() % 256 {
            collider = buffer(&mgr);
        }

        let mut list = ReferenceList::new();
        let a = list.add(&first, BoUsage::READ, RefPriority::MIN).unwrap();
        let b = list.add(&collider, BoUsage::READ, RefPriority::MIN).unwrap();
        assert_ne!(a, b);

        // The collider owns the hash slot now; finding `first` takes the
        // linear fallback, which must still return the right index and
        // repair the slot.
        assert_eq!(list.lookup(&first), Some(a));
        assert_eq!(list.lookup(&first), Some(a));
        assert_eq!(list.lookup(&collider), Some(b));
    }

    #[test]
    fn test_reset_releases_references() {
        let mgr = manager();
        let bo = buffer(&mgr);
        let mut list = ReferenceList::new();
        list.add(&bo, BoUsage::READ, RefPriority::MIN).unwrap();
        assert_eq!(bo.cs_ref_count(), 1);

        list.reset();
        assert_eq!(bo.cs_ref_count(), 0);
        assert!(list.is_empty());
        assert_eq!(list.lookup(&bo), None);
        assert_eq!(list.used_gtt(), 0);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let mgr = manager();
        let bos: Vec<Bo> = (0..600).map(|_| buffer(&mgr)).collect();
        let mut list = ReferenceList::new();
        for bo in &bos {
            list.add(bo, BoUsage::READ, RefPriority::MIN).unwrap();
        }
        assert_eq!(list.len(), 600);
        // Every buffer still resolves after reallocation.
        for (i, bo) in bos.iter().enumerate() {
            assert_eq!(list.lookup(bo), Some(i));
        }
    }

    #[test]
    fn test_append_shifted_relocs() {
        let mgr = manager();
        let shared = buffer(&mgr);
        let only_other = buffer(&mgr);

        let mut dst = ReferenceList::new();
        let dst_shared = dst.add(&shared, BoUsage::READ, RefPriority::MIN).unwrap();

        let mut src = ReferenceList::new();
        let s0 = src.add(&shared, BoUsage::WRITE, RefPriority::IB).unwrap();
        let s1 = src
            .add(&only_other, BoUsage::READ, RefPriority::MIN)
            .unwrap();
        src.add_reloc(4, s0, 0x10);
        src.add_reloc(8, s1, 0);

        dst.append_shifted(&src, 100).unwrap();

        // Shared buffer merged, not duplicated.
        assert_eq!(dst.len(), 2);
        assert_eq!(
            dst.get(dst_shared).unwrap().usage,
            BoUsage::READ | BoUsage::WRITE
        );

        // Offsets shifted by the insertion point, order preserved.
        let only_other_idx = dst.lookup(&only_other).unwrap();
        let relocs = dst.relocs();
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[0].offset_dw, 104);
        assert_eq!(relocs[0].entry, dst_shared);
        assert_eq!(relocs[0].delta, 0x10);
        assert_eq!(relocs[1].offset_dw, 108);
        assert_eq!(relocs[1].entry, only_other_idx);
    }
}
