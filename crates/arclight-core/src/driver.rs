//! # Kernel Driver Interface
//!
//! The capability set the winsys consumes from the kernel transport layer:
//! buffer allocation and mapping, virtual address management, buffer
//! export/import, command submission and fence queries.
//!
//! Everything behind [`DeviceDriver`] talks ioctls (or, for the software
//! device, host memory). The winsys never issues ioctls directly.

use alloc::vec::Vec;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// ENGINE TYPE
// =============================================================================

/// Hardware engine (ring) a submission targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum EngineType {
    /// 3D graphics engine
    Graphics    = 0,
    /// Asynchronous compute engine
    Compute     = 1,
    /// Transfer/DMA engine
    Dma         = 2,
    /// Video decode engine
    VideoDecode = 3,
}

impl EngineType {
    /// Number of engine types (sizes per-engine tables)
    pub const COUNT: usize = 4;

    /// Engines a stream can chain on mid-stream. The DMA and video engines
    /// fetch a single contiguous buffer and cannot follow jump packets.
    #[inline]
    pub const fn supports_chaining(self) -> bool {
        matches!(self, Self::Graphics | Self::Compute)
    }

    /// Required submission granularity in dwords. The command processor
    /// fetches in aligned bursts; streams are padded with engine-specific
    /// no-ops to an exact multiple of this.
    #[inline]
    pub const fn pad_granularity_dw(self) -> u32 {
        match self {
            Self::Graphics | Self::Compute | Self::Dma => 8,
            Self::VideoDecode => 16,
        }
    }

    /// Engines with a CPU-pollable user fence location. The video engine
    /// signals completion through the kernel only.
    #[inline]
    pub const fn has_user_fence(self) -> bool {
        !matches!(self, Self::VideoDecode)
    }
}

// =============================================================================
// BUFFER PLACEMENT
// =============================================================================

bitflags::bitflags! {
    /// Memory placement domains for a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoDomain: u32 {
        /// Host-shared memory reachable through the GART
        const GTT  = 1 << 0;
        /// Dedicated video memory
        const VRAM = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Buffer object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// CPU access required (VRAM placed in the BAR aperture)
        const CPU_ACCESS    = 1 << 0;
        /// Buffer is never mapped; the kernel may place it anywhere
        const NO_CPU_ACCESS = 1 << 1;
        /// Write-combined CPU mapping for streaming uploads
        const GTT_WC        = 1 << 2;
        /// Must be a standalone kernel allocation, never a slab entry
        const NO_SUBALLOC   = 1 << 3;
        /// Eligible for the reclaim cache when released
        const REUSABLE      = 1 << 4;
    }
}

impl BoFlags {
    /// Flags that affect physical placement. The reclaim cache buckets on
    /// these so that subtly different placements never collapse into one
    /// bucket.
    pub const PLACEMENT: Self = Self::CPU_ACCESS
        .union(Self::NO_CPU_ACCESS)
        .union(Self::GTT_WC);
}

bitflags::bitflags! {
    /// How a command stream uses a referenced buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoUsage: u32 {
        /// GPU reads from the buffer
        const READ         = 1 << 0;
        /// GPU writes to the buffer
        const WRITE        = 1 << 1;
        /// Accesses are ordered against other queues by explicit fences
        const SYNCHRONIZED = 1 << 2;
    }
}

impl BoUsage {
    /// Read and write
    pub const RW: Self = Self::READ.union(Self::WRITE);
}

/// Residency priority of a referenced buffer (0..64)
///
/// The kernel folds this down to `prio / 4` when building the buffer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefPriority(pub u8);

impl RefPriority {
    /// Lowest priority
    pub const MIN: Self = Self(0);
    /// Default priority for data buffers
    pub const NORMAL: Self = Self(32);
    /// Indirect buffers must stay resident for the fetcher
    pub const IB: Self = Self(60);

    /// Fold down to the coarse kernel priority class
    #[inline]
    pub const fn kernel_class(self) -> u8 {
        self.0 / 4
    }
}

// =============================================================================
// SUBMISSION TYPES
// =============================================================================

/// One entry of the kernel buffer list accompanying a submission
#[derive(Debug, Clone, Copy)]
pub struct BufferListEntry {
    /// Kernel handle of the (real) buffer
    pub handle: BufferHandle,
    /// Coarse residency priority class
    pub priority_class: u8,
}

bitflags::bitflags! {
    /// Per-IB flags in a submission
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IbFlags: u32 {
        /// IB targets the constant engine
        const CONST    = 1 << 0;
        /// IB is a preamble executed before the main IB
        const PREAMBLE = 1 << 1;
    }
}

/// Descriptor of one indirect buffer within a submission
#[derive(Debug, Clone, Copy)]
pub struct IbInfo {
    /// GPU address of the first chunk
    pub va: GpuAddr,
    /// Dword count of the first chunk (chained continuations carry their
    /// sizes in the jump packets)
    pub size_dw: u32,
    /// IB flags
    pub flags: IbFlags,
}

/// Identity of a kernel fence: a sequence number on one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceDep {
    /// Submission context the fence belongs to
    pub ctx_id: u64,
    /// Engine the fence belongs to
    pub engine: EngineType,
    /// Kernel sequence number
    pub seq: u64,
}

/// Location the kernel writes the completed sequence number to, CPU-pollable
#[derive(Debug, Clone, Copy)]
pub struct UserFenceInfo {
    /// Buffer holding the fence value
    pub handle: BufferHandle,
    /// Byte offset of the 64-bit fence word
    pub offset: u64,
}

/// A complete kernel submission request
#[derive(Debug)]
pub struct SubmitRequest<'a> {
    /// Submission context identity
    pub ctx_id: u64,
    /// Target engine
    pub engine: EngineType,
    /// Every buffer the submission may touch
    pub buffers: &'a [BufferListEntry],
    /// The indirect buffers to execute, in order
    pub ibs: &'a [IbInfo],
    /// Fences that must signal before execution starts
    pub deps: &'a [FenceDep],
    /// Where to mirror the completed sequence number for CPU polling
    pub user_fence: Option<UserFenceInfo>,
}

// =============================================================================
// IMPORT / EXPORT
// =============================================================================

/// External handle namespace used for sharing buffers across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Global (flink-style) name
    SharedName,
    /// File-descriptor based (dma-buf style)
    Fd,
    /// Scanout/KMS handle
    Kms,
}

/// Result of importing an external buffer handle
#[derive(Debug, Clone, Copy)]
pub struct ImportedBuffer {
    /// Kernel handle in this process
    pub handle: BufferHandle,
    /// Allocation size
    pub size: ByteSize,
    /// Physical alignment
    pub alignment: u64,
    /// Initial placement domain
    pub domain: BoDomain,
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// Infinite timeout sentinel for fence and idle waits
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// The kernel transport capability set
///
/// One implementation exists per kernel interface; [`crate::soft::SoftDevice`]
/// provides a pure host-memory implementation for tests and bring-up.
pub trait DeviceDriver: Send + Sync {
    /// Identity token; the same underlying device must always report the
    /// same token (used by the process-wide winsys de-duplication table).
    fn device_token(&self) -> u64;

    /// Query static device information. Called once at winsys creation.
    fn query_info(&self) -> Result<DeviceInfo>;

    /// Allocate a kernel buffer
    fn alloc(
        &self,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Result<BufferHandle>;

    /// Wrap existing host memory as a kernel buffer
    fn alloc_from_ptr(&self, ptr: *mut u8, size: ByteSize) -> Result<BufferHandle>;

    /// Free a kernel buffer
    fn free(&self, handle: BufferHandle);

    /// Map a buffer into the CPU address space
    fn map(&self, handle: BufferHandle) -> Result<*mut u8>;

    /// Drop the CPU mapping of a buffer
    fn unmap(&self, handle: BufferHandle);

    /// Reserve a GPU virtual address range
    fn reserve_va(&self, size: ByteSize, alignment: u64) -> Result<(GpuAddr, VaRangeHandle)>;

    /// Release a reserved virtual address range
    fn release_va(&self, range: VaRangeHandle);

    /// Bind a buffer into a reserved virtual address range
    fn bind_va(&self, handle: BufferHandle, va: GpuAddr, size: ByteSize) -> Result<()>;

    /// Remove a virtual address binding
    fn unbind_va(&self, handle: BufferHandle, va: GpuAddr, size: ByteSize);

    /// Export a buffer for another process
    fn export(&self, handle: BufferHandle, kind: ExportKind) -> Result<u64>;

    /// Import a buffer exported by another process
    fn import(&self, external: u64, kind: ExportKind) -> Result<ImportedBuffer>;

    /// Submit command buffers; returns the new fence sequence number
    fn submit(&self, request: &SubmitRequest<'_>) -> Result<u64>;

    /// Query or wait for a fence. `timeout_ns == 0` must be non-blocking;
    /// `absolute` interprets the timeout as an absolute monotonic deadline.
    fn query_fence(&self, dep: FenceDep, timeout_ns: u64, absolute: bool) -> Result<bool>;

    /// Cross-process idle query for shared buffers, bounded by `timeout_ns`.
    /// Returns true when the buffer is idle device-wide.
    fn wait_buffer_idle(&self, handle: BufferHandle, timeout_ns: u64) -> Result<bool>;

    /// Snapshot of the per-domain heap usage, for telemetry
    fn query_heap_usage(&self, domain: BoDomain) -> Result<ByteSize>;
}

/// Shared driver reference used across the winsys
pub type DriverRef = alloc::sync::Arc<dyn DeviceDriver>;

// Keep the request types trivially shareable; the submit worker hands them
// across threads.
static_assertions::assert_impl_all!(BufferListEntry: Send, Sync, Copy);
static_assertions::assert_impl_all!(IbInfo: Send, Sync, Copy);
static_assertions::assert_impl_all!(FenceDep: Send, Sync, Copy);

/// Convenience collection of buffer list entries
pub type BufferList = Vec<BufferListEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_properties() {
        assert!(EngineType::Graphics.supports_chaining());
        assert!(EngineType::Compute.supports_chaining());
        assert!(!EngineType::Dma.supports_chaining());
        assert!(!EngineType::VideoDecode.supports_chaining());
        assert_eq!(EngineType::VideoDecode.pad_granularity_dw(), 16);
        assert_eq!(EngineType::Graphics.pad_granularity_dw(), 8);
        assert!(!EngineType::VideoDecode.has_user_fence());
    }

    #[test]
    fn test_priority_class() {
        assert_eq!(RefPriority::IB.kernel_class(), 15);
        assert_eq!(RefPriority::MIN.kernel_class(), 0);
        assert_eq!(RefPriority(7).kernel_class(), 1);
    }

    #[test]
    fn test_placement_mask() {
        let flags = BoFlags::CPU_ACCESS | BoFlags::REUSABLE | BoFlags::NO_SUBALLOC;
        assert_eq!(
            flags.intersection(BoFlags::PLACEMENT),
            BoFlags::CPU_ACCESS
        );
    }
}
