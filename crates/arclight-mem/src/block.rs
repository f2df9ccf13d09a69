//! # Memory Block
//!
//! One physically backed, virtually mapped kernel allocation: the raw
//! substrate buffer objects and command streams are built from.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use arclight_core::driver::{BoDomain, BoFlags, DriverRef};
use arclight_core::error::{Error, Result};
use arclight_core::types::{BufferHandle, ByteSize, GpuAddr, VaRangeHandle};

use crate::manager::MemShared;

/// A single kernel allocation with a bound GPU virtual address and, when
/// the placement allows it, a CPU mapping.
///
/// The block owns its kernel resources: dropping it unmaps, unbinds,
/// releases the VA range and frees the handle, and removes the block from
/// the device-wide accounting.
pub struct MemoryBlock {
    id: u64,
    handle: BufferHandle,
    va: GpuAddr,
    va_range: VaRangeHandle,
    size: ByteSize,
    alignment: u64,
    domain: BoDomain,
    flags: BoFlags,
    map_ptr: Option<NonNull<u8>>,
    user_ptr: bool,
    driver: DriverRef,
    mem: Weak<MemShared>,
}

// SAFETY: the mapped pointer refers to kernel-pinned memory that stays
// valid for the lifetime of the block; all mutation of block state goes
// through &mut or the owning manager's locks.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Does this placement get a CPU mapping at creation?
    fn cpu_visible(domain: BoDomain, flags: BoFlags) -> bool {
        if flags.contains(BoFlags::NO_CPU_ACCESS) {
            return false;
        }
        domain.contains(BoDomain::GTT) || flags.contains(BoFlags::CPU_ACCESS)
    }

    /// Allocate a fresh block
    pub(crate) fn alloc(
        mem: &Arc<MemShared>,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
        flags: BoFlags,
    ) -> Result<Self> {
        let driver = mem.driver.clone();
        let handle = driver.alloc(size, alignment, domain, flags).inspect_err(|e| {
            log::error!(
                "arclight: failed to allocate a buffer: {e} (size {size}, \
                 alignment {alignment}, domain {domain:?})"
            );
        })?;

        let (va, va_range) = match driver.reserve_va(size, alignment.max(mem.info.gart_page_size))
        {
            Ok(r) => r,
            Err(e) => {
                driver.free(handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.bind_va(handle, va, size) {
            driver.release_va(va_range);
            driver.free(handle);
            return Err(e);
        }

        let map_ptr = if Self::cpu_visible(domain, flags) {
            match driver.map(handle) {
                Ok(p) => NonNull::new(p),
                Err(e) => {
                    driver.unbind_va(handle, va, size);
                    driver.release_va(va_range);
                    driver.free(handle);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let id = mem.next_id();
        mem.account_alloc(id, handle, domain, size);

        Ok(Self {
            id,
            handle,
            va,
            va_range,
            size,
            alignment,
            domain,
            flags,
            map_ptr,
            user_ptr: false,
            driver,
            mem: Arc::downgrade(mem),
        })
    }

    /// Wrap caller-owned host memory as a GTT block
    pub(crate) fn from_user_ptr(
        mem: &Arc<MemShared>,
        ptr: *mut u8,
        size: ByteSize,
    ) -> Result<Self> {
        let driver = mem.driver.clone();
        let handle = driver.alloc_from_ptr(ptr, size)?;
        let (va, va_range) = match driver.reserve_va(size, mem.info.gart_page_size) {
            Ok(r) => r,
            Err(e) => {
                driver.free(handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.bind_va(handle, va, size) {
            driver.release_va(va_range);
            driver.free(handle);
            return Err(e);
        }

        let id = mem.next_id();
        mem.account_alloc(id, handle, BoDomain::GTT, size);

        Ok(Self {
            id,
            handle,
            va,
            va_range,
            size,
            alignment: 1,
            domain: BoDomain::GTT,
            flags: BoFlags::empty(),
            map_ptr: NonNull::new(ptr),
            user_ptr: true,
            driver,
            mem: Arc::downgrade(mem),
        })
    }

    /// Wrap a handle imported from another process
    pub(crate) fn from_import(
        mem: &Arc<MemShared>,
        handle: BufferHandle,
        size: ByteSize,
        alignment: u64,
        domain: BoDomain,
    ) -> Result<Self> {
        let driver = mem.driver.clone();
        let (va, va_range) = match driver.reserve_va(size, 1 << 20) {
            Ok(r) => r,
            Err(e) => {
                driver.free(handle);
                return Err(e);
            }
        };
        if let Err(e) = driver.bind_va(handle, va, size) {
            driver.release_va(va_range);
            driver.free(handle);
            return Err(e);
        }

        let id = mem.next_id();
        mem.account_alloc(id, handle, domain, size);

        Ok(Self {
            id,
            handle,
            va,
            va_range,
            size,
            alignment,
            domain,
            flags: BoFlags::empty(),
            map_ptr: None,
            user_ptr: false,
            driver,
            mem: Arc::downgrade(mem),
        })
    }

    /// Unique id of this block
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kernel handle
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Bound GPU virtual address
    #[inline]
    pub fn va(&self) -> GpuAddr {
        self.va
    }

    /// Allocation size
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Physical alignment
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Placement domain
    #[inline]
    pub fn domain(&self) -> BoDomain {
        self.domain
    }

    /// Creation flags
    #[inline]
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// CPU mapping, when the placement allows one
    pub fn map(&self) -> Result<NonNull<u8>> {
        self.map_ptr.ok_or(Error::MappingFailed)
    }

    /// Whether a CPU mapping exists
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map_ptr.is_some()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if self.map_ptr.is_some() && !self.user_ptr {
            self.driver.unmap(self.handle);
        }
        self.driver.unbind_va(self.handle, self.va, self.size);
        self.driver.release_va(self.va_range);
        self.driver.free(self.handle);

        if let Some(mem) = self.mem.upgrade() {
            mem.account_free(self.id, self.domain, self.size);
        }
    }
}

impl core::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("va", &self.va)
            .field("size", &self.size)
            .field("domain", &self.domain)
            .finish()
    }
}
