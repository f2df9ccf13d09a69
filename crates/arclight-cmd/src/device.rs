//! # Device Root
//!
//! The per-device winsys root: owns the buffer manager, the command
//! encoder for the device's generation and the context registry.
//!
//! Opening the same underlying kernel device twice yields the same root:
//! a process-wide table keyed by the driver's device token de-duplicates
//! winsys instances, initialized lazily and cleaned up exactly when the
//! last strong reference drops while the table lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use arclight_core::driver::{BoDomain, DriverRef, EngineType};
use arclight_core::encode::{encoder_for, CommandEncoder};
use arclight_core::error::{Error, Result};
use arclight_core::types::{ByteSize, DeviceInfo};
use arclight_mem::{BufferManager, MemConfig};

use crate::submit::SubmitContext;

// =============================================================================
// CONFIG
// =============================================================================

/// Winsys-level configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Run kernel submissions on a per-context background worker
    pub use_worker: bool,
    /// Diagnostic: build every submission's buffer list from all live
    /// buffers instead of the reference list (residency debugging)
    pub all_buffers: bool,
    /// Diagnostic: skip kernel submissions entirely
    pub noop_submit: bool,
    /// Buffer manager tuning
    pub mem: MemConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_worker: true,
            all_buffers: false,
            noop_submit: false,
            mem: MemConfig::default(),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// The kernel interface major version this winsys speaks
const SUPPORTED_DRM_MAJOR: u32 = 3;

pub(crate) struct DeviceShared {
    pub(crate) driver: DriverRef,
    pub(crate) info: DeviceInfo,
    pub(crate) config: DeviceConfig,
    pub(crate) encoder: Arc<dyn CommandEncoder>,
    pub(crate) bufmgr: BufferManager,
    pub(crate) next_ctx_id: AtomicU64,
    pub(crate) num_contexts: AtomicU32,
    pub(crate) num_flushes: AtomicU64,
    token: u64,
}

fn device_table() -> &'static Mutex<HashMap<u64, Weak<DeviceShared>>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, Weak<DeviceShared>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

// =============================================================================
// DEVICE
// =============================================================================

/// Winsys root for one GPU device
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Open (or re-open) the winsys for a kernel device.
    ///
    /// The same device token always resolves to the same root while any
    /// handle to it is alive; `config` only applies to a freshly created
    /// root.
    pub fn open(driver: DriverRef, config: DeviceConfig) -> Result<Device> {
        let token = driver.device_token();
        let mut table = device_table().lock().unwrap();

        if let Some(existing) = table.get(&token).and_then(Weak::upgrade) {
            return Ok(Device { shared: existing });
        }

        let info = driver.query_info()?;
        if info.drm_major != SUPPORTED_DRM_MAJOR {
            return Err(Error::VersionMismatch);
        }
        let encoder = encoder_for(info.generation).ok_or(Error::NotSupported)?;
        let bufmgr = BufferManager::new(driver.clone(), info.clone(), config.mem.clone());

        let shared = Arc::new(DeviceShared {
            driver,
            info,
            config,
            encoder,
            bufmgr,
            next_ctx_id: AtomicU64::new(1),
            num_contexts: AtomicU32::new(0),
            num_flushes: AtomicU64::new(0),
            token,
        });
        table.insert(token, Arc::downgrade(&shared));
        Ok(Device { shared })
    }

    /// Create a submission context on an engine
    pub fn create_context(&self, engine: EngineType) -> Result<SubmitContext> {
        SubmitContext::new(self.shared.clone(), engine)
    }

    /// Static device information
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// The buffer manager
    pub fn buffers(&self) -> &BufferManager {
        &self.shared.bufmgr
    }

    /// Bytes currently allocated in a domain
    pub fn allocated(&self, domain: BoDomain) -> ByteSize {
        self.shared.bufmgr.allocated(domain)
    }

    /// Device-wide heap usage as reported by the kernel (covers other
    /// processes too)
    pub fn heap_usage(&self, domain: BoDomain) -> Result<ByteSize> {
        self.shared.driver.query_heap_usage(domain)
    }

    /// Flushes that reached the kernel, device-wide
    pub fn num_flushes(&self) -> u64 {
        self.shared.num_flushes.load(Ordering::Relaxed)
    }

    /// Live submission contexts
    pub fn num_contexts(&self) -> u32 {
        self.shared.num_contexts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

impl Clone for Device {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Remove the table entry exactly when the last strong reference
        // dies, under the same lock `open` uses, so a concurrent open
        // either revives this root or builds a fresh one — never both.
        let mut table = device_table().lock().unwrap();
        if Arc::strong_count(&self.shared) == 1 {
            table.remove(&self.shared.token);
        }
    }
}
