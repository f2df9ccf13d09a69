//! # ARCLIGHT Core
//!
//! Foundational types and the kernel interface boundary for the Arclight
//! GPU winsys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      arclight-core                          │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │   Types     │  │ DeviceDriver │  │  CommandEncoder   │  │
//! │  │ (GpuAddr,   │  │ (ioctl       │  │  (per-generation  │  │
//! │  │  handles)   │  │  transport)  │  │   packet packing) │  │
//! │  └─────────────┘  └──────┬───────┘  └───────────────────┘  │
//! │                          │                                 │
//! │                   ┌──────▼───────┐                         │
//! │                   │  SoftDevice  │  (host-memory driver    │
//! │                   │              │   for tests/bring-up)   │
//! │                   └──────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod driver;
pub mod encode;
pub mod error;
#[cfg(feature = "std")]
pub mod os_time;
#[cfg(feature = "std")]
pub mod soft;
pub mod types;

// Re-exports for convenience
pub use driver::{
    BoDomain, BoFlags, BoUsage, DeviceDriver, DriverRef, EngineType, FenceDep, RefPriority,
    TIMEOUT_INFINITE,
};
pub use encode::{encoder_for, CommandEncoder};
pub use error::{Error, Result};
pub use types::*;
