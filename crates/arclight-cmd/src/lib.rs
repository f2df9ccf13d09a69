//! # ARCLIGHT Command Submission
//!
//! Command streams, reference tracking and buffered submission for the
//! Arclight winsys.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Submission Pipeline                           │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │   Command    │    │  Reference   │    │  SubmitContext   │     │
//! │  │   Stream     │───▶│    List      │───▶│ (front ⇄ back)   │     │
//! │  │ (chained     │    │ (dedup hash, │    │                  │     │
//! │  │  chunks)     │    │  residency)  │    └────────┬─────────┘     │
//! │  └──────────────┘    └──────────────┘             │               │
//! │                                          ┌────────▼─────────┐     │
//! │                                          │  SubmitWorker    │     │
//! │                                          │ (one job at a    │     │
//! │                                          │  time, in order) │     │
//! │                                          └────────┬─────────┘     │
//! │                                          ┌────────▼─────────┐     │
//! │                                          │  Kernel driver   │     │
//! │                                          └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission flow
//!
//! 1. The caller reserves space (`check_space`), registers buffers and
//!    writes encoded words into the front stream
//! 2. `flush` pads, finalizes, mints the fence and resolves cross-queue
//!    dependencies
//! 3. Front and back states swap; the kernel submission runs inline or
//!    on the worker while the caller keeps writing
//! 4. The fence learns its sequence number when the submit returns and
//!    is CPU-pollable through the context's user fence page

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod reflist;
pub mod stream;
pub mod submit;
mod worker;

// Re-exports
pub use device::{Device, DeviceConfig};
pub use reflist::{RefEntry, ReferenceList, RelocRecord};
pub use stream::CommandStream;
pub use submit::{FlushFlags, SecondaryStream, StreamKind, SubmitContext};

pub use arclight_core::driver::{BoDomain, BoFlags, BoUsage, EngineType, RefPriority};
pub use arclight_mem::{Bo, SubmitFence};
