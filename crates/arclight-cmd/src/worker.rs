//! # Background Submit Worker
//!
//! One worker thread per submission context, consuming at most one
//! kernel-submit job at a time. Submissions for one context are therefore
//! never reordered; contexts run their workers independently of each
//! other.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use arclight_core::driver::EngineType;
use arclight_mem::UserFenceLoc;

use crate::device::DeviceShared;
use crate::submit::{submit_job, CsState};

// =============================================================================
// FLUSH SLOT
// =============================================================================

struct SlotInner {
    /// A job has been handed to the worker and has not come back yet
    outstanding: bool,
    /// The reset state returned by the worker
    returned: Option<CsState>,
}

/// Hand-off point between a context and its worker.
///
/// The context marks a state outstanding before enqueueing it; the worker
/// puts the reset state back and wakes any `sync_flush` waiter.
pub(crate) struct FlushSlot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl FlushSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                outstanding: false,
                returned: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn mark_outstanding(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.outstanding, "one job in flight per context");
        inner.outstanding = true;
    }

    pub(crate) fn put(&self, state: CsState) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.returned.is_none());
        inner.returned = Some(state);
        inner.outstanding = false;
        self.cond.notify_all();
    }

    /// Block until no job is in flight, taking back the returned state
    /// if there is one.
    pub(crate) fn wait_and_take(&self) -> Option<CsState> {
        let mut inner = self.inner.lock().unwrap();
        while inner.outstanding {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.returned.take()
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Per-context background submitter
pub(crate) struct SubmitWorker {
    tx: Option<Sender<CsState>>,
    thread: Option<JoinHandle<()>>,
}

impl SubmitWorker {
    pub(crate) fn spawn(
        device: Arc<DeviceShared>,
        ctx_id: u64,
        engine: EngineType,
        user_fence: Option<UserFenceLoc>,
        slot: Arc<FlushSlot>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = channel::<CsState>();
        let thread = std::thread::Builder::new()
            .name(format!("arclight-cs-{ctx_id}"))
            .spawn(move || {
                while let Ok(state) = rx.recv() {
                    let state = submit_job(&device, ctx_id, engine, user_fence.clone(), state);
                    slot.put(state);
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn enqueue(&self, state: CsState) {
        self.tx
            .as_ref()
            .expect("worker already shut down")
            .send(state)
            .expect("submit worker died");
    }
}

impl Drop for SubmitWorker {
    fn drop(&mut self) {
        // Closing the channel ends the loop; join so no job outlives the
        // context.
        self.tx.take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
