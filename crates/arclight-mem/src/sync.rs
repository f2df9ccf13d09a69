//! # Submission Fences
//!
//! A fence is a reference-counted handle to a future device-side
//! completion point. Fences are minted *before* the kernel submission
//! happens, so they start in a "submission in progress" state and learn
//! their real sequence number only once the (possibly asynchronous)
//! submit call returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arclight_core::driver::{DriverRef, EngineType, FenceDep, TIMEOUT_INFINITE};
use arclight_core::os_time;
use arclight_core::types::GpuAddr;

use crate::block::MemoryBlock;

// =============================================================================
// USER FENCE LOCATION
// =============================================================================

/// A directly mapped 64-bit fence word the CPU may poll without an ioctl.
///
/// Holds the backing page alive for as long as any fence references it.
#[derive(Clone)]
pub struct UserFenceLoc {
    page: Arc<MemoryBlock>,
    offset: u64,
}

impl UserFenceLoc {
    /// Create a location at `offset` into a mapped page
    pub fn new(page: Arc<MemoryBlock>, offset: u64) -> Self {
        debug_assert!(offset + 8 <= page.size().as_bytes());
        Self { page, offset }
    }

    /// GPU address of the fence word
    pub fn va(&self) -> GpuAddr {
        self.page.va().offset(self.offset)
    }

    /// Byte offset within the page
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Kernel handle of the backing page
    pub fn handle(&self) -> arclight_core::types::BufferHandle {
        self.page.handle()
    }

    /// Read the current fence value
    pub fn read(&self) -> u64 {
        match self.page.map() {
            // SAFETY: offset checked against the page size at construction;
            // the page mapping lives as long as `self`.
            Ok(ptr) => unsafe {
                (ptr.as_ptr().add(self.offset as usize) as *const u64).read_volatile()
            },
            Err(_) => 0,
        }
    }
}

// =============================================================================
// FENCE
// =============================================================================

struct FenceState {
    /// The submit ioctl has not returned yet; `seq` is not valid.
    in_progress: bool,
    /// The submission failed; the fence reports signalled so that no
    /// waiter blocks forever.
    error: bool,
    seq: u64,
    user_fence: Option<UserFenceLoc>,
}

struct FenceInner {
    driver: DriverRef,
    ctx_id: u64,
    engine: EngineType,
    /// One-way false→true; once set, waits short-circuit without touching
    /// the kernel.
    signalled: AtomicBool,
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// Reference-counted handle to a future submission completion
#[derive(Clone)]
pub struct SubmitFence {
    inner: Arc<FenceInner>,
}

impl SubmitFence {
    /// Mint a fence for a submission that is about to happen
    pub fn new_pending(driver: DriverRef, ctx_id: u64, engine: EngineType) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                driver,
                ctx_id,
                engine,
                signalled: AtomicBool::new(false),
                state: Mutex::new(FenceState {
                    in_progress: true,
                    error: false,
                    seq: 0,
                    user_fence: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Record the sequence number returned by the kernel. Transitions out
    /// of "submission in progress" exactly once.
    pub fn submitted(&self, seq: u64, user_fence: Option<UserFenceLoc>) {
        let mut st = self.inner.state.lock().unwrap();
        debug_assert!(st.in_progress);
        st.seq = seq;
        st.user_fence = user_fence;
        st.in_progress = false;
        self.inner.cond.notify_all();
    }

    /// Mark the fence signalled without a submission (the flush it was
    /// minted for turned out to be empty).
    pub fn signal_retired(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.in_progress = false;
        self.inner.signalled.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    /// Mark the fence signalled because its submission failed. Existing
    /// and future waiters return immediately.
    pub fn signal_error(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.error = true;
        st.in_progress = false;
        self.inner.signalled.store(true, Ordering::Release);
        self.inner.cond.notify_all();
    }

    /// Context this fence belongs to
    #[inline]
    pub fn ctx_id(&self) -> u64 {
        self.inner.ctx_id
    }

    /// Engine this fence belongs to
    #[inline]
    pub fn engine(&self) -> EngineType {
        self.inner.engine
    }

    /// Does the fence belong to the given queue? Same-queue work is
    /// already ordered by the kernel and needs no explicit dependency.
    #[inline]
    pub fn same_queue(&self, ctx_id: u64, engine: EngineType) -> bool {
        self.inner.ctx_id == ctx_id && self.inner.engine == engine
    }

    /// Two handles to the same fence?
    #[inline]
    pub fn ptr_eq(&self, other: &SubmitFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait for the fence, bounded by `timeout_ns` (relative, or an
    /// absolute monotonic deadline when `absolute` is set).
    ///
    /// Returns true once signalled. A zero, non-absolute timeout never
    /// blocks and, when a user fence word is available, never issues an
    /// ioctl.
    pub fn wait(&self, timeout_ns: u64, absolute: bool) -> bool {
        if self.inner.signalled.load(Ordering::Acquire) {
            return true;
        }

        let deadline = if absolute {
            timeout_ns
        } else {
            os_time::absolute_timeout(timeout_ns)
        };

        // The fence has no sequence number while its submission is still
        // in flight on another thread. Wait for the hand-off first.
        let (seq, user_fence) = {
            let mut st = self.inner.state.lock().unwrap();
            while st.in_progress {
                if os_time::expired(deadline) {
                    return false;
                }
                let wait_ns = os_time::remaining_ns(deadline);
                if wait_ns == TIMEOUT_INFINITE {
                    st = self.inner.cond.wait(st).unwrap();
                } else {
                    let (guard, _) = self
                        .inner
                        .cond
                        .wait_timeout(st, Duration::from_nanos(wait_ns))
                        .unwrap();
                    st = guard;
                }
            }
            if st.error {
                return true;
            }
            (st.seq, st.user_fence.clone())
        };

        // Cheap path: poll the directly mapped fence word.
        if let Some(user) = &user_fence {
            if user.read() >= seq {
                self.inner.signalled.store(true, Ordering::Release);
                return true;
            }
            // No timeout, just a query: skip the ioctl.
            if !absolute && timeout_ns == 0 {
                return false;
            }
        }

        let dep = FenceDep {
            ctx_id: self.inner.ctx_id,
            engine: self.inner.engine,
            seq,
        };
        match self.inner.driver.query_fence(dep, deadline, true) {
            Ok(true) => {
                // Only ever transitions false→true; racing threads agree.
                self.inner.signalled.store(true, Ordering::Release);
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::error!("arclight: fence status query failed: {e}");
                false
            }
        }
    }

    /// Wait (bounded) until the fence has a kernel sequence number.
    ///
    /// Returns the dependency descriptor, or `None` when the fence is
    /// already signalled (including the submission-failure case) and no
    /// dependency is needed. Errors with `Timeout` when the hand-off does
    /// not happen in time.
    pub fn wait_submitted(
        &self,
        timeout_ns: u64,
    ) -> arclight_core::error::Result<Option<FenceDep>> {
        if self.inner.signalled.load(Ordering::Acquire) {
            return Ok(None);
        }
        let deadline = os_time::absolute_timeout(timeout_ns);
        let mut st = self.inner.state.lock().unwrap();
        while st.in_progress {
            if os_time::expired(deadline) {
                return Err(arclight_core::error::Error::Timeout);
            }
            let wait_ns = os_time::remaining_ns(deadline);
            if wait_ns == TIMEOUT_INFINITE {
                st = self.inner.cond.wait(st).unwrap();
            } else {
                let (guard, _) = self
                    .inner
                    .cond
                    .wait_timeout(st, Duration::from_nanos(wait_ns))
                    .unwrap();
                st = guard;
            }
        }
        if st.error {
            return Ok(None);
        }
        Ok(Some(FenceDep {
            ctx_id: self.inner.ctx_id,
            engine: self.inner.engine,
            seq: st.seq,
        }))
    }
}

impl core::fmt::Debug for SubmitFence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("SubmitFence")
            .field("ctx_id", &self.inner.ctx_id)
            .field("engine", &self.inner.engine)
            .field("in_progress", &st.in_progress)
            .field("seq", &st.seq)
            .field("signalled", &self.inner.signalled.load(Ordering::Relaxed))
            .finish()
    }
}

static_assertions::assert_impl_all!(SubmitFence: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use arclight_core::soft::SoftDevice;
    use std::sync::Arc;

    fn driver() -> Arc<SoftDevice> {
        Arc::new(SoftDevice::new())
    }

    #[test]
    fn test_pending_fence_zero_timeout() {
        let dev = driver();
        let fence = SubmitFence::new_pending(dev.clone(), 1, EngineType::Graphics);
        // Submission still in progress: a zero timeout reports not ready
        // without touching the kernel.
        assert!(!fence.wait(0, false));
        assert_eq!(dev.fence_query_count(), 0);
    }

    #[test]
    fn test_error_fence_unblocks_waiters() {
        let dev = driver();
        let fence = SubmitFence::new_pending(dev.clone(), 1, EngineType::Graphics);
        fence.signal_error();
        assert!(fence.wait(0, false));
        assert!(fence.wait(TIMEOUT_INFINITE, false));
        assert_eq!(dev.fence_query_count(), 0);
    }

    #[test]
    fn test_signalled_is_one_way_and_cached() {
        let dev = driver();
        dev.set_manual_completion(true);
        let fence = SubmitFence::new_pending(dev.clone(), 3, EngineType::Compute);
        fence.submitted(1, None);
        assert!(!fence.wait(0, false));

        dev.complete_up_to(3, EngineType::Compute, 1);
        assert!(fence.wait(0, false));
        let queries = dev.fence_query_count();

        // Already signalled: repeated waits never query the kernel again.
        for _ in 0..16 {
            assert!(fence.wait(0, false));
        }
        assert_eq!(dev.fence_query_count(), queries);
    }

    #[test]
    fn test_submission_handoff_across_threads() {
        let dev = driver();
        let fence = SubmitFence::new_pending(dev.clone(), 9, EngineType::Graphics);
        let f2 = fence.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            f2.submitted(1, None);
        });
        // The dependency resolution path waits out the hand-off.
        let dep = fence.wait_submitted(TIMEOUT_INFINITE).unwrap().unwrap();
        assert_eq!(dep.seq, 1);
        t.join().unwrap();
    }

    #[test]
    fn test_wait_submitted_timeout() {
        let dev = driver();
        let fence = SubmitFence::new_pending(dev, 9, EngineType::Graphics);
        assert_eq!(
            fence.wait_submitted(1_000_000).unwrap_err(),
            arclight_core::error::Error::Timeout
        );
    }
}
