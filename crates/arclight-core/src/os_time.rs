//! # Monotonic time helpers
//!
//! Fence and buffer waits take nanosecond timeouts that may be relative or
//! absolute. Absolute timeouts are expressed on a process-local monotonic
//! clock so that a deadline computed before a blocking ioctl stays valid
//! across retries.

use std::sync::OnceLock;
use std::time::Instant;

use crate::driver::TIMEOUT_INFINITE;

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Current monotonic time in nanoseconds
pub fn now_ns() -> u64 {
    origin().elapsed().as_nanos() as u64
}

/// Convert a relative timeout to an absolute deadline, saturating at
/// "infinite"
pub fn absolute_timeout(timeout_ns: u64) -> u64 {
    if timeout_ns == TIMEOUT_INFINITE {
        TIMEOUT_INFINITE
    } else {
        now_ns().saturating_add(timeout_ns)
    }
}

/// Remaining nanoseconds until an absolute deadline (0 when passed)
pub fn remaining_ns(abs_deadline: u64) -> u64 {
    if abs_deadline == TIMEOUT_INFINITE {
        TIMEOUT_INFINITE
    } else {
        abs_deadline.saturating_sub(now_ns())
    }
}

/// Has an absolute deadline passed?
pub fn expired(abs_deadline: u64) -> bool {
    abs_deadline != TIMEOUT_INFINITE && now_ns() >= abs_deadline
}
