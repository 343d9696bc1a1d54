//! Monotonic-clock helper.
//!
//! Returns milliseconds since an arbitrary but fixed point, which is the
//! unit the rest of the crate (timers, socket timeouts, the idle loop's
//! wait bound) is built around.
//!
//! See also:
//! - [`crate::timer`] (built on [`monotonic_ms`])
//! - [`crate::hook`] (socket timeouts are millisecond counts)

use std::time::Instant;

use once_cell::sync::Lazy;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since an arbitrary but fixed point captured at process
/// start. Monotonic: never goes backwards, immune to wall-clock adjustment.
///
/// This is the clock [`crate::timer::TimerManager`] is built on. Tests that
/// want to simulate clock rollback do not call this function directly;
/// they go through [`crate::timer::TimerManager::drain_expired_at`], which
/// takes an explicit "now".
#[inline]
pub fn monotonic_ms() -> i64 {
    START.elapsed().as_millis() as i64
}
