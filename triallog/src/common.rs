//! Small helpers shared across the daemon.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wallclock seconds since the Unix epoch, as an `f64`.
#[must_use]
pub fn wallclock_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
