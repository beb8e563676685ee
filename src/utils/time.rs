//! Time utilities
//!
//! Safe wall-clock helpers that never panic on clock errors.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Get current Unix timestamp as Duration
///
/// Returns zero duration if system time is before epoch.
pub fn current_timestamp_duration() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using zero duration");
            Duration::from_secs(0)
        })
}

/// Get current Unix timestamp (seconds since epoch)
pub fn current_timestamp() -> u64 {
    current_timestamp_duration().as_secs()
}

/// Get current Unix timestamp in milliseconds, as sent in handshakes
pub fn current_timestamp_millis() -> u64 {
    current_timestamp_duration().as_millis() as u64
}
