//! Timestamp helpers.
//!
//! Wire timestamps and event payloads use Unix milliseconds. Session state
//! keeps `SystemTime` and converts at the edges.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::{constants, ProtocolError, Result};

/// Current Unix time in milliseconds
pub fn current_timestamp_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.to_string()))
}

/// Current Unix time in milliseconds, `0` if the clock is before the epoch
pub fn now_millis() -> u64 {
    current_timestamp_millis().unwrap_or_else(|e| {
        warn!(error = %e, "Falling back to zero timestamp");
        0
    })
}

/// Unix milliseconds of `at`
pub fn timestamp_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Whether more than `age` separates `at` from `now`.
///
/// A timestamp in the future of `now` is never considered old.
pub fn is_older_than(at: SystemTime, age: Duration, now: SystemTime) -> bool {
    now.duration_since(at).map(|idle| idle > age).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_millis() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(timestamp_millis(at), 1_700_000_000_123);
        assert_eq!(timestamp_millis(UNIX_EPOCH), 0);
    }

    #[test]
    fn test_current_timestamp_is_recent() {
        #[allow(clippy::unwrap_used)]
        let now = current_timestamp_millis().unwrap();
        // 2020-01-01
        assert!(now > 1_577_836_800_000);
    }

    #[test]
    fn test_is_older_than() {
        let now = SystemTime::now();
        let age = Duration::from_secs(600);

        assert!(is_older_than(now - age - Duration::from_secs(60), age, now));
        assert!(!is_older_than(now, age, now));
        assert!(!is_older_than(now - age, age, now));
        assert!(!is_older_than(now + Duration::from_secs(5), age, now));
    }
}
