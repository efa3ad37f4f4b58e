//! Wall clock helpers
//!
//! Record timestamps and TTL expiry bounds are milliseconds since the Unix
//! epoch. Absolute TTLs are configured in minutes.

use std::time::{SystemTime, UNIX_EPOCH};

pub const MILLIS_PER_MINUTE: u64 = 60 * 1000;

/// Current time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch reads as 0.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert an absolute TTL in minutes to milliseconds
pub fn minutes_to_millis(minutes: u64) -> u64 {
    minutes.saturating_mul(MILLIS_PER_MINUTE)
}

/// Expiry bound for an absolute TTL: entries with `ts` below it are expired.
///
/// 0 means "no bound" (TTL disabled, or the clock is earlier than the TTL).
pub fn expire_time(now_ms: u64, ttl_ms: u64) -> u64 {
    if ttl_ms == 0 {
        0
    } else {
        now_ms.saturating_sub(ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_time() {
        assert_eq!(expire_time(10_000, 0), 0);
        assert_eq!(expire_time(10_000, 4_000), 6_000);
        assert_eq!(expire_time(1_000, 4_000), 0);
        assert_eq!(minutes_to_millis(2), 120_000);
        assert!(now_millis() > 1_600_000_000_000);
    }
}
