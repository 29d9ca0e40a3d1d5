//! Timestamp and identifier helpers.
//!
//! All persisted timestamps in Tarsy are microseconds since the Unix epoch
//! (UTC), stored as `i64`. All identifiers are UUIDv4 strings.

use chrono::Utc;

/// Current time as microseconds since the Unix epoch (UTC).
pub fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// Mint a fresh UUIDv4 identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Convert a microsecond timestamp to whole milliseconds.
pub fn us_to_ms(us: i64) -> i64 {
    us / 1_000
}
