use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Milliseconds since the Unix epoch, the unit TTLs are stored in.
pub fn now_ms() -> u64 {
    timestamp().as_millis() as u64
}
