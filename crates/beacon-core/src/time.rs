use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix time in milliseconds; 0 if the clock is before the epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock unix time in whole seconds.
pub fn unix_secs() -> u64 {
    unix_millis() / 1000
}
