// rejourney — session replay for mobile apps
// https://rejourney.co

use chrono::{DateTime, Utc};

/// Epoch milliseconds for a wall-clock timestamp. Pre-1970 clamps to 0.
pub fn epoch_ms(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

/// Current wall clock as epoch milliseconds.
pub fn now_epoch_ms() -> u64 {
    epoch_ms(Utc::now())
}
