use rand::Rng;
use shared::SYNC_TIME_RANGE;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

// Fold a millisecond timestamp onto the shared clock ring
pub fn sync_time(ms: i64) -> i64 {
    ms.rem_euclid(SYNC_TIME_RANGE)
}

// Generate an opaque lowercase hex token
pub fn hex_token<R: Rng>(rng: &mut R, bytes: usize) -> String {
    let mut token = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        token.push_str(&format!("{:02x}", rng.gen::<u8>()));
    }
    token
}
