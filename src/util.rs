use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the unix epoch.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Days since the unix epoch, used for the daily connection counter key.
pub fn day_index() -> u64 {
    now_ms() / 86_400_000
}

/// Hex string over `bytes` random bytes.
pub fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(buf.as_mut_slice());
    hex::encode(buf)
}
