use std::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique, increasing request id of the form `<epoch-ms>.<counter>`.
pub fn next_id() -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}", now_ms(), n)
}
