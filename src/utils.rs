use std::time::SystemTime;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Seconds elapsed since `start_ms`. Clock skew towards the future maps to
/// zero rather than a negative duration.
pub fn elapsed_secs_since(start_ms: u64) -> f64 {
    let now = get_epoch_time_in_ms();
    if now < start_ms {
        return 0.0;
    }
    (now - start_ms) as f64 / 1000.0
}
