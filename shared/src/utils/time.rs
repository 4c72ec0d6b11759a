//! Time-related utilities

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current system time in nanoseconds since UNIX epoch
pub fn system_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed since `start_ns` (a value from [`system_time_nanos`])
pub fn elapsed_ms(start_ns: u64) -> u64 {
    system_time_nanos().saturating_sub(start_ns) / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time() {
        let nanos = system_time_nanos();
        assert!(nanos > 1_600_000_000 * 1_000_000_000); // After 2020
        assert!(elapsed_ms(nanos) < 60_000);
    }
}
