use embassy_time::Instant;
use voltlog_core::clock::Monotonic;

/// Uptime from the embassy time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Monotonic for EmbassyClock {
    fn uptime_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}
