//! Monotonic and wall-clock time.
//!
//! The device only learns the wall-clock time from the network. Until then
//! every timestamp falls back to seconds since boot.

use alloc::format;
use alloc::string::String;

use log::{debug, warn};
use time::OffsetDateTime;

/// Smallest unix time (seconds) accepted as a real wall-clock reading.
pub const MIN_SANE_EPOCH: u64 = 100_000;

/// Source of milliseconds since boot.
pub trait Monotonic {
    fn uptime_ms(&self) -> u64;
}

/// Wall-clock time anchored to uptime at the moment of the last sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WallClock {
    anchor: Option<Anchor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    unix_ms: u64,
    uptime_ms: u64,
}

impl WallClock {
    pub const fn new() -> Self {
        Self { anchor: None }
    }

    /// Anchors the clock. Implausible readings are ignored and return `false`.
    pub fn set(&mut self, unix_ms: u64, uptime_ms: u64) -> bool {
        if unix_ms / 1000 <= MIN_SANE_EPOCH {
            warn!("Ignoring implausible wall-clock reading {} ms", unix_ms);
            return false;
        }

        self.anchor = Some(Anchor { unix_ms, uptime_ms });
        debug!("Wall clock set to {} ms at uptime {} ms", unix_ms, uptime_ms);
        true
    }

    pub fn is_synced(&self) -> bool {
        self.anchor.is_some()
    }

    /// Current unix time in seconds, if synced.
    pub fn unix_secs(&self, uptime_ms: u64) -> Option<u64> {
        let anchor = self.anchor?;
        let elapsed = uptime_ms.saturating_sub(anchor.uptime_ms);
        let secs = (anchor.unix_ms + elapsed) / 1000;
        (secs > MIN_SANE_EPOCH).then_some(secs)
    }

    /// Timestamp for a log entry: unix seconds when synced, seconds since
    /// boot otherwise.
    pub fn log_timestamp(&self, uptime_ms: u64) -> u32 {
        let secs = self.unix_secs(uptime_ms).unwrap_or(uptime_ms / 1000);
        u32::try_from(secs).unwrap_or(u32::MAX)
    }

    /// `YYYY-MM-DDTHH:MM:SSZ`, if synced.
    pub fn iso8601(&self, uptime_ms: u64) -> Option<String> {
        self.unix_secs(uptime_ms).and_then(format_iso8601)
    }
}

/// Formats unix seconds as an ISO-8601 UTC timestamp.
pub fn format_iso8601(unix_secs: u64) -> Option<String> {
    let secs = i64::try_from(unix_secs).ok()?;
    let t = OffsetDateTime::from_unix_timestamp(secs).ok()?;
    Some(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    ))
}
