//! Bounded log of connectivity-loss events kept in the non-volatile region.
//!
//! The log fills slot by slot and stops accepting entries once full; nothing
//! is ever evicted. The whole batch is exported and, once the cloud has
//! acknowledged it, drained in one step.
//!
//! ```text
//! EMPTY --append--> ACCUMULATING --append--> FULL
//!   ^                    |                    |
//!   +------ drain -------+-------- drain -----+
//! ```

use alloc::vec::Vec;

use embedded_storage::Storage;
use log::{debug, info, warn};
use serde::Serialize;

use crate::clock::WallClock;
use crate::error::StoreError;
use crate::storage::PersistentStore;
use crate::storage::layout::{
    LOG_CAPACITY, LOG_ENTRY_COUNT, LOG_HAS_UNSENT, LOG_HEADER, LOG_MESSAGE_MAX_LEN, LOG_SLOT_SIZE,
    SLOT_MESSAGE, SLOT_TIMESTAMP, log_slot,
};

/// Message recorded when the station link drops.
pub const WIFI_DISCONNECT_MESSAGE: &str = "WiFi disconnect";

pub type LogMessage = heapless::String<LOG_MESSAGE_MAX_LEN>;

/// Log bookkeeping stored at offset 128.
///
/// Binary format (little-endian):
/// - entry_count: 4 bytes (u32)
/// - has_unsent: 1 byte (0 or 1)
/// - reserved: 3 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub entry_count: u32,
    pub has_unsent: bool,
}

impl LogHeader {
    pub const EMPTY: Self = Self {
        entry_count: 0,
        has_unsent: false,
    };

    /// Returns the size of the encoded header in bytes (8).
    pub const fn size() -> usize {
        LOG_HEADER.size
    }

    pub fn to_bytes(&self) -> [u8; LOG_HEADER.size] {
        let mut bytes = [0u8; LOG_HEADER.size];
        let count = LOG_ENTRY_COUNT.offset - LOG_HEADER.offset;
        bytes[count..count + LOG_ENTRY_COUNT.size].copy_from_slice(&self.entry_count.to_le_bytes());
        bytes[LOG_HAS_UNSENT.offset - LOG_HEADER.offset] = u8::from(self.has_unsent);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; LOG_HEADER.size]) -> Self {
        let count = LOG_ENTRY_COUNT.offset - LOG_HEADER.offset;
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(&bytes[count..count + LOG_ENTRY_COUNT.size]);

        Self {
            entry_count: u32::from_le_bytes(count_bytes),
            has_unsent: bytes[LOG_HAS_UNSENT.offset - LOG_HEADER.offset] == 1,
        }
    }

    /// `entry_count` fits the capacity. An erased header (`0xFFFF_FFFF`) does not.
    pub fn is_in_range(&self) -> bool {
        self.entry_count as usize <= LOG_CAPACITY
    }

    pub fn state(&self) -> LogState {
        match self.entry_count as usize {
            0 => LogState::Empty,
            n if n >= LOG_CAPACITY => LogState::Full,
            _ => LogState::Accumulating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Empty,
    Accumulating,
    Full,
}

/// One stored event.
///
/// Binary format (little-endian), 260 bytes per slot:
/// - timestamp: 4 bytes (u32, unix seconds or seconds since boot)
/// - message: 256 bytes (255 + NUL)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: u32,
    pub message: LogMessage,
}

impl LogEntry {
    /// Message is cut at 255 bytes (on a character boundary).
    pub fn new(timestamp: u32, message: &str) -> Self {
        let mut end = message.len().min(LOG_MESSAGE_MAX_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let mut text = LogMessage::new();
        let _ = text.push_str(&message[..end]);

        Self {
            timestamp,
            message: text,
        }
    }

    /// Returns the size of one slot in bytes (260).
    pub const fn size() -> usize {
        LOG_SLOT_SIZE
    }

    pub fn to_bytes(&self) -> [u8; LOG_SLOT_SIZE] {
        let mut bytes = [0u8; LOG_SLOT_SIZE];
        bytes[SLOT_TIMESTAMP.range()].copy_from_slice(&self.timestamp.to_le_bytes());

        let message = SLOT_MESSAGE.offset;
        bytes[message..message + self.message.len()].copy_from_slice(self.message.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; LOG_SLOT_SIZE]) -> Self {
        let mut timestamp_bytes = [0u8; 4];
        timestamp_bytes.copy_from_slice(&bytes[SLOT_TIMESTAMP.range()]);

        let field = &bytes[SLOT_MESSAGE.range()];
        let len = field
            .iter()
            .take(LOG_MESSAGE_MAX_LEN)
            .position(|&b| b == 0)
            .unwrap_or(LOG_MESSAGE_MAX_LEN);
        let text = match core::str::from_utf8(&field[..len]) {
            Ok(text) => text,
            Err(e) => core::str::from_utf8(&field[..e.valid_up_to()]).unwrap_or(""),
        };

        Self::new(u32::from_le_bytes(timestamp_bytes), text)
    }
}

/// Exported log contents, serialized as the outbound `logs` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogBatch {
    pub logs: Vec<LogEntry>,
    pub count: u32,
    /// Export time in unix seconds, `0` while the clock is unsynced
    pub timestamp: u64,
}

/// Borrowed view of the outage log inside a [`PersistentStore`].
pub struct OutageLog<'a, F> {
    store: &'a mut PersistentStore<F>,
}

impl<'a, F: Storage> OutageLog<'a, F> {
    pub(crate) fn new(store: &'a mut PersistentStore<F>) -> Self {
        Self { store }
    }

    /// Repairs a missing or corrupt header to EMPTY.
    ///
    /// Returns the header in effect afterwards.
    pub fn init(&mut self) -> Result<LogHeader, StoreError> {
        let header = self.header()?;
        if header.is_in_range() {
            if header.entry_count > 0 {
                info!("Outage log holds {} unsent entries", header.entry_count);
            }
            return Ok(header);
        }

        info!(
            "Initializing outage log (stored count {:#x} out of range)",
            header.entry_count
        );
        self.write_header(LogHeader::EMPTY)?;
        Ok(LogHeader::EMPTY)
    }

    pub fn header(&mut self) -> Result<LogHeader, StoreError> {
        let mut bytes = [0u8; LOG_HEADER.size];
        self.store.read_field(LOG_HEADER, &mut bytes)?;
        Ok(LogHeader::from_bytes(&bytes))
    }

    pub fn state(&mut self) -> Result<LogState, StoreError> {
        Ok(self.header()?.state())
    }

    /// Records `message` in the next free slot.
    ///
    /// Returns `Ok(false)` without touching the store when the log is full.
    pub fn append(
        &mut self,
        message: &str,
        clock: &WallClock,
        uptime_ms: u64,
    ) -> Result<bool, StoreError> {
        let header = self.header()?;
        if header.entry_count as usize >= LOG_CAPACITY {
            warn!("Outage log full, dropping '{}'", message);
            return Ok(false);
        }

        let entry = LogEntry::new(clock.log_timestamp(uptime_ms), message);
        let slot = log_slot(header.entry_count as usize);
        self.store.write_field(slot, &entry.to_bytes())?;

        let header = LogHeader {
            entry_count: header.entry_count + 1,
            has_unsent: true,
        };
        self.write_header(header)?;

        debug!(
            "Logged '{}' at {} into slot {}",
            entry.message,
            entry.timestamp,
            header.entry_count - 1
        );
        Ok(true)
    }

    pub fn has_pending(&mut self) -> bool {
        match self.header() {
            Ok(header) => header.has_unsent && header.entry_count > 0,
            Err(e) => {
                warn!("Outage log header unreadable: {}", e);
                false
            }
        }
    }

    pub fn len(&mut self) -> Result<usize, StoreError> {
        Ok((self.header()?.entry_count as usize).min(LOG_CAPACITY))
    }

    pub fn is_empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Reads every stored entry in insertion order. Does not modify the log.
    pub fn export(&mut self, exported_at: u64) -> Result<LogBatch, StoreError> {
        let count = self.len()?;
        let mut logs = Vec::with_capacity(count);
        for index in 0..count {
            let mut bytes = [0u8; LOG_SLOT_SIZE];
            self.store.read_field(log_slot(index), &mut bytes)?;
            logs.push(LogEntry::from_bytes(&bytes));
        }

        Ok(LogBatch {
            logs,
            count: count as u32,
            timestamp: exported_at,
        })
    }

    /// Resets the header to EMPTY. Call only after the exported batch was
    /// acknowledged; the entries cannot be recovered afterwards.
    pub fn drain(&mut self) -> Result<(), StoreError> {
        if self.header()? == LogHeader::EMPTY {
            return Ok(());
        }
        self.write_header(LogHeader::EMPTY)?;
        info!("Outage log drained");
        Ok(())
    }

    fn write_header(&mut self, header: LogHeader) -> Result<(), StoreError> {
        self.store.write_field(LOG_HEADER, &header.to_bytes())?;
        self.store.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemFlash, REGION_SIZE};
    use alloc::format;

    fn store() -> PersistentStore<MemFlash> {
        let mut store = PersistentStore::new(MemFlash::new(REGION_SIZE));
        store.outage_log().init().unwrap();
        store
    }

    #[test]
    fn test_header_size() {
        assert_eq!(LogHeader::size(), 8);
        assert_eq!(LogEntry::size(), 260);
    }

    #[test]
    fn test_init_repairs_erased_header() {
        let mut store = PersistentStore::new(MemFlash::new(REGION_SIZE));
        let raw = store.outage_log().header().unwrap();
        assert_eq!(raw.entry_count, u32::MAX);
        assert!(!raw.is_in_range());

        assert_eq!(store.outage_log().init().unwrap(), LogHeader::EMPTY);
        assert_eq!(store.outage_log().header().unwrap(), LogHeader::EMPTY);
    }

    #[test]
    fn test_init_keeps_valid_header() {
        let mut store = store();
        let clock = WallClock::new();
        store.outage_log().append("one", &clock, 5_000).unwrap();

        let mut reopened = PersistentStore::new(store.into_flash());
        let header = reopened.outage_log().init().unwrap();
        assert_eq!(header.entry_count, 1);
        assert!(header.has_unsent);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut store = store();
        let clock = WallClock::new();
        let mut log = store.outage_log();

        for i in 0..LOG_CAPACITY {
            assert!(log.append(&format!("event {i}"), &clock, 1_000).unwrap());
        }
        assert_eq!(log.state().unwrap(), LogState::Full);

        assert!(!log.append("overflow", &clock, 1_000).unwrap());
        assert_eq!(log.header().unwrap().entry_count as usize, LOG_CAPACITY);

        let batch = log.export(0).unwrap();
        assert!(batch.logs.iter().all(|e| e.message.as_str() != "overflow"));
        assert_eq!(batch.logs[0].message.as_str(), "event 0");
    }

    #[test]
    fn test_state_transitions() {
        let mut store = store();
        let clock = WallClock::new();
        let mut log = store.outage_log();

        assert_eq!(log.state().unwrap(), LogState::Empty);
        log.append("a", &clock, 0).unwrap();
        assert_eq!(log.state().unwrap(), LogState::Accumulating);
        log.drain().unwrap();
        assert_eq!(log.state().unwrap(), LogState::Empty);
    }

    #[test]
    fn test_drain_on_empty_is_noop() {
        let mut store = store();
        let writes = store.eeprom().flash().write_count();

        store.outage_log().drain().unwrap();
        assert_eq!(store.outage_log().header().unwrap(), LogHeader::EMPTY);
        assert!(!store.outage_log().has_pending());
        assert_eq!(store.eeprom().flash().write_count(), writes);
    }

    #[test]
    fn test_export_does_not_mutate() {
        let mut store = store();
        let clock = WallClock::new();
        store.outage_log().append("x", &clock, 0).unwrap();
        let before = store.eeprom().flash().image().to_vec();

        let first = store.outage_log().export(11).unwrap();
        let second = store.outage_log().export(11).unwrap();

        assert_eq!(first, second);
        assert!(store.outage_log().has_pending());
        assert_eq!(store.eeprom().flash().image(), before.as_slice());
    }

    #[test]
    fn test_export_drain_scenario() {
        let mut store = store();
        let clock = WallClock::new();

        for i in 0..10u64 {
            let appended = store
                .outage_log()
                .append(&format!("e{i}"), &clock, (i + 1) * 1_000)
                .unwrap();
            assert!(appended);
        }

        let batch = store.outage_log().export(0).unwrap();
        assert_eq!(batch.count, 10);
        for (i, entry) in batch.logs.iter().enumerate() {
            assert_eq!(entry.message.as_str(), format!("e{i}"));
            // Unsynced clock falls back to seconds since boot
            assert_eq!(entry.timestamp, i as u32 + 1);
        }

        store.outage_log().drain().unwrap();
        assert!(!store.outage_log().has_pending());
        assert_eq!(store.outage_log().len().unwrap(), 0);
    }

    #[test]
    fn test_append_uses_wall_clock_when_synced() {
        let mut store = store();
        let mut clock = WallClock::new();
        clock.set(1_700_000_000_000, 0);

        store.outage_log().append("synced", &clock, 2_000).unwrap();
        let batch = store.outage_log().export(0).unwrap();
        assert_eq!(batch.logs[0].timestamp, 1_700_000_002);
    }

    #[test]
    fn test_long_message_truncated() {
        let entry = LogEntry::new(1, &"m".repeat(300));
        assert_eq!(entry.message.len(), LOG_MESSAGE_MAX_LEN);

        let decoded = LogEntry::from_bytes(&entry.to_bytes());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_batch_json_shape() {
        let batch = LogBatch {
            logs: alloc::vec![LogEntry::new(42, "WiFi disconnect")],
            count: 1,
            timestamp: 0,
        };
        let json = serde_json::to_string(&batch).unwrap();
        assert_eq!(
            json,
            r#"{"logs":[{"timestamp":42,"message":"WiFi disconnect"}],"count":1,"timestamp":0}"#
        );
    }
}
