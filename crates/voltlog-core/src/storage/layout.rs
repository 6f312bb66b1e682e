//! Byte layout of the non-volatile region.
//!
//! Every persisted value lives at a fixed offset described by a [`Field`].
//! Records are encoded and decoded field by field (little-endian integers,
//! NUL-terminated text), never by reinterpreting raw bytes as structs.
//!
//! ```text
//! 0    ..33    credential SSID      (32 + NUL)
//! 33   ..98    credential password  (64 + NUL)
//! 98   ..128   unused
//! 128  ..132   log entry count      (u32 LE)
//! 132          log has-unsent flag  (0 / 1)
//! 133  ..136   reserved
//! 136  ..2736  log slots            (10 x 260)
//! 2736 ..4096  unused
//! ```

/// Total size of the region opened at boot.
pub const REGION_SIZE: usize = 4096;

/// Byte every cell reads as after an erase.
pub const ERASED_BYTE: u8 = 0xFF;

pub const SSID_MAX_LEN: usize = 32;
pub const PASSWORD_MAX_LEN: usize = 64;

/// Maximum number of outage log entries held before new ones are dropped.
pub const LOG_CAPACITY: usize = 10;
pub const LOG_MESSAGE_MAX_LEN: usize = 255;

/// A named byte range inside the region (or inside a log slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, size: usize) -> Self {
        Self { name, offset, size }
    }

    /// First byte past the field.
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    pub const fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.end()
    }

    /// Same field shifted by `base`, used for fields relative to a log slot.
    pub const fn at(&self, base: usize) -> Self {
        Self::new(self.name, base + self.offset, self.size)
    }

    const fn overlaps(&self, other: &Field) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

pub const CREDENTIAL_SSID: Field = Field::new("credential.ssid", 0, SSID_MAX_LEN + 1);
pub const CREDENTIAL_PASSWORD: Field = Field::new(
    "credential.password",
    CREDENTIAL_SSID.end(),
    PASSWORD_MAX_LEN + 1,
);
pub const CREDENTIAL_RECORD: Field = Field::new(
    "credential",
    CREDENTIAL_SSID.offset,
    CREDENTIAL_SSID.size + CREDENTIAL_PASSWORD.size,
);

pub const LOG_HEADER: Field = Field::new("log.header", 128, 8);
pub const LOG_ENTRY_COUNT: Field = Field::new("log.entry_count", LOG_HEADER.offset, 4);
pub const LOG_HAS_UNSENT: Field = Field::new("log.has_unsent", LOG_ENTRY_COUNT.end(), 1);

/// Slot-relative fields. Shift them with [`Field::at`] and [`log_slot`].
pub const SLOT_TIMESTAMP: Field = Field::new("slot.timestamp", 0, 4);
pub const SLOT_MESSAGE: Field = Field::new("slot.message", SLOT_TIMESTAMP.end(), LOG_MESSAGE_MAX_LEN + 1);
pub const LOG_SLOT_SIZE: usize = SLOT_TIMESTAMP.size + SLOT_MESSAGE.size;

pub const LOG_SLOTS: Field = Field::new("log.slots", LOG_HEADER.end(), LOG_CAPACITY * LOG_SLOT_SIZE);

/// Absolute byte range of slot `index`.
pub const fn log_slot(index: usize) -> Field {
    Field::new("log.slot", LOG_SLOTS.offset + index * LOG_SLOT_SIZE, LOG_SLOT_SIZE)
}

/// Top-level fields, in address order.
pub const FIELDS: [Field; 5] = [
    CREDENTIAL_SSID,
    CREDENTIAL_PASSWORD,
    LOG_ENTRY_COUNT,
    LOG_HAS_UNSENT,
    LOG_SLOTS,
];

const fn fields_are_disjoint() -> bool {
    let mut i = 0;
    while i < FIELDS.len() {
        if FIELDS[i].end() > REGION_SIZE {
            return false;
        }
        let mut j = i + 1;
        while j < FIELDS.len() {
            if FIELDS[i].overlaps(&FIELDS[j]) {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(fields_are_disjoint());
const _: () = assert!(CREDENTIAL_RECORD.end() <= LOG_HEADER.offset);
const _: () = assert!(LOG_HAS_UNSENT.end() <= LOG_HEADER.end());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_record_size() {
        assert_eq!(
            CREDENTIAL_RECORD.size,
            SSID_MAX_LEN + PASSWORD_MAX_LEN + 2,
            "credential record holds both bounds plus two terminators"
        );
        assert_eq!(CREDENTIAL_RECORD.offset, 0);
    }

    #[test]
    fn test_log_slot_size() {
        assert_eq!(LOG_SLOT_SIZE, 4 + LOG_MESSAGE_MAX_LEN + 1);
        assert_eq!(LOG_SLOT_SIZE, 260);
    }

    #[test]
    fn test_slots_follow_header() {
        assert_eq!(log_slot(0).offset, LOG_HEADER.end());
        assert_eq!(log_slot(1).offset, log_slot(0).end());
        assert_eq!(log_slot(LOG_CAPACITY - 1).end(), LOG_SLOTS.end());
        assert!(LOG_SLOTS.end() <= REGION_SIZE);
    }

    #[test]
    fn test_fields_disjoint_and_ordered() {
        for pair in FIELDS.windows(2) {
            assert!(
                pair[0].end() <= pair[1].offset,
                "{} overlaps {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn test_slot_relative_fields() {
        let slot = log_slot(3);
        let message = SLOT_MESSAGE.at(slot.offset);
        assert_eq!(SLOT_TIMESTAMP.at(slot.offset).offset, slot.offset);
        assert_eq!(message.end(), slot.end());
    }
}
