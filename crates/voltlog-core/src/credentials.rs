//! Wi-Fi credential record and the boot-time mode decision.
//!
//! The record is two NUL-terminated text fields at the start of the region:
//! SSID (32 bytes + NUL) followed by password (64 bytes + NUL). An erased
//! region reads as `0xFF`, a cleared one as zeros; both mean "absent".

use core::fmt;

use embedded_storage::Storage;
use log::info;

use crate::error::StoreError;
use crate::storage::PersistentStore;
use crate::storage::layout::{
    CREDENTIAL_PASSWORD, CREDENTIAL_RECORD, CREDENTIAL_SSID, ERASED_BYTE, PASSWORD_MAX_LEN,
    SSID_MAX_LEN,
};

pub type Ssid = heapless::String<SSID_MAX_LEN>;
pub type Password = heapless::String<PASSWORD_MAX_LEN>;

/// A network name and password, each truncated to its bound.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct WifiCredentials {
    ssid: Ssid,
    password: Password,
}

impl WifiCredentials {
    /// Truncates each value to its bound (at a character boundary) and at
    /// the first NUL, mirroring what the stored record can hold.
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: bounded(ssid),
            password: bounded(password),
        }
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Both fields non-empty.
    pub fn is_valid(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    /// Returns the size of the encoded record in bytes (98).
    pub const fn size() -> usize {
        CREDENTIAL_RECORD.size
    }

    pub fn to_bytes(&self) -> [u8; CREDENTIAL_RECORD.size] {
        let mut bytes = [0u8; CREDENTIAL_RECORD.size];
        bytes[..self.ssid.len()].copy_from_slice(self.ssid.as_bytes());

        let password_start = CREDENTIAL_PASSWORD.offset;
        bytes[password_start..password_start + self.password.len()]
            .copy_from_slice(self.password.as_bytes());

        // Terminators and the tail of each field are already zero
        bytes
    }

    /// Decodes a stored record. Bytes that are not valid UTF-8 (such as an
    /// erased `0xFF` fill) end the text, so an erased record decodes empty.
    pub fn from_bytes(bytes: &[u8; CREDENTIAL_RECORD.size]) -> Self {
        Self {
            ssid: decode(&bytes[CREDENTIAL_SSID.range()]),
            password: decode(&bytes[CREDENTIAL_PASSWORD.range()]),
        }
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validity check on the raw record.
///
/// Invalid when the first SSID byte is the erase sentinel or NUL. Otherwise
/// both bounded lengths must be in `(0, bound]`.
pub fn record_is_valid(bytes: &[u8; CREDENTIAL_RECORD.size]) -> bool {
    let first = bytes[CREDENTIAL_SSID.offset];
    if first == ERASED_BYTE || first == 0 {
        return false;
    }

    let ssid_len = bounded_len(&bytes[CREDENTIAL_SSID.range()], SSID_MAX_LEN);
    let password_len = bounded_len(&bytes[CREDENTIAL_PASSWORD.range()], PASSWORD_MAX_LEN);

    (1..=SSID_MAX_LEN).contains(&ssid_len) && (1..=PASSWORD_MAX_LEN).contains(&password_len)
}

/// How the radio comes up after reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootMode {
    /// Join the stored network.
    Station(WifiCredentials),
    /// No usable credentials; serve the configuration portal.
    AccessPoint,
}

impl BootMode {
    pub fn select<F: Storage>(store: &mut PersistentStore<F>) -> Result<Self, StoreError> {
        if !store.is_credential_valid() {
            info!("No stored Wi-Fi credentials, starting access point");
            return Ok(Self::AccessPoint);
        }

        let creds = store.read_credential()?;
        if creds.is_valid() {
            Ok(Self::Station(creds))
        } else {
            // Valid bytes that do not decode as text
            info!("Stored Wi-Fi credentials unreadable, starting access point");
            Ok(Self::AccessPoint)
        }
    }
}

fn bounded_len(field: &[u8], bound: usize) -> usize {
    field
        .iter()
        .take(bound)
        .position(|&b| b == 0)
        .unwrap_or(bound.min(field.len()))
}

fn bounded<const N: usize>(value: &str) -> heapless::String<N> {
    let value = value.split('\0').next().unwrap_or("");
    let mut end = value.len().min(N);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = heapless::String::new();
    // `end <= N`, so this cannot overflow
    let _ = out.push_str(&value[..end]);
    out
}

fn decode<const N: usize>(field: &[u8]) -> heapless::String<N> {
    let text = &field[..bounded_len(field, N)];
    let text = match core::str::from_utf8(text) {
        Ok(text) => text,
        Err(e) => core::str::from_utf8(&text[..e.valid_up_to()]).unwrap_or(""),
    };
    bounded(text)
}
