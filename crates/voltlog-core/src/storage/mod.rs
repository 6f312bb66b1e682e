//! Non-volatile region shared by the Wi-Fi credential record and the outage log.

mod eeprom;
pub mod layout;
mod mem_flash;

pub use eeprom::Eeprom;
pub use layout::{Field, REGION_SIZE};
pub use mem_flash::{MemFlash, MemFlashError};

use embedded_storage::Storage;
use log::{info, warn};

use crate::credentials::{self, WifiCredentials};
use crate::error::StoreError;
use crate::outage_log::OutageLog;
use layout::CREDENTIAL_RECORD;

/// Owner of the persistent layout.
///
/// Every accessor opens the region on first use, so callers never observe an
/// unopened store. All writes are committed before the call returns.
pub struct PersistentStore<F> {
    eeprom: Eeprom<F>,
}

impl<F: Storage> PersistentStore<F> {
    /// Region placed at the start of `flash`.
    pub const fn new(flash: F) -> Self {
        Self::with_base(flash, 0)
    }

    pub const fn with_base(flash: F, base: u32) -> Self {
        Self {
            eeprom: Eeprom::new(flash, base),
        }
    }

    /// Opens the region. Idempotent.
    pub fn initialize(&mut self) -> Result<(), StoreError> {
        self.eeprom.begin()
    }

    pub fn read_credential(&mut self) -> Result<WifiCredentials, StoreError> {
        let bytes = self.read_record()?;
        Ok(WifiCredentials::from_bytes(&bytes))
    }

    /// Stores the pair truncated to its bounds and commits it.
    ///
    /// Returns the value as it was persisted.
    pub fn write_credential(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> Result<WifiCredentials, StoreError> {
        let creds = WifiCredentials::new(ssid, password);
        self.write_field(CREDENTIAL_RECORD, &creds.to_bytes())?;
        self.commit()?;
        info!(
            "Stored Wi-Fi credentials for '{}' (password {} bytes)",
            creds.ssid(),
            creds.password().len()
        );
        Ok(creds)
    }

    /// `false` for an erased, cleared or unreadable record.
    pub fn is_credential_valid(&mut self) -> bool {
        match self.read_record() {
            Ok(bytes) => credentials::record_is_valid(&bytes),
            Err(e) => {
                warn!("Credential record unreadable: {}", e);
                false
            }
        }
    }

    pub fn clear_credential(&mut self) -> Result<(), StoreError> {
        self.write_field(CREDENTIAL_RECORD, &[0u8; CREDENTIAL_RECORD.size])?;
        self.commit()?;
        info!("Cleared Wi-Fi credentials");
        Ok(())
    }

    /// View of the outage log stored in this region.
    pub fn outage_log(&mut self) -> OutageLog<'_, F> {
        OutageLog::new(self)
    }

    pub fn eeprom(&self) -> &Eeprom<F> {
        &self.eeprom
    }

    pub fn eeprom_mut(&mut self) -> &mut Eeprom<F> {
        &mut self.eeprom
    }

    pub fn into_flash(self) -> F {
        self.eeprom.into_inner()
    }

    pub(crate) fn read_field(&mut self, field: Field, buf: &mut [u8]) -> Result<(), StoreError> {
        self.initialize()?;
        self.eeprom.read(field.offset, &mut buf[..field.size])
    }

    pub(crate) fn write_field(&mut self, field: Field, data: &[u8]) -> Result<(), StoreError> {
        self.initialize()?;
        self.eeprom.write(field.offset, &data[..field.size])
    }

    pub(crate) fn commit(&mut self) -> Result<(), StoreError> {
        self.eeprom.commit()
    }

    fn read_record(&mut self) -> Result<[u8; CREDENTIAL_RECORD.size], StoreError> {
        let mut bytes = [0u8; CREDENTIAL_RECORD.size];
        self.read_field(CREDENTIAL_RECORD, &mut bytes)?;
        Ok(bytes)
    }
}
