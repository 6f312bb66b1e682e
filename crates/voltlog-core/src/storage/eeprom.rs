use embedded_storage::{ReadStorage, Storage};
use log::{debug, error, warn};

use super::layout::{ERASED_BYTE, REGION_SIZE};
use crate::error::StoreError;

/// RAM-shadowed byte region over a flash partition.
///
/// Reads and writes hit the shadow copy. Nothing reaches the backing
/// storage until [`Eeprom::commit`], so a value that was written but not
/// committed is lost on power loss.
pub struct Eeprom<F> {
    flash: F,
    /// Offset of the region inside the backing storage
    base: u32,
    shadow: [u8; REGION_SIZE],
    opened: bool,
    dirty: bool,
}

impl<F> Eeprom<F>
where
    F: ReadStorage + Storage,
{
    pub const fn new(flash: F, base: u32) -> Self {
        Self {
            flash,
            base,
            shadow: [ERASED_BYTE; REGION_SIZE],
            opened: false,
            dirty: false,
        }
    }

    /// Loads the region into RAM. Only the first call has any effect.
    pub fn begin(&mut self) -> Result<(), StoreError> {
        if self.opened {
            return Ok(());
        }

        self.load()?;
        self.opened = true;
        debug!("Opened {} byte region at flash offset {:#x}", REGION_SIZE, self.base);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let range = Self::checked_range(offset, buf.len())?;
        buf.copy_from_slice(&self.shadow[range]);
        Ok(())
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let range = Self::checked_range(offset, data.len())?;
        if self.shadow[range.clone()] != *data {
            self.shadow[range].copy_from_slice(data);
            self.dirty = true;
        }
        Ok(())
    }

    /// Writes pending changes back to flash.
    ///
    /// On failure the shadow is reloaded from flash so later reads see the
    /// last durable contents, not the rejected write.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }

        match self.flash.write(self.base, &self.shadow) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(_) => {
                error!("Flash commit at {:#x} failed", self.base);
                if self.load().is_err() {
                    warn!("Could not reload region after failed commit");
                }
                Err(StoreError::Commit)
            }
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn load(&mut self) -> Result<(), StoreError> {
        self.flash
            .read(self.base, &mut self.shadow)
            .map_err(|_| StoreError::Read)?;
        self.dirty = false;
        Ok(())
    }

    fn checked_range(offset: usize, len: usize) -> Result<core::ops::Range<usize>, StoreError> {
        match offset.checked_add(len) {
            Some(end) if end <= REGION_SIZE => Ok(offset..end),
            _ => Err(StoreError::OutOfBounds { offset, len }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFlash;

    #[test]
    fn test_begin_loads_erased_region() {
        let mut eeprom = Eeprom::new(MemFlash::new(REGION_SIZE), 0);
        assert!(!eeprom.is_open());
        eeprom.begin().unwrap();

        let mut buf = [0u8; 4];
        eeprom.read(100, &mut buf).unwrap();
        assert_eq!(buf, [ERASED_BYTE; 4]);
    }

    #[test]
    fn test_begin_is_one_shot() {
        let mut eeprom = Eeprom::new(MemFlash::new(REGION_SIZE), 0);
        eeprom.begin().unwrap();
        eeprom.write(0, &[1, 2, 3]).unwrap();

        // A second begin must not reload and discard the uncommitted write.
        eeprom.begin().unwrap();
        let mut buf = [0u8; 3];
        eeprom.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_commit_reaches_flash() {
        let mut eeprom = Eeprom::new(MemFlash::new(2 * REGION_SIZE), REGION_SIZE as u32);
        eeprom.begin().unwrap();
        eeprom.write(10, b"abc").unwrap();
        assert_eq!(&eeprom.flash().image()[REGION_SIZE + 10..REGION_SIZE + 13], &[0xFF; 3]);

        eeprom.commit().unwrap();
        assert_eq!(&eeprom.flash().image()[REGION_SIZE + 10..REGION_SIZE + 13], b"abc");
    }

    #[test]
    fn test_failed_commit_rolls_back_shadow() {
        let mut eeprom = Eeprom::new(MemFlash::new(REGION_SIZE), 0);
        eeprom.begin().unwrap();
        eeprom.write(0, b"old").unwrap();
        eeprom.commit().unwrap();

        eeprom.flash_mut().set_fail_writes(true);
        eeprom.write(0, b"new").unwrap();
        assert_eq!(eeprom.commit(), Err(StoreError::Commit));

        let mut buf = [0u8; 3];
        eeprom.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"old");
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut eeprom = Eeprom::new(MemFlash::new(REGION_SIZE), 0);
        eeprom.begin().unwrap();
        let err = eeprom.write(REGION_SIZE - 1, &[0, 0]).unwrap_err();
        assert_eq!(
            err,
            StoreError::OutOfBounds {
                offset: REGION_SIZE - 1,
                len: 2
            }
        );
    }

    #[test]
    fn test_unchanged_write_skips_commit() {
        let mut eeprom = Eeprom::new(MemFlash::new(REGION_SIZE), 0);
        eeprom.begin().unwrap();
        eeprom.write(0, &[ERASED_BYTE; 8]).unwrap();
        eeprom.commit().unwrap();
        assert_eq!(eeprom.flash().write_count(), 0);
    }
}
