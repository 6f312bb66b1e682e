use alloc::vec;
use alloc::vec::Vec;

use embedded_storage::{ReadStorage, Storage};

use super::layout::ERASED_BYTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlashError {
    OutOfBounds,
    WriteFailed,
}

/// In-memory flash image that starts out erased.
///
/// Backs the region in tests and in the desktop simulator. Writes can be made
/// to fail to exercise commit error paths.
#[derive(Debug, Clone)]
pub struct MemFlash {
    bytes: Vec<u8>,
    fail_writes: bool,
    writes: usize,
}

impl MemFlash {
    pub fn new(capacity: usize) -> Self {
        Self::from_image(vec![ERASED_BYTE; capacity])
    }

    /// Wraps an existing image, e.g. one loaded from disk by the simulator.
    pub fn from_image(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fail_writes: false,
            writes: 0,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, MemFlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(MemFlashError::OutOfBounds)?;
        if end > self.bytes.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ReadStorage for MemFlash {
    type Error = MemFlashError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl Storage for MemFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MemFlashError::WriteFailed);
        }
        let range = self.range(offset, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}
