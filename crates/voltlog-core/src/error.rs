//! Error types shared across the voltlog core

use thiserror_no_std::Error;

/// Failures of the non-volatile region.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("non-volatile region could not be read")]
    Read,
    #[error("non-volatile commit failed")]
    Commit,
    #[error("access of {len} bytes at offset {offset} is outside the region")]
    OutOfBounds { offset: usize, len: usize },
}

/// Failures of the authentication exchange.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication request could not be delivered")]
    Transport,
    #[error("authentication rejected with status {0}")]
    Rejected(u16),
    #[error("authentication response was malformed")]
    Malformed,
}

/// Outcome of a failed upload attempt.
///
/// None of these are fatal: the caller skips the cycle and the next scheduled
/// send tries again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("no valid session: {0}")]
    Auth(AuthError),
    #[error("credential rejected again after refresh")]
    Unauthorized,
    #[error("remote rejected payload with status {status}")]
    Rejected { status: u16 },
    #[error("payload could not be serialized")]
    Serialize,
    #[error("request could not be delivered")]
    Transport,
    #[error("outage log unavailable: {0}")]
    Storage(StoreError),
}

impl From<AuthError> for UploadError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

impl From<StoreError> for UploadError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("ADC read failed")]
    ReadError,
}
