//! Firmware error types

use thiserror_no_std::Error;

/// Failures talking to the cloud endpoints.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection or request failed")]
    Request,
    #[error("response body could not be read")]
    Body,
    #[error("response body is not UTF-8")]
    Encoding,
    #[error("time server could not be resolved")]
    Dns,
    #[error("UDP socket error")]
    Socket,
    #[error("time server did not answer in time")]
    Timeout,
    #[error("time server answered with an invalid packet")]
    InvalidTime,
}

/// Failures driving the radio.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    #[error("radio rejected the configuration")]
    Config,
    #[error("radio failed to start")]
    Start,
    #[error("scan failed")]
    Scan,
}
