//! Hardware-independent core library for voltlog
//!
//! This crate holds the platform-agnostic logic of the voltage logger: the
//! non-volatile layout shared by the Wi-Fi credentials and the outage log, the
//! cloud session and telemetry uploader, voltage scaling, the periodic
//! scheduler and the configuration portal routing.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! ESP32-C3 firmware and desktop hosts (for the simulator and tests).

#![no_std]
#![allow(async_fn_in_trait, reason = "single-threaded embedded executor")]

extern crate alloc;

pub mod clock;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod outage_log;
pub mod portal;
pub mod scheduler;
pub mod sensor;
pub mod session;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
mod testing;
