//! ESP32-C3 glue for the voltlog voltage logger.
//!
//! The core crate owns every decision; this crate only binds it to the
//! hardware: the flash region, the ADC pin, the radio, the HTTPS client and
//! the portal's TCP listener.

#![no_std]

extern crate alloc;

pub mod clock;
pub mod cloud_link;
pub mod dhcp;
pub mod error;
pub mod portal_server;
pub mod sensor;
pub mod sntp;
pub mod wifi;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use esp_storage::FlashStorage;
use voltlog_core::device::DeviceContext;

/// Device state shared by the main cycle and the portal server.
pub type SharedDevice = Mutex<CriticalSectionRawMutex, DeviceContext<FlashStorage<'static>>>;

/// Radio shared by the main cycle and the portal's `/scan` handler.
pub type SharedRadio = Mutex<CriticalSectionRawMutex, wifi::Radio>;
