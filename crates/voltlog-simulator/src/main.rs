//! Desktop simulator for the voltlog voltage logger.
//!
//! Runs the real `DeviceContext` against an in-memory flash image, a
//! synthetic voltage source and an emulated cloud, on a virtual clock that
//! jumps straight to the next due timer. A simulated hour takes well under a
//! second.
//!
//! # Environment
//!
//! | Variable                | Meaning                                        |
//! |-------------------------|------------------------------------------------|
//! | `RUST_LOG`              | log filter, e.g. `info` or `voltlog_core=debug` |
//! | `VOLTLOG_SIM_MINUTES`   | simulated run length (default 30)              |
//! | `VOLTLOG_FLASH_IMAGE`   | file to load the region from and save it to    |
//! | `FIREBASE_API_KEY`      | cloud settings, placeholders when unset        |
//! | `FIREBASE_DATABASE_URL` |                                                |
//! | `FIREBASE_PATH`         |                                                |

mod fake_cloud;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_futures::block_on;
use log::{error, info, warn};

use voltlog_core::clock::Monotonic;
use voltlog_core::config::{CloudConfig, Config};
use voltlog_core::credentials::BootMode;
use voltlog_core::device::DeviceContext;
use voltlog_core::error::SensorError;
use voltlog_core::portal::Request;
use voltlog_core::sensor::{ADC_MAX_RAW, VoltageSensor};
use voltlog_core::storage::{MemFlash, REGION_SIZE};

use fake_cloud::FakeCloud;

// ---------------------------------------------------------------------------
// Scenario constants
// ---------------------------------------------------------------------------

const DEFAULT_RUN_MINUTES: u64 = 30;

/// Network the simulated user enters in the portal.
const HOME_SSID: &str = "Home-WiFi";
const HOME_PASSWORD: &str = "pass1234";

/// Station link is down between these uptimes (ms).
const OUTAGE_START_MS: u64 = 5 * 60_000;
const OUTAGE_END_MS: u64 = 8 * 60_000;

/// The cloud revokes the session token at this uptime (ms).
const TOKEN_REVOKE_MS: u64 = 12 * 60_000;

// ---------------------------------------------------------------------------
// Virtual time and synthetic input
// ---------------------------------------------------------------------------

/// Virtual monotonic clock advanced by the main loop.
#[derive(Debug, Default)]
pub struct SimClock {
    now_ms: Cell<u64>,
}

impl SimClock {
    fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }
}

impl Monotonic for SimClock {
    fn uptime_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

/// Generates raw ADC counts for a slowly sagging 12 V supply.
struct MockVoltageSource {
    clock: Rc<SimClock>,
}

impl MockVoltageSource {
    fn new(clock: Rc<SimClock>) -> Self {
        Self { clock }
    }
}

impl VoltageSensor for MockVoltageSource {
    async fn read_raw(&mut self) -> Result<u16, SensorError> {
        let t = self.clock.uptime_ms() as f64 / 1000.0;

        // Input: 12 V nominal, 0.8 V swing over ten minutes, small ripple
        let volts = 12.0 + 0.8 * (t / 600.0).sin() + 0.05 * (t / 7.0).cos();

        // Undo the divider, calibration and reference scaling
        let adc_volts = volts / 5.0;
        let raw = adc_volts / 0.91 / (3.3 / 4095.0);
        Ok((raw.round() as u16).min(ADC_MAX_RAW))
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn config_from_env() -> Config {
    let var = |name: &str, fallback: &str| std::env::var(name).unwrap_or_else(|_| fallback.to_string());
    Config {
        cloud: CloudConfig::new(
            &var("FIREBASE_API_KEY", "simulator-api-key"),
            &var("FIREBASE_DATABASE_URL", "https://voltlog-sim.firebaseio.com"),
            &var("FIREBASE_PATH", "/voltage"),
        ),
        ..Config::default()
    }
}

fn run_minutes() -> u64 {
    std::env::var("VOLTLOG_SIM_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RUN_MINUTES)
}

fn load_flash(path: Option<&str>) -> MemFlash {
    let Some(path) = path else {
        return MemFlash::new(REGION_SIZE);
    };

    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == REGION_SIZE => {
            info!("Loaded flash image from {}", path);
            MemFlash::from_image(bytes)
        }
        Ok(bytes) => {
            warn!("Ignoring {} ({} bytes, expected {})", path, bytes.len(), REGION_SIZE);
            MemFlash::new(REGION_SIZE)
        }
        Err(_) => MemFlash::new(REGION_SIZE),
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Submits the portal form the way the config page does.
fn configure_through_portal(device: &mut DeviceContext<MemFlash>, now_ms: u64) -> bool {
    let body = format!("ssid={}&password={}", HOME_SSID, HOME_PASSWORD);
    let head = format!(
        "POST /config HTTP/1.1\r\nHost: 192.168.4.1\r\nContent-Length: {}",
        body.len()
    );
    let request = match Request::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            error!("Portal request rejected: {}", e);
            return false;
        }
    };

    let response = device.handle_request(&request, &body, now_ms, &[]);
    info!("Portal answered {}: {}", response.status_line(), response.body);
    response.restart
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting voltlog simulator");

    let config = config_from_env();
    let image_path = std::env::var("VOLTLOG_FLASH_IMAGE").ok();
    let run_ms = run_minutes() * 60_000;

    let clock = Rc::new(SimClock::default());
    let mut cloud = FakeCloud::new(&config.cloud, clock.clone(), unix_now_ms());
    let mut sensor = MockVoltageSource::new(clock.clone());

    // -----------------------------------------------------------------------
    // Boot, provisioning through the portal if needed
    // -----------------------------------------------------------------------
    let mut device = DeviceContext::new(config.clone(), load_flash(image_path.as_deref()));
    let mut mode = match device.boot() {
        Ok(mode) => mode,
        Err(e) => {
            error!("Boot failed: {}", e);
            return;
        }
    };

    if mode == BootMode::AccessPoint {
        device.access_point_started();
        info!("Access point '{}' up", config.access_point.ssid);

        if !configure_through_portal(&mut device, clock.uptime_ms()) {
            error!("Provisioning failed");
            return;
        }

        info!("Restarting with new credentials");
        device = DeviceContext::new(config.clone(), device.into_flash());
        mode = match device.boot() {
            Ok(mode) => mode,
            Err(e) => {
                error!("Reboot failed: {}", e);
                return;
            }
        };
    }

    match &mode {
        BootMode::Station(creds) => device.station_started(creds.ssid(), true),
        BootMode::AccessPoint => {
            error!("Still no credentials after provisioning");
            return;
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    let mut revoked = false;
    while clock.uptime_ms() < run_ms {
        let now = clock.uptime_ms();
        let station_up = !(OUTAGE_START_MS..OUTAGE_END_MS).contains(&now);
        cloud.reachable = station_up;

        if !revoked && now >= TOKEN_REVOKE_MS {
            cloud.revoke_token();
            revoked = true;
        }

        let report = block_on(device.tick(&mut cloud, &mut sensor, &*clock, station_up));
        if report.start_access_point {
            device.access_point_started();
            info!("Fallback access point '{}' up", config.access_point.ssid);
        }
        if let Some(Ok(key)) = report.upload {
            if let Some(reading) = report.reading.or(device.last_reading()) {
                info!(
                    "t={:>5}s  record {:>2}  {:.2} V",
                    now / 1000,
                    key,
                    reading.input_volts
                );
            }
        }

        clock.advance(device.next_wake_in_ms(clock.uptime_ms()).max(1));
    }

    // -----------------------------------------------------------------------
    // Summary
    // -----------------------------------------------------------------------
    let status = device.status(clock.uptime_ms());
    info!("Final status: {}", status.to_json());
    info!(
        "Cloud holds {} records, {} log batches; {} tokens issued, {} unauthorized responses",
        cloud.records.len(),
        cloud.log_batches.len(),
        cloud.tokens_issued(),
        cloud.unauthorized_responses
    );
    for batch in &cloud.log_batches {
        info!("Log batch: {}", batch);
    }

    if let Some(path) = image_path {
        let flash = device.into_flash();
        match std::fs::write(&path, flash.image()) {
            Ok(()) => info!("Saved flash image to {}", path),
            Err(e) => error!("Could not save flash image to {}: {}", path, e),
        }
    }

    info!("Simulator exiting");
}
