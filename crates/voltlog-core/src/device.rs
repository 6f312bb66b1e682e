//! The device context: everything the logger mutates at runtime.
//!
//! [`DeviceContext`] owns the persistent store, the uploader (with its
//! session and record counter), the scheduler timers and the network view.
//! The firmware and the simulator drive it through [`DeviceContext::tick`]
//! and [`DeviceContext::handle_request`].

use alloc::string::{String, ToString};

use embedded_storage::Storage;
use log::{debug, error, info, warn};

use crate::clock::Monotonic;
use crate::cloud::CloudLink;
use crate::config::Config;
use crate::credentials::BootMode;
use crate::error::{SensorError, StoreError, UploadError};
use crate::outage_log::WIFI_DISCONNECT_MESSAGE;
use crate::portal::{
    CloudStatus, ConfigSubmission, PortalResponse, Request, Route, ScanEntry, StatusReport,
    TimeStatus, TimingStatus, VoltageStatus, WifiStatus, scan_json,
};
use crate::scheduler::Scheduler;
use crate::sensor::{VoltageReading, VoltageScale, VoltageSensor};
use crate::storage::PersistentStore;
use crate::telemetry::Uploader;

/// What the radio is doing, as far as the cycle knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    /// Network joined at boot, if any
    pub station_ssid: Option<String>,
    pub connected: bool,
    /// Configuration access point is up
    pub access_point: bool,
}

/// Observable outcome of one [`DeviceContext::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub reading: Option<VoltageReading>,
    pub sensor_error: Option<SensorError>,
    /// The station link was found down on this tick
    pub link_lost: bool,
    pub link_restored: bool,
    /// The caller should bring up the configuration access point
    pub start_access_point: bool,
    pub logs: Option<Result<usize, UploadError>>,
    pub upload: Option<Result<u8, UploadError>>,
}

pub struct DeviceContext<F> {
    config: Config,
    store: PersistentStore<F>,
    uploader: Uploader,
    scheduler: Scheduler,
    scale: VoltageScale,
    network: NetworkState,
    last_reading: Option<VoltageReading>,
}

impl<F: Storage> DeviceContext<F> {
    pub fn new(config: Config, flash: F) -> Self {
        Self::with_store(config, PersistentStore::new(flash))
    }

    /// Context over a store placed somewhere other than the start of flash.
    pub fn with_store(config: Config, store: PersistentStore<F>) -> Self {
        let uploader = Uploader::new(config.cloud.clone(), &config.timing);
        let scheduler = Scheduler::new(&config.timing);
        let scale = VoltageScale::new(&config.sensor);

        Self {
            config,
            store,
            uploader,
            scheduler,
            scale,
            network: NetworkState::default(),
            last_reading: None,
        }
    }

    /// Opens the store, repairs the outage log header and decides how the
    /// radio should come up.
    pub fn boot(&mut self) -> Result<BootMode, StoreError> {
        self.store.initialize()?;
        self.store.outage_log().init()?;

        let mode = BootMode::select(&mut self.store)?;
        match &mode {
            BootMode::Station(creds) => info!("Stored network '{}' found", creds.ssid()),
            BootMode::AccessPoint => info!("No usable credentials, configuration portal needed"),
        }
        Ok(mode)
    }

    /// Records the outcome of the boot-time station connect.
    pub fn station_started(&mut self, ssid: &str, connected: bool) {
        self.network.station_ssid = Some(ssid.to_string());
        self.network.connected = connected;
        if connected {
            info!("Joined '{}'", ssid);
        } else {
            warn!("Could not join '{}'", ssid);
        }
    }

    pub fn access_point_started(&mut self) {
        self.network.access_point = true;
    }

    /// Runs whatever is due: link check, sampling, then delivery.
    pub async fn tick<L, S, C>(
        &mut self,
        link: &mut L,
        sensor: &mut S,
        clock: &C,
        station_up: bool,
    ) -> TickReport
    where
        L: CloudLink,
        S: VoltageSensor,
        C: Monotonic,
    {
        let mut report = TickReport::default();
        let plan = self.scheduler.plan(clock.uptime_ms());

        if plan.check_wifi {
            if self.network.station_ssid.is_some() {
                self.check_link(station_up, clock.uptime_ms(), &mut report);
            }
            self.scheduler.wifi_check.mark(clock.uptime_ms());
        }

        // Offline and no portal yet: ask for the access point fallback
        if !self.network.connected && !self.network.access_point {
            report.start_access_point = true;
        }

        if plan.sample {
            match sensor.read_raw().await {
                Ok(raw) => {
                    let reading = self.scale.convert(raw);
                    debug!(
                        "Raw {} -> ADC {:.3} V -> input {:.2} V",
                        reading.raw, reading.adc_volts, reading.input_volts
                    );
                    self.last_reading = Some(reading);
                    report.reading = Some(reading);
                }
                Err(e) => {
                    warn!("Sensor read failed: {}", e);
                    self.last_reading = None;
                    report.sensor_error = Some(e);
                }
            }
            self.scheduler.sample.mark(clock.uptime_ms());
        }

        if self.network.connected && plan.send {
            match self.last_reading {
                Some(reading) => self.deliver(link, clock, &reading, &mut report).await,
                None => {
                    debug!("No fresh reading to send");
                    self.defer_send(clock.uptime_ms());
                }
            }
        }

        report
    }

    fn check_link(&mut self, station_up: bool, now_ms: u64, report: &mut TickReport) {
        match (self.network.connected, station_up) {
            (true, false) => {
                error!("Wi-Fi link lost");
                self.network.connected = false;
                report.link_lost = true;

                let wall_clock = *self.uploader.session().wall_clock();
                match self
                    .store
                    .outage_log()
                    .append(WIFI_DISCONNECT_MESSAGE, &wall_clock, now_ms)
                {
                    Ok(true) => {}
                    Ok(false) => warn!("Disconnect not recorded, outage log full"),
                    Err(e) => error!("Disconnect not recorded: {}", e),
                }
            }
            (false, true) => {
                info!("Wi-Fi link restored");
                self.network.connected = true;
                report.link_restored = true;
            }
            _ => {}
        }
    }

    async fn deliver<L, C>(
        &mut self,
        link: &mut L,
        clock: &C,
        reading: &VoltageReading,
        report: &mut TickReport,
    ) where
        L: CloudLink,
        C: Monotonic,
    {
        if self.store.outage_log().has_pending() {
            let result = self
                .uploader
                .send_logs(link, clock, &mut self.store)
                .await;
            if let Err(e) = &result {
                warn!("Outage log upload failed: {}", e);
            }
            report.logs = Some(result);
        }

        let result = self.uploader.send_reading(link, clock, reading).await;
        match &result {
            Ok(_) => self.scheduler.send.mark(clock.uptime_ms()),
            Err(e) => {
                warn!("Reading upload failed, retrying after next sample: {}", e);
                self.defer_send(clock.uptime_ms());
            }
        }
        report.upload = Some(result);
    }

    fn defer_send(&mut self, now_ms: u64) {
        let delay_ms = self.config.timing.sample_interval_ms;
        self.scheduler.send.defer(now_ms, delay_ms);
    }

    /// Answers one portal request. `networks` is the latest scan result.
    pub fn handle_request(
        &mut self,
        request: &Request<'_>,
        body: &str,
        now_ms: u64,
        networks: &[ScanEntry],
    ) -> PortalResponse {
        debug!("Portal {} {}", request.method, request.target);
        match request.route() {
            Route::Page => PortalResponse::page(),
            Route::Config => self.save_credentials(body),
            Route::Scan => PortalResponse::json(scan_json(networks)),
            Route::Status => PortalResponse::json(self.status(now_ms).to_json()),
            Route::NotFound => {
                info!("Not found: {}", request.target);
                PortalResponse::not_found()
            }
        }
    }

    fn save_credentials(&mut self, form: &str) -> PortalResponse {
        let Some(submission) = ConfigSubmission::parse(form) else {
            warn!("Config submission without ssid or password");
            return PortalResponse::missing_params();
        };

        info!(
            "Saving network '{}' (password length {})",
            submission.ssid,
            submission.password.len()
        );
        match self
            .store
            .write_credential(&submission.ssid, &submission.password)
        {
            Ok(stored) => {
                info!("Stored SSID reads back as '{}'", stored.ssid());
                PortalResponse::saved()
            }
            Err(e) => {
                error!("Saving credentials failed: {}", e);
                PortalResponse::storage_failed()
            }
        }
    }

    pub fn status(&mut self, now_ms: u64) -> StatusReport {
        let session = self.uploader.session();
        let wall_clock = session.wall_clock();
        let cloud = CloudStatus {
            authenticated: session.is_valid_at(now_ms),
            token_remaining_s: session
                .session()
                .map_or(0, |s| s.remaining_ms(now_ms) / 1000),
            last_record: self.uploader.counter().last(),
            pending_logs: 0,
        };
        let time = TimeStatus {
            synced: wall_clock.is_synced(),
            utc_time: wall_clock.iso8601(now_ms),
        };

        let pending_logs = if self.store.outage_log().has_pending() {
            self.store.outage_log().len().unwrap_or(0)
        } else {
            0
        };

        StatusReport {
            device: self.config.cloud.device_id.clone(),
            uptime_s: now_ms / 1000,
            voltage: self.last_reading.map(|r| VoltageStatus {
                volts: r.input_volts,
                adc_volts: r.adc_volts,
                raw: r.raw,
            }),
            wifi: WifiStatus {
                mode: if self.network.access_point {
                    "access_point"
                } else {
                    "station"
                },
                connected: self.network.connected,
                ssid: self.network.station_ssid.clone(),
            },
            cloud: CloudStatus {
                pending_logs,
                ..cloud
            },
            time,
            timing: TimingStatus {
                send_interval_ms: self.config.timing.send_interval_ms,
                sample_interval_ms: self.config.timing.sample_interval_ms,
                next_due_ms: self.next_wake_in_ms(now_ms),
            },
        }
    }

    /// How long the cycle may sleep before the next timer is due.
    pub fn next_wake_in_ms(&self, now_ms: u64) -> u64 {
        self.scheduler.next_due_in_ms(now_ms, self.network.connected)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    pub fn last_reading(&self) -> Option<VoltageReading> {
        self.last_reading
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn store_mut(&mut self) -> &mut PersistentStore<F> {
        &mut self.store
    }

    pub fn into_flash(self) -> F {
        self.store.into_flash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::WifiCredentials;
    use crate::storage::{MemFlash, REGION_SIZE};
    use crate::testing::{FakeSensor, ManualClock, ScriptedLink, cloud_config};
    use alloc::vec;
    use embassy_futures::block_on;

    fn config() -> Config {
        Config {
            cloud: cloud_config(),
            ..Config::default()
        }
    }

    fn device() -> DeviceContext<MemFlash> {
        let mut device = DeviceContext::new(config(), MemFlash::new(REGION_SIZE));
        device.boot().unwrap();
        device
    }

    fn connected_device() -> DeviceContext<MemFlash> {
        let mut device = device();
        device.station_started("Home-WiFi", true);
        device
    }

    fn request(method: &'static str, target: &'static str) -> Request<'static> {
        Request {
            method,
            target,
            content_length: None,
        }
    }

    #[test]
    fn test_fresh_device_boots_into_portal() {
        let mut device = DeviceContext::new(config(), MemFlash::new(REGION_SIZE));
        assert_eq!(device.boot(), Ok(BootMode::AccessPoint));

        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[1000]);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, false));
        assert!(report.start_access_point);
        assert!(report.reading.is_some());
        assert!(link.requests.is_empty());
    }

    #[test]
    fn test_portal_saves_credentials_for_next_boot() {
        let mut device = device();
        let response = device.handle_request(
            &request("POST", "/config"),
            "ssid=Home-WiFi&password=pass1234",
            0,
            &[],
        );
        assert_eq!(response, PortalResponse::saved());

        let flash = device.into_flash();
        let mut rebooted = DeviceContext::new(config(), flash);
        assert_eq!(
            rebooted.boot(),
            Ok(BootMode::Station(WifiCredentials::new("Home-WiFi", "pass1234")))
        );
    }

    #[test]
    fn test_portal_rejects_incomplete_form() {
        let mut device = device();
        let response = device.handle_request(&request("POST", "/config"), "ssid=Home", 0, &[]);
        assert_eq!(response, PortalResponse::missing_params());
        assert!(!device.store_mut().is_credential_valid());
    }

    #[test]
    fn test_portal_other_routes() {
        let mut device = device();
        let networks = vec![ScanEntry {
            ssid: "Home-WiFi".into(),
            rssi: -55,
        }];

        let scan = device.handle_request(&request("GET", "/scan"), "", 0, &networks);
        assert_eq!(scan.body, r#"[{"ssid":"Home-WiFi","rssi":-55}]"#);

        let page = device.handle_request(&request("GET", "/index.html"), "", 0, &[]);
        assert_eq!(page, PortalResponse::page());

        let missing = device.handle_request(&request("GET", "/nope"), "", 0, &[]);
        assert_eq!(missing.status, 404);
    }

    #[test]
    fn test_status_document() {
        let mut device = connected_device();
        let response = device.handle_request(&request("GET", "/status"), "", 12_000, &[]);
        let json: serde_json::Value = serde_json::from_str(&response.body).unwrap();

        assert_eq!(json["device"], "ESP32-C3-VoltageLog");
        assert_eq!(json["uptime_s"], 12);
        assert_eq!(json["wifi"]["mode"], "station");
        assert_eq!(json["wifi"]["connected"], true);
        assert_eq!(json["wifi"]["ssid"], "Home-WiFi");
        assert_eq!(json["cloud"]["authenticated"], false);
        assert_eq!(json["time"]["synced"], false);
        assert!(json["voltage"].is_null());
    }

    #[test]
    fn test_disconnect_is_logged_once() {
        let mut device = connected_device();
        let clock = ManualClock::at(10_001);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[100, 100, 100]);

        let report = block_on(device.tick(&mut link, &mut sensor, &clock, false));
        assert!(report.link_lost);
        assert!(report.start_access_point);
        assert!(!device.network().connected);
        assert_eq!(device.store_mut().outage_log().len(), Ok(1));

        device.access_point_started();
        clock.advance(10_001);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, false));
        assert!(!report.link_lost);
        assert_eq!(device.store_mut().outage_log().len(), Ok(1));

        let batch = device.store_mut().outage_log().export(0).unwrap();
        assert_eq!(batch.logs[0].message, WIFI_DISCONNECT_MESSAGE);
        assert_eq!(batch.logs[0].timestamp, 10);
    }

    #[test]
    fn test_failed_station_join_requests_portal() {
        let mut device = device();
        device.station_started("Home-WiFi", false);

        let clock = ManualClock::at(60_001);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000]);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, false));
        assert!(report.start_access_point);
        assert!(!report.link_lost);
        assert!(report.upload.is_none());
        assert!(link.requests.is_empty());
    }

    #[test]
    fn test_link_restored_on_next_check() {
        let mut device = connected_device();
        let clock = ManualClock::at(10_001);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[100, 100]);

        block_on(device.tick(&mut link, &mut sensor, &clock, false));
        clock.advance(10_001);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.link_restored);
        assert!(device.network().connected);
    }

    #[test]
    fn test_send_waits_for_interval() {
        let mut device = connected_device();
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000, 2000]);

        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.upload.is_none());

        clock.advance(60_001);
        link.auth_ok("t").respond(200, "{}");
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert_eq!(report.upload, Some(Ok(1)));
        assert_eq!(device.uploader().counter().last(), Some(1));
    }

    #[test]
    fn test_pending_logs_go_out_before_reading() {
        let mut device = connected_device();
        let clock = ManualClock::at(10_001);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000, 2000, 2000]);

        block_on(device.tick(&mut link, &mut sensor, &clock, false));
        clock.advance(10_001);
        block_on(device.tick(&mut link, &mut sensor, &clock, true));

        clock.advance(40_000);
        link.auth_ok("t").respond(200, "{}").respond(200, "{}");
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert_eq!(report.logs, Some(Ok(1)));
        assert_eq!(report.upload, Some(Ok(1)));

        let payloads = link.payload_calls();
        assert!(payloads[0].url.contains("/logs.json"));
        assert!(payloads[1].url.contains("/voltage/1.json"));
        assert!(!device.store_mut().outage_log().has_pending());
    }

    #[test]
    fn test_failed_send_backs_off_one_sample_interval() {
        let mut device = connected_device();
        let clock = ManualClock::at(60_001);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000, 2000]);
        let sample_interval_ms = device.config().timing.sample_interval_ms;

        link.respond(503, "{}");
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(matches!(report.upload, Some(Err(UploadError::Auth(_)))));
        assert!(device.next_wake_in_ms(clock.uptime_ms()) >= sample_interval_ms);

        // Nothing is attempted before the back-off ends
        clock.advance(1_000);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.upload.is_none());
        assert_eq!(link.requests.len(), 1);

        clock.advance(sample_interval_ms);
        link.auth_ok("t").respond(200, "{}");
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.sensor_error.is_none());
        assert_eq!(report.upload, Some(Ok(1)));
    }

    #[test]
    fn test_offline_device_sleeps_past_overdue_send() {
        let mut device = device();
        device.station_started("Home-WiFi", false);
        let clock = ManualClock::at(120_000);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000]);

        block_on(device.tick(&mut link, &mut sensor, &clock, false));
        assert!(device.next_wake_in_ms(clock.uptime_ms()) > 0);
        assert!(link.requests.is_empty());
    }

    #[test]
    fn test_failed_sample_is_not_sent() {
        let mut device = connected_device();
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        let mut sensor = FakeSensor::with(&[2000]);

        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.reading.is_some());

        // The send falls due on the same tick the sensor fails
        clock.advance(60_001);
        let report = block_on(device.tick(&mut link, &mut sensor, &clock, true));
        assert!(report.sensor_error.is_some());
        assert!(report.upload.is_none());
        assert!(link.requests.is_empty());
        assert!(device.last_reading().is_none());
        assert!(device.next_wake_in_ms(clock.uptime_ms()) > 0);
    }
}
