//! Station join, access-point fallback and network scans.

use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::{Duration, Timer};
use esp_radio::wifi::{
    AccessPointConfig as RadioApConfig, AuthMethod, ClientConfig, ModeConfig, ScanConfig,
    WifiController,
};
use log::{debug, info, warn};
use voltlog_core::config::AccessPointConfig;
use voltlog_core::credentials::WifiCredentials;
use voltlog_core::portal::ScanEntry;

use crate::error::WifiError;

const SCAN_MAX_RESULTS: usize = 20;

pub struct Radio {
    controller: WifiController<'static>,
    station: Option<ClientConfig>,
}

impl Radio {
    pub fn new(controller: WifiController<'static>) -> Self {
        Self {
            controller,
            station: None,
        }
    }

    /// Joins the stored network, polling up to `attempts` times `delay` apart.
    /// Returns whether the station associated.
    pub async fn join(
        &mut self,
        credentials: &WifiCredentials,
        attempts: u8,
        delay: Duration,
    ) -> Result<bool, WifiError> {
        let client = ClientConfig::default()
            .with_ssid(String::from(credentials.ssid()))
            .with_password(String::from(credentials.password()));
        self.station = Some(client.clone());

        self.controller
            .set_config(&ModeConfig::Client(client))
            .map_err(|_| WifiError::Config)?;
        self.controller
            .start_async()
            .await
            .map_err(|_| WifiError::Start)?;

        info!("Connecting to '{}'", credentials.ssid());
        if let Err(e) = self.controller.connect() {
            warn!("Connect request failed: {:?}", e);
        }

        for attempt in 1..=attempts {
            if self.is_station_connected() {
                info!("Associated after {} polls", attempt);
                return Ok(true);
            }
            Timer::after(delay).await;
        }
        Ok(self.is_station_connected())
    }

    /// Brings up the soft AP next to the station interface. The station keeps
    /// its configuration so it can still rejoin and scans keep working.
    pub async fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), WifiError> {
        let access_point = RadioApConfig::default()
            .with_ssid(config.ssid.clone())
            .with_password(config.password.clone())
            .with_auth_method(AuthMethod::Wpa2Personal)
            .with_channel(config.channel)
            .with_max_connections(config.max_connections.into());
        let station = self.station.clone().unwrap_or_default();

        if matches!(self.controller.is_started(), Ok(true)) {
            if let Err(e) = self.controller.stop_async().await {
                debug!("Stopping the radio failed: {:?}", e);
            }
        }
        self.controller
            .set_config(&ModeConfig::ApSta(station, access_point))
            .map_err(|_| WifiError::Config)?;
        self.controller
            .start_async()
            .await
            .map_err(|_| WifiError::Start)?;

        if self.station.is_some() {
            self.reconnect();
        }
        info!("Access point '{}' on channel {}", config.ssid, config.channel);
        Ok(())
    }

    /// Kicks a new association attempt if a network is configured.
    pub fn reconnect(&mut self) {
        if self.station.is_none() || self.is_station_connected() {
            return;
        }
        if let Err(e) = self.controller.connect() {
            debug!("Reconnect request failed: {:?}", e);
        }
    }

    pub fn is_station_connected(&self) -> bool {
        matches!(self.controller.is_connected(), Ok(true))
    }

    /// Visible networks, strongest first. Hidden networks are skipped.
    pub async fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError> {
        let config = ScanConfig::default()
            .with_show_hidden(false)
            .with_max(SCAN_MAX_RESULTS);
        let results = self
            .controller
            .scan_with_config_async(config)
            .await
            .map_err(|_| WifiError::Scan)?;

        let mut networks: Vec<ScanEntry> = results
            .into_iter()
            .map(|ap| ScanEntry {
                ssid: ap.ssid.as_str().into(),
                rssi: ap.signal_strength,
            })
            .collect();
        networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        debug!("Scan found {} networks", networks.len());
        Ok(networks)
    }
}
