use alloc::string::{String, ToString};

use serde::{Deserialize, Serialize};

/// Identifier sent with every record.
pub const DEVICE_ID: &str = "ESP32-C3-VoltageLog";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub cloud: CloudConfig,
    pub timing: TimingConfig,
    pub access_point: AccessPointConfig,
    pub sensor: SensorConfig,
}

/// Realtime-database endpoint and anonymous-auth settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloudConfig {
    /// Web API key used for the anonymous sign-up exchange
    pub api_key: String,
    /// Database root, e.g. `https://example-rtdb.firebaseio.com`
    pub database_url: String,
    /// Collection holding the rotating records
    pub record_path: String,
    /// Collection receiving outage log batches
    pub logs_path: String,
    pub device_id: String,
    /// Token lifetime assumed when the exchange omits `expiresIn`
    pub default_token_lifetime_secs: u64,
    /// Highest rotating record key
    pub record_slots: u8,
}

impl CloudConfig {
    pub fn new(api_key: &str, database_url: &str, record_path: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            database_url: database_url.to_string(),
            record_path: record_path.to_string(),
            ..Self::default()
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            database_url: String::new(),
            record_path: "/voltage".to_string(),
            logs_path: "/logs".to_string(),
            device_id: DEVICE_ID.to_string(),
            default_token_lifetime_secs: 3600,
            record_slots: 20,
        }
    }
}

/// Intervals driving the periodic cycle, all in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimingConfig {
    pub wifi_check_interval_ms: u64,
    pub send_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub cleanup_cooldown_ms: u64,
    pub time_sync_timeout_ms: u64,
    /// Station connect attempts at boot before falling back to the portal
    pub connect_attempts: u8,
    pub connect_attempt_delay_ms: u64,
    /// Pause between answering `/config` and restarting
    pub restart_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wifi_check_interval_ms: 10_000,
            send_interval_ms: 60_000,
            sample_interval_ms: 10_000,
            cleanup_cooldown_ms: 30_000,
            time_sync_timeout_ms: 5_000,
            connect_attempts: 20,
            connect_attempt_delay_ms: 500,
            restart_delay_ms: 2_000,
        }
    }
}

/// Soft access point serving the configuration portal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub address: [u8; 4],
    pub prefix_len: u8,
    pub channel: u8,
    pub max_connections: u8,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "ESP32-VoltageLog".to_string(),
            password: "12345678".to_string(),
            address: [192, 168, 4, 1],
            prefix_len: 24,
            channel: 1,
            max_connections: 4,
        }
    }
}

/// ADC front end: a 5:1 divider module on a 12-bit channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub reference_volts: f32,
    pub resolution: f32,
    pub calibration: f32,
    pub divider: f32,
    pub adc_pin: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            reference_volts: 3.3,
            resolution: 4095.0,
            calibration: 0.91,
            divider: 5.0,
            adc_pin: 4,
        }
    }
}
