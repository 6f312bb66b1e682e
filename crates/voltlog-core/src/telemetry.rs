//! Delivery of readings and outage log batches to the realtime database.
//!
//! Readings are written under a rotating key `1..=20`, overwriting the record
//! from 20 sends ago. After a successful send, at most once per cooldown
//! window, a cleanup pass prunes the collection when it holds more than 20
//! records.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use embedded_storage::Storage;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::clock::Monotonic;
use crate::cloud::{CloudLink, Endpoints, HttpRequest, LISTING_LIMIT, Method};
use crate::config::{CloudConfig, TimingConfig};
use crate::error::UploadError;
use crate::sensor::VoltageReading;
use crate::session::SessionManager;
use crate::storage::PersistentStore;

/// Marker sent in `utc_time` while the wall clock is unknown.
pub const UNSYNCED: &str = "unsynced";

/// Most deletions issued by one cleanup pass.
pub const CLEANUP_BATCH: usize = 5;

/// Rotating key in `1..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCounter {
    last: u8,
    max: u8,
}

impl RecordCounter {
    pub const fn new(max: u8) -> Self {
        Self { last: 0, max }
    }

    /// Key the next send attempt will use.
    pub fn peek_next(&self) -> u8 {
        if self.last >= self.max { 1 } else { self.last + 1 }
    }

    pub fn advance(&mut self) -> u8 {
        self.last = self.peek_next();
        self.last
    }

    /// Key of the last send attempt.
    pub fn last(&self) -> Option<u8> {
        (self.last != 0).then_some(self.last)
    }
}

/// Record stored per reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord<'a> {
    #[serde(rename = "recordNumber")]
    pub record_number: u8,
    pub voltage: f32,
    #[serde(rename = "rawValue")]
    pub raw_value: u16,
    pub device: &'a str,
    /// Unix seconds, `0` while unsynced
    pub timestamp: u64,
    pub utc_time: String,
}

/// Result of a cleanup pass, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Cooldown still running
    Skipped,
    /// Listing failed or was empty
    Unavailable,
    /// Collection within bounds
    WithinLimit { count: usize },
    Pruned { count: usize, deleted: usize },
}

/// Keys that a cleanup pass should try to delete, in listing order.
///
/// Keys are compared by their leading decimal digits (non-numeric keys count
/// as 0), and only keys equal to the single smallest value are selected.
pub fn cleanup_candidates<'k>(keys: impl Iterator<Item = &'k str> + Clone, keep: usize) -> Vec<&'k str> {
    let count = keys.clone().count();
    if count <= keep {
        return Vec::new();
    }

    let Some(oldest) = keys.clone().map(numeric_key).min() else {
        return Vec::new();
    };
    keys.filter(|key| numeric_key(key) == oldest).collect()
}

/// Leading unsigned decimal value of `key`, saturating; `0` if there is none.
fn numeric_key(key: &str) -> u64 {
    let digits = key.trim_start().trim_start_matches('+');
    digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, d| {
            acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
        })
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Record(u8),
    Logs,
}

/// Cloud uploader with its session, rotating counter and cleanup cooldown.
pub struct Uploader {
    config: CloudConfig,
    session: SessionManager,
    counter: RecordCounter,
    cleanup_cooldown_ms: u64,
    last_cleanup_ms: u64,
}

impl Uploader {
    pub fn new(config: CloudConfig, timing: &TimingConfig) -> Self {
        let session = SessionManager::new(config.default_token_lifetime_secs);
        let counter = RecordCounter::new(config.record_slots);
        Self {
            config,
            session,
            counter,
            cleanup_cooldown_ms: timing.cleanup_cooldown_ms,
            last_cleanup_ms: 0,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn counter(&self) -> &RecordCounter {
        &self.counter
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Builds the record for `reading` under `key`.
    pub fn record<'a>(&'a self, key: u8, reading: &VoltageReading, uptime_ms: u64) -> TelemetryRecord<'a> {
        let clock = self.session.wall_clock();
        let (timestamp, utc_time) = match (clock.unix_secs(uptime_ms), clock.iso8601(uptime_ms)) {
            (Some(secs), Some(iso)) => (secs, iso),
            _ => (0, UNSYNCED.to_string()),
        };

        TelemetryRecord {
            record_number: key,
            voltage: reading.input_volts,
            raw_value: reading.raw,
            device: &self.config.device_id,
            timestamp,
            utc_time,
        }
    }

    /// Sends one reading. Returns the record key it was stored under.
    pub async fn send_reading<L, C>(
        &mut self,
        link: &mut L,
        clock: &C,
        reading: &VoltageReading,
    ) -> Result<u8, UploadError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        self.prepare_session(link, clock).await?;

        let key = self.counter.peek_next();
        let body = serde_json::to_string(&self.record(key, reading, clock.uptime_ms())).map_err(|e| {
            error!("Record serialization failed: {}", e);
            UploadError::Serialize
        })?;

        // The key is spent even if delivery fails; a stale-token retry reuses it
        self.counter.advance();
        self.send_authorized(link, clock, Method::Put, Resource::Record(key), &body)
            .await?;
        info!("Stored reading {:.2} V as record {}", reading.input_volts, key);

        let outcome = self.cleanup_if_due(link, clock).await;
        debug!("Cleanup pass: {:?}", outcome);

        Ok(key)
    }

    /// Runs [`Uploader::cleanup`] once the cooldown since the last pass has
    /// elapsed.
    pub async fn cleanup_if_due<L, C>(&mut self, link: &mut L, clock: &C) -> CleanupOutcome
    where
        L: CloudLink,
        C: Monotonic,
    {
        if clock.uptime_ms().saturating_sub(self.last_cleanup_ms) <= self.cleanup_cooldown_ms {
            return CleanupOutcome::Skipped;
        }
        let outcome = self.cleanup(link).await;
        self.last_cleanup_ms = clock.uptime_ms();
        outcome
    }

    /// Uploads the pending outage log batch and drains it once acknowledged.
    ///
    /// Returns the number of entries delivered (0 when nothing was pending).
    pub async fn send_logs<L, C, F>(
        &mut self,
        link: &mut L,
        clock: &C,
        store: &mut PersistentStore<F>,
    ) -> Result<usize, UploadError>
    where
        L: CloudLink,
        C: Monotonic,
        F: Storage,
    {
        if !store.outage_log().has_pending() {
            return Ok(0);
        }

        self.prepare_session(link, clock).await?;

        let exported_at = self
            .session
            .wall_clock()
            .unix_secs(clock.uptime_ms())
            .unwrap_or(0);
        let batch = store.outage_log().export(exported_at)?;
        let body = serde_json::to_string(&batch).map_err(|e| {
            error!("Log batch serialization failed: {}", e);
            UploadError::Serialize
        })?;

        self.send_authorized(link, clock, Method::Post, Resource::Logs, &body)
            .await?;
        store.outage_log().drain()?;

        info!("Delivered {} outage log entries", batch.count);
        Ok(batch.logs.len())
    }

    /// Best-effort pruning of the record collection. Never fails the caller.
    pub async fn cleanup<L: CloudLink>(&mut self, link: &mut L) -> CleanupOutcome {
        let Some(token) = self.session.session().map(|s| s.token().to_string()) else {
            return CleanupOutcome::Unavailable;
        };
        let endpoints = Endpoints::new(&self.config);

        let url = endpoints.listing(LISTING_LIMIT, &token);
        let response = match link.send(HttpRequest::get(&url)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Cleanup listing failed: {:?}", e);
                return CleanupOutcome::Unavailable;
            }
        };
        if !response.is_success() || response.body.trim() == "null" {
            debug!("Cleanup listing unavailable (status {})", response.status);
            return CleanupOutcome::Unavailable;
        }

        let listing: Map<String, Value> = match serde_json::from_str(&response.body) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Cleanup listing is not an object: {}", e);
                return CleanupOutcome::Unavailable;
            }
        };

        let keep = usize::from(self.config.record_slots);
        let keys: Vec<&str> = listing.keys().map(String::as_str).collect();
        let count = keys.len();
        let candidates = cleanup_candidates(keys.iter().copied(), keep);
        if candidates.is_empty() {
            return CleanupOutcome::WithinLimit { count };
        }

        let mut deleted = 0;
        for key in candidates {
            if deleted >= CLEANUP_BATCH {
                break;
            }
            let url = endpoints.record(key, &token);
            match link.send(HttpRequest::delete(&url)).await {
                Ok(response) if response.is_success() => {
                    deleted += 1;
                    info!("Deleted old record {}", key);
                }
                Ok(response) => warn!("Delete of {} returned {}", key, response.status),
                Err(e) => warn!("Delete of {} failed: {:?}", key, e),
            }
        }

        CleanupOutcome::Pruned { count, deleted }
    }

    async fn prepare_session<L, C>(&mut self, link: &mut L, clock: &C) -> Result<(), UploadError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        let endpoints = Endpoints::new(&self.config);
        self.session.ensure_valid(link, &endpoints, clock).await?;
        self.session.sync_time(link, clock).await;
        Ok(())
    }

    /// Sends `body` with the current token, refreshing and retrying exactly
    /// once if the token is rejected.
    async fn send_authorized<L, C>(
        &mut self,
        link: &mut L,
        clock: &C,
        method: Method,
        resource: Resource,
        body: &str,
    ) -> Result<(), UploadError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        let endpoints = Endpoints::new(&self.config);

        let token = self
            .session
            .ensure_valid(link, &endpoints, clock)
            .await?
            .token()
            .to_string();
        let status = Self::send_once(link, &endpoints, method, resource, &token, body).await?;
        if status == 200 {
            return Ok(());
        }
        if !SessionManager::is_authorized_rejection(status) {
            warn!("Upload rejected with status {}", status);
            return Err(UploadError::Rejected { status });
        }

        let token = self
            .session
            .refresh(link, &endpoints, clock)
            .await?
            .token()
            .to_string();
        match Self::send_once(link, &endpoints, method, resource, &token, body).await? {
            200 => {
                info!("Upload succeeded after re-authentication");
                Ok(())
            }
            status if SessionManager::is_authorized_rejection(status) => {
                error!("Upload still unauthorized after re-authentication");
                Err(UploadError::Unauthorized)
            }
            status => {
                warn!("Retried upload rejected with status {}", status);
                Err(UploadError::Rejected { status })
            }
        }
    }

    async fn send_once<L: CloudLink>(
        link: &mut L,
        endpoints: &Endpoints<'_>,
        method: Method,
        resource: Resource,
        token: &str,
        body: &str,
    ) -> Result<u16, UploadError> {
        let url = match resource {
            Resource::Record(key) => endpoints.record(&key.to_string(), token),
            Resource::Logs => endpoints.logs(token),
        };

        let response = link
            .send(HttpRequest::with_body(method, &url, body))
            .await
            .map_err(|e| {
                warn!("{} {:?} failed: {:?}", method.as_str(), resource, e);
                UploadError::Transport
            })?;
        Ok(response.status)
    }
}
