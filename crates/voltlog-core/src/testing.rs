//! Shared fakes for unit tests.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::Cell;

use crate::clock::Monotonic;
use crate::cloud::{CloudLink, HttpRequest, HttpResponse, Method};
use crate::config::CloudConfig;
use crate::error::SensorError;
use crate::sensor::VoltageSensor;

pub const TEST_TIME_MS: u64 = 1_700_000_000_000;

pub fn cloud_config() -> CloudConfig {
    CloudConfig::new("KEY", "https://db.example.com", "/voltage")
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn at(ms: u64) -> Self {
        Self { now: Cell::new(ms) }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Monotonic for ManualClock {
    fn uptime_ms(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

impl RecordedRequest {
    pub fn is_auth(&self) -> bool {
        self.url.contains("accounts:signUp")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkDown;

/// Cloud link replaying queued responses and recording every request.
///
/// An exhausted queue behaves like a dropped connection.
#[derive(Debug, Default)]
pub struct ScriptedLink {
    responses: VecDeque<Result<HttpResponse, LinkDown>>,
    pub requests: Vec<RecordedRequest>,
    pub time: Option<u64>,
    pub time_requests: usize,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time(mut self, unix_ms: u64) -> Self {
        self.time = Some(unix_ms);
        self
    }

    pub fn respond(&mut self, status: u16, body: &str) -> &mut Self {
        self.responses.push_back(Ok(HttpResponse::new(status, body)));
        self
    }

    pub fn auth_ok(&mut self, token: &str) -> &mut Self {
        let body = alloc::format!(r#"{{"idToken":"{token}","expiresIn":"3600"}}"#);
        self.respond(200, &body)
    }

    pub fn drop_connection(&mut self) -> &mut Self {
        self.responses.push_back(Err(LinkDown));
        self
    }

    pub fn auth_calls(&self) -> usize {
        self.requests.iter().filter(|r| r.is_auth()).count()
    }

    pub fn payload_calls(&self) -> Vec<&RecordedRequest> {
        self.requests.iter().filter(|r| !r.is_auth()).collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.len()
    }
}

impl CloudLink for ScriptedLink {
    type Error = LinkDown;

    async fn send(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, Self::Error> {
        self.requests.push(RecordedRequest {
            method: request.method,
            url: request.url.to_string(),
            body: request.body.map(ToString::to_string),
        });
        self.responses.pop_front().unwrap_or(Err(LinkDown))
    }

    async fn fetch_unix_time_ms(&mut self) -> Result<u64, Self::Error> {
        self.time_requests += 1;
        self.time.ok_or(LinkDown)
    }
}

/// Sensor returning queued raw values, then failing.
#[derive(Debug, Default)]
pub struct FakeSensor {
    pub values: VecDeque<u16>,
}

impl FakeSensor {
    pub fn with(values: &[u16]) -> Self {
        Self {
            values: values.iter().copied().collect(),
        }
    }
}

impl VoltageSensor for FakeSensor {
    async fn read_raw(&mut self) -> Result<u16, SensorError> {
        self.values.pop_front().ok_or(SensorError::ReadError)
    }
}
