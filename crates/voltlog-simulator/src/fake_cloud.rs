//! In-process stand-in for the identity service and the realtime database.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info, warn};
use serde_json::{Value, json};

use voltlog_core::clock::Monotonic;
use voltlog_core::cloud::{CloudLink, HttpRequest, HttpResponse, Method, SIGN_UP_URL};
use voltlog_core::config::CloudConfig;

use crate::SimClock;

/// Lifetime handed out with every token, short enough to see refreshes.
const TOKEN_LIFETIME_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unreachable;

pub struct FakeCloud {
    database_url: String,
    record_collection: String,
    logs_collection: String,
    clock: Rc<SimClock>,
    /// Unix time (ms) at simulated uptime zero
    epoch_ms: u64,
    valid_token: Option<String>,
    tokens_issued: u32,
    /// Network reachability; cleared during simulated outages
    pub reachable: bool,
    pub records: BTreeMap<String, Value>,
    pub log_batches: Vec<Value>,
    pub unauthorized_responses: u32,
}

impl FakeCloud {
    pub fn new(config: &CloudConfig, clock: Rc<SimClock>, epoch_ms: u64) -> Self {
        Self {
            database_url: config.database_url.trim_end_matches('/').to_string(),
            record_collection: config.record_path.trim_matches('/').to_string(),
            logs_collection: config.logs_path.trim_matches('/').to_string(),
            clock,
            epoch_ms,
            valid_token: None,
            tokens_issued: 0,
            reachable: true,
            records: BTreeMap::new(),
            log_batches: Vec::new(),
            unauthorized_responses: 0,
        }
    }

    /// Invalidates the current token server-side.
    pub fn revoke_token(&mut self) {
        if self.valid_token.take().is_some() {
            info!("[cloud] token revoked");
        }
    }

    pub fn tokens_issued(&self) -> u32 {
        self.tokens_issued
    }

    fn sign_up(&mut self) -> HttpResponse {
        self.tokens_issued += 1;
        let token = format!("sim-token-{}", self.tokens_issued);
        self.valid_token = Some(token.clone());
        info!("[cloud] issued {}", token);

        let body = json!({
            "idToken": token,
            "expiresIn": TOKEN_LIFETIME_SECS.to_string(),
            "localId": "simulated-device",
        });
        HttpResponse::new(200, body.to_string())
    }

    fn database(&mut self, request: &HttpRequest<'_>, rest: &str) -> HttpResponse {
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let token = query.split('&').find_map(|pair| pair.strip_prefix("auth="));
        if token.is_none() || token != self.valid_token.as_deref() {
            self.unauthorized_responses += 1;
            return HttpResponse::new(401, r#"{"error":"Permission denied"}"#);
        }

        let path = path.trim_end_matches(".json").trim_matches('/');
        let (collection, key) = match path.split_once('/') {
            Some((collection, key)) => (collection, Some(key)),
            None => (path, None),
        };

        match (request.method, key) {
            (Method::Put, Some(key)) if collection == self.record_collection => {
                let Some(value) = parse_body(request) else {
                    return HttpResponse::new(400, r#"{"error":"Invalid data"}"#);
                };
                debug!("[cloud] PUT {}/{}", collection, key);
                self.records.insert(key.to_string(), value.clone());
                HttpResponse::new(200, value.to_string())
            }
            (Method::Get, None) if collection == self.record_collection => {
                let listing: serde_json::Map<String, Value> = self
                    .records
                    .iter()
                    .take(voltlog_core::cloud::LISTING_LIMIT)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                HttpResponse::new(200, Value::Object(listing).to_string())
            }
            (Method::Delete, Some(key)) if collection == self.record_collection => {
                info!("[cloud] DELETE {}/{}", collection, key);
                self.records.remove(key);
                HttpResponse::new(200, "null")
            }
            (Method::Post, None) if collection == self.logs_collection => {
                let Some(value) = parse_body(request) else {
                    return HttpResponse::new(400, r#"{"error":"Invalid data"}"#);
                };
                let name = format!("-Nsim{}", self.log_batches.len());
                info!("[cloud] log batch {} received", name);
                self.log_batches.push(value);
                HttpResponse::new(200, json!({ "name": name }).to_string())
            }
            _ => {
                warn!("[cloud] unsupported {} {}", request.method.as_str(), path);
                HttpResponse::new(404, "null")
            }
        }
    }
}

fn parse_body(request: &HttpRequest<'_>) -> Option<Value> {
    serde_json::from_str(request.body?).ok()
}

impl CloudLink for FakeCloud {
    type Error = Unreachable;

    async fn send(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, Self::Error> {
        if !self.reachable {
            return Err(Unreachable);
        }

        if request.url.starts_with(SIGN_UP_URL) {
            return Ok(self.sign_up());
        }

        match request.url.strip_prefix(self.database_url.as_str()) {
            Some(rest) => Ok(self.database(&request, rest)),
            None => Ok(HttpResponse::new(404, "null")),
        }
    }

    async fn fetch_unix_time_ms(&mut self) -> Result<u64, Self::Error> {
        if !self.reachable {
            return Err(Unreachable);
        }
        Ok(self.epoch_ms + self.clock.uptime_ms())
    }
}
