//! Outbound REST contract with the realtime database and identity service.
//!
//! The transport itself (TLS, DNS, sockets, SNTP) lives behind [`CloudLink`];
//! this module only knows the endpoints and payload shapes.

use alloc::format;
use alloc::string::String;

use serde::Deserialize;
use serde_json::Value;

use crate::config::CloudConfig;
use crate::error::AuthError;

/// Anonymous sign-up endpoint of the identity toolkit.
pub const SIGN_UP_URL: &str = "https://identitytoolkit.googleapis.com/v1/accounts:signUp";
pub const SIGN_UP_BODY: &str = r#"{"returnSecureToken":true}"#;

/// Most keys requested by one cleanup listing.
pub const LISTING_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// JSON request; `body` is sent with `Content-Type: application/json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub body: Option<&'a str>,
}

impl<'a> HttpRequest<'a> {
    pub const fn get(url: &'a str) -> Self {
        Self {
            method: Method::Get,
            url,
            body: None,
        }
    }

    pub const fn delete(url: &'a str) -> Self {
        Self {
            method: Method::Delete,
            url,
            body: None,
        }
    }

    pub const fn with_body(method: Method, url: &'a str, body: &'a str) -> Self {
        Self {
            method,
            url,
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The database acknowledges writes with exactly 200.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Network access needed by the uploader.
pub trait CloudLink {
    type Error: core::fmt::Debug;

    /// Performs one HTTP exchange. `Err` means no response was received;
    /// any HTTP status, including failures, is `Ok`.
    async fn send(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, Self::Error>;

    /// Fetches the current unix time in milliseconds within a bounded time.
    async fn fetch_unix_time_ms(&mut self) -> Result<u64, Self::Error>;
}

/// URL builder for the configured database.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints<'a> {
    config: &'a CloudConfig,
}

impl<'a> Endpoints<'a> {
    pub const fn new(config: &'a CloudConfig) -> Self {
        Self { config }
    }

    pub fn sign_up(&self) -> String {
        format!("{}?key={}", SIGN_UP_URL, self.config.api_key)
    }

    /// `<db>/<records>/<key>.json?auth=<token>`
    pub fn record(&self, key: &str, token: &str) -> String {
        format!(
            "{}/{}.json?auth={}",
            self.collection(&self.config.record_path),
            key,
            token
        )
    }

    /// Records ordered by key, at most `limit` of them.
    pub fn listing(&self, limit: usize, token: &str) -> String {
        format!(
            "{}.json?orderBy=%22%24key%22&limitToFirst={}&auth={}",
            self.collection(&self.config.record_path),
            limit,
            token
        )
    }

    pub fn logs(&self, token: &str) -> String {
        format!(
            "{}.json?auth={}",
            self.collection(&self.config.logs_path),
            token
        )
    }

    fn collection(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.database_url.trim_end_matches('/'),
            path.trim_matches('/')
        )
    }
}

/// Result of the sign-up exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub id_token: String,
    /// Lifetime in seconds when the response carried one
    pub expires_in_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SignUpResponse {
    #[serde(rename = "idToken")]
    id_token: String,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<Value>,
}

impl AuthGrant {
    /// Parses the sign-up response. `expiresIn` arrives as a decimal string
    /// but a bare number is accepted too.
    pub fn parse(body: &str) -> Result<Self, AuthError> {
        let response: SignUpResponse =
            serde_json::from_str(body).map_err(|_| AuthError::Malformed)?;
        if response.id_token.is_empty() {
            return Err(AuthError::Malformed);
        }

        let expires_in_secs = match response.expires_in {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        Ok(Self {
            id_token: response.id_token,
            expires_in_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CloudConfig {
        CloudConfig::new("KEY", "https://volt-rtdb.example.com/", "voltage/")
    }

    #[test]
    fn test_endpoint_urls() {
        let config = config();
        let endpoints = Endpoints::new(&config);

        assert_eq!(
            endpoints.sign_up(),
            "https://identitytoolkit.googleapis.com/v1/accounts:signUp?key=KEY"
        );
        assert_eq!(
            endpoints.record("7", "tok"),
            "https://volt-rtdb.example.com/voltage/7.json?auth=tok"
        );
        assert_eq!(
            endpoints.listing(100, "tok"),
            "https://volt-rtdb.example.com/voltage.json?orderBy=%22%24key%22&limitToFirst=100&auth=tok"
        );
        assert_eq!(
            endpoints.logs("tok"),
            "https://volt-rtdb.example.com/logs.json?auth=tok"
        );
    }

    #[test]
    fn test_grant_with_string_lifetime() {
        let grant = AuthGrant::parse(r#"{"idToken":"abc","expiresIn":"3600","localId":"x"}"#).unwrap();
        assert_eq!(grant.id_token, "abc");
        assert_eq!(grant.expires_in_secs, Some(3600));
    }

    #[test]
    fn test_grant_with_numeric_or_missing_lifetime() {
        let grant = AuthGrant::parse(r#"{"idToken":"abc","expiresIn":120}"#).unwrap();
        assert_eq!(grant.expires_in_secs, Some(120));

        let grant = AuthGrant::parse(r#"{"idToken":"abc"}"#).unwrap();
        assert_eq!(grant.expires_in_secs, None);
    }

    #[test]
    fn test_grant_rejects_malformed() {
        assert_eq!(AuthGrant::parse("not json"), Err(AuthError::Malformed));
        assert_eq!(AuthGrant::parse(r#"{"idToken":""}"#), Err(AuthError::Malformed));
        assert_eq!(AuthGrant::parse(r#"{"expiresIn":"10"}"#), Err(AuthError::Malformed));
    }
}
