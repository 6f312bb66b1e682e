//! Configuration portal served from the access point.
//!
//! Everything here is transport independent: the firmware reads a request
//! off a TCP socket, hands the head and body to [`Request::parse`], lets the
//! device answer it and writes the [`PortalResponse`] back.

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;

use serde::Serialize;

/// Config UI served for `/` and `/index.html`.
pub const CONFIG_PAGE: &str = include_str!("../assets/index.html");

pub const CONTENT_HTML: &str = "text/html";
pub const CONTENT_TEXT: &str = "text/plain";
pub const CONTENT_JSON: &str = "application/json";

/// Handler selected by the request path. Any method is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Page,
    Config,
    Scan,
    Status,
    NotFound,
}

impl Route {
    /// Dispatches on the path, ignoring any query string.
    pub fn resolve(target: &str) -> Self {
        match target_path(target) {
            "/" | "/index.html" => Self::Page,
            "/config" => Self::Config,
            "/scan" => Self::Scan,
            "/status" => Self::Status,
            _ => Self::NotFound,
        }
    }
}

/// Parsed request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub content_length: Option<usize>,
}

impl<'a> Request<'a> {
    /// Parses the request line and `Content-Length` out of a header block.
    pub fn parse(header: &'a str) -> Result<Self, &'static str> {
        let (method, target) = parse_request_line(header).ok_or("bad request line")?;
        let content_length = parse_content_length(header)?;
        Ok(Self {
            method,
            target,
            content_length,
        })
    }

    pub fn route(&self) -> Route {
        Route::resolve(self.target)
    }
}

/// Offset of the blank line ending the header block.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_request_line(header: &str) -> Option<(&str, &str)> {
    let first_line = header.lines().next()?;
    let mut parts = first_line.split_ascii_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let _version = parts.next()?;
    Some((method, target))
}

fn parse_content_length(header: &str) -> Result<Option<usize>, &'static str> {
    let mut content_length = None;

    for line in header.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.eq_ignore_ascii_case("content-length") {
            continue;
        }

        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| "invalid content-length")?;
        if content_length.is_some() {
            return Err("duplicate content-length");
        }
        content_length = Some(parsed);
    }

    Ok(content_length)
}

fn target_path(target: &str) -> &str {
    target.split('?').next().unwrap_or(target)
}

/// Response handed back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Cow<'static, str>,
    /// The device should restart once the response is flushed
    pub restart: bool,
}

impl PortalResponse {
    pub fn page() -> Self {
        Self::new(200, CONTENT_HTML, CONFIG_PAGE)
    }

    pub fn saved() -> Self {
        Self {
            restart: true,
            ..Self::new(200, CONTENT_TEXT, "OK! Rebooting...")
        }
    }

    pub fn missing_params() -> Self {
        Self::new(400, CONTENT_TEXT, "Missing params")
    }

    pub fn not_found() -> Self {
        Self::new(404, CONTENT_TEXT, "Not found")
    }

    pub fn too_large() -> Self {
        Self::new(413, CONTENT_TEXT, "Payload too large")
    }

    pub fn storage_failed() -> Self {
        Self::new(500, CONTENT_TEXT, "Storage error")
    }

    pub fn json(body: String) -> Self {
        Self::new(200, CONTENT_JSON, body)
    }

    fn new(status: u16, content_type: &'static str, body: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
            restart: false,
        }
    }

    /// Status line text after the version, e.g. `200 OK`.
    pub fn status_line(&self) -> &'static str {
        match self.status {
            200 => "200 OK",
            400 => "400 Bad Request",
            404 => "404 Not Found",
            413 => "413 Payload Too Large",
            _ => "500 Internal Server Error",
        }
    }
}

/// Credentials submitted through `/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSubmission {
    pub ssid: String,
    pub password: String,
}

impl ConfigSubmission {
    /// Reads `ssid` and `password` from a form body. Both must be present;
    /// empty values are accepted.
    pub fn parse(form: &str) -> Option<Self> {
        Some(Self {
            ssid: form_value(form, "ssid")?,
            password: form_value(form, "password")?,
        })
    }
}

/// First value of `name` in an `application/x-www-form-urlencoded` body.
pub fn form_value(form: &str, name: &str) -> Option<String> {
    form.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key) == name).then(|| url_decode(value))
        })
        .next()
}

/// Decodes `+` and `%XX`. Malformed escapes pass through unchanged and
/// invalid UTF-8 is replaced.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (hex_at(bytes, i + 1), hex_at(bytes, i + 2)) {
                (Some(hi), Some(lo)) => {
                    out.push((hi << 4) | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_at(bytes: &[u8], index: usize) -> Option<u8> {
    bytes.get(index).copied().and_then(decode_hex)
}

fn decode_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + (b - b'a')),
        b'A'..=b'F' => Some(10 + (b - b'A')),
        _ => None,
    }
}

/// One network found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
}

/// `/scan` body: `[{"ssid":"..","rssi":-40},..]`.
pub fn scan_json(networks: &[ScanEntry]) -> String {
    serde_json::to_string(networks).unwrap_or_else(|_| String::from("[]"))
}

/// `/status` document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub device: String,
    pub uptime_s: u64,
    pub voltage: Option<VoltageStatus>,
    pub wifi: WifiStatus,
    pub cloud: CloudStatus,
    pub time: TimeStatus,
    pub timing: TimingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageStatus {
    pub volts: f32,
    pub adc_volts: f32,
    pub raw: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiStatus {
    /// `"station"` or `"access_point"`
    pub mode: &'static str,
    pub connected: bool,
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloudStatus {
    pub authenticated: bool,
    pub token_remaining_s: u64,
    pub last_record: Option<u8>,
    pub pending_logs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeStatus {
    pub synced: bool,
    pub utc_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingStatus {
    pub send_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub next_due_ms: u64,
}

impl StatusReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_route_dispatch() {
        assert_eq!(Route::resolve("/"), Route::Page);
        assert_eq!(Route::resolve("/index.html"), Route::Page);
        assert_eq!(Route::resolve("/config"), Route::Config);
        assert_eq!(Route::resolve("/scan?x=1"), Route::Scan);
        assert_eq!(Route::resolve("/status"), Route::Status);
        assert_eq!(Route::resolve("/favicon.ico"), Route::NotFound);
    }

    #[test]
    fn test_request_head_parsing() {
        let raw = b"POST /config HTTP/1.1\r\nHost: 192.168.4.1\r\nContent-Length: 27\r\n\r\nssid=a";
        let end = find_header_end(raw).unwrap();
        let header = core::str::from_utf8(&raw[..end]).unwrap();

        let request = Request::parse(header).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.route(), Route::Config);
        assert_eq!(request.content_length, Some(27));
        assert_eq!(&raw[end + 4..], b"ssid=a");
    }

    #[test]
    fn test_request_head_errors() {
        assert_eq!(Request::parse("garbage"), Err("bad request line"));
        assert_eq!(
            Request::parse("POST / HTTP/1.1\r\nContent-Length: x"),
            Err("invalid content-length")
        );
        assert_eq!(
            Request::parse("POST / HTTP/1.1\r\nContent-Length: 1\r\ncontent-length: 1"),
            Err("duplicate content-length")
        );
    }

    #[test]
    fn test_config_form() {
        let submission = ConfigSubmission::parse("ssid=Home+WiFi&password=p%40ss%26word").unwrap();
        assert_eq!(submission.ssid, "Home WiFi");
        assert_eq!(submission.password, "p@ss&word");

        assert_eq!(ConfigSubmission::parse("ssid=Home"), None);
        assert_eq!(ConfigSubmission::parse(""), None);

        let empty = ConfigSubmission::parse("ssid=&password").unwrap();
        assert_eq!(empty.ssid, "");
        assert_eq!(empty.password, "");
    }

    #[test]
    fn test_url_decode_malformed_escape() {
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz%41"), "%zzA");
    }

    #[test]
    fn test_scan_json_escapes() {
        let networks = vec![
            ScanEntry {
                ssid: String::from(r#"My "Net"\5"#),
                rssi: -42,
            },
            ScanEntry {
                ssid: String::new(),
                rssi: -90,
            },
        ];
        assert_eq!(
            scan_json(&networks),
            r#"[{"ssid":"My \"Net\"\\5","rssi":-42},{"ssid":"","rssi":-90}]"#
        );
        assert_eq!(scan_json(&[]), "[]");
    }

    #[test]
    fn test_canned_responses() {
        let saved = PortalResponse::saved();
        assert_eq!(saved.status, 200);
        assert_eq!(saved.body, "OK! Rebooting...");
        assert!(saved.restart);

        let missing = PortalResponse::missing_params();
        assert_eq!((missing.status, missing.restart), (400, false));
        assert_eq!(PortalResponse::not_found().status_line(), "404 Not Found");
        assert_eq!(PortalResponse::too_large().status_line(), "413 Payload Too Large");
        assert!(PortalResponse::page().body.contains("action=\"/config\""));
    }
}
