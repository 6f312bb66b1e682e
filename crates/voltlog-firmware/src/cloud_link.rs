//! HTTPS transport for the cloud endpoints.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use embassy_net::Stack;
use embassy_net::dns::DnsSocket;
use embassy_net::tcp::client::{TcpClient, TcpClientState};
use embassy_time::Duration;
use esp_hal::rng::Rng;
use log::{debug, warn};
use reqwless::client::{HttpClient, TlsConfig, TlsVerify};
use reqwless::headers::ContentType;
use reqwless::request::{Method as HttpMethod, RequestBuilder};
use voltlog_core::cloud::{CloudLink, HttpRequest, HttpResponse, Method};

use crate::error::LinkError;
use crate::sntp;

/// Largest TLS record the server may send.
const TLS_READ_BUFFER: usize = 16_640;
const TLS_WRITE_BUFFER: usize = 4_096;
/// Response head plus body; the record listing is the largest reply.
const RESPONSE_BUFFER: usize = 16_384;

pub type ClientState = TcpClientState<1, 4096, 4096>;

/// `CloudLink` over the station stack with TLS and SNTP.
///
/// Certificates are not verified; the session token is the only secret on
/// the wire.
pub struct HttpsLink {
    stack: Stack<'static>,
    tcp_state: &'static ClientState,
    rng: Rng,
    time_sync_timeout: Duration,
    tls_read: Box<[u8]>,
    tls_write: Box<[u8]>,
    response: Box<[u8]>,
}

impl HttpsLink {
    pub fn new(
        stack: Stack<'static>,
        tcp_state: &'static ClientState,
        rng: Rng,
        time_sync_timeout_ms: u64,
    ) -> Self {
        Self {
            stack,
            tcp_state,
            rng,
            time_sync_timeout: Duration::from_millis(time_sync_timeout_ms),
            tls_read: vec![0; TLS_READ_BUFFER].into_boxed_slice(),
            tls_write: vec![0; TLS_WRITE_BUFFER].into_boxed_slice(),
            response: vec![0; RESPONSE_BUFFER].into_boxed_slice(),
        }
    }

    fn seed(&self) -> u64 {
        (u64::from(self.rng.random()) << 32) | u64::from(self.rng.random())
    }
}

fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Get => HttpMethod::GET,
        Method::Put => HttpMethod::PUT,
        Method::Post => HttpMethod::POST,
        Method::Delete => HttpMethod::DELETE,
    }
}

impl CloudLink for HttpsLink {
    type Error = LinkError;

    async fn send(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, Self::Error> {
        debug!("{} {}", request.method.as_str(), request.url);

        let seed = self.seed();
        let tcp_client = TcpClient::new(self.stack, self.tcp_state);
        let dns = DnsSocket::new(self.stack);
        let tls = TlsConfig::new(seed, &mut self.tls_read, &mut self.tls_write, TlsVerify::None);
        let mut client = HttpClient::new_with_tls(&tcp_client, &dns, tls);

        let handle = client
            .request(http_method(request.method), request.url)
            .await
            .map_err(|e| {
                warn!("Connection to {} failed: {:?}", request.url, e);
                LinkError::Request
            })?;
        let mut handle = handle
            .body(request.body.unwrap_or_default().as_bytes())
            .content_type(ContentType::ApplicationJson);

        let response = handle.send(&mut self.response).await.map_err(|e| {
            warn!("Request to {} failed: {:?}", request.url, e);
            LinkError::Request
        })?;
        let status = response.status.0;
        let body = response
            .body()
            .read_to_end()
            .await
            .map_err(|_| LinkError::Body)?;
        let body = core::str::from_utf8(body).map_err(|_| LinkError::Encoding)?;

        debug!("HTTP {} ({} bytes)", status, body.len());
        Ok(HttpResponse::new(status, String::from(body)))
    }

    async fn fetch_unix_time_ms(&mut self) -> Result<u64, Self::Error> {
        sntp::query_unix_ms(self.stack, sntp::NTP_SERVER, self.time_sync_timeout).await
    }
}
