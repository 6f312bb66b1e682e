//! TCP listener for the configuration portal.

use alloc::format;
use alloc::vec::Vec;

use embassy_net::tcp::TcpSocket;
use embassy_net::{IpListenEndpoint, Stack};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use embedded_io_async::Write;
use log::{debug, info, warn};
use voltlog_core::portal::{PortalResponse, Request, Route, find_header_end};

use crate::{SharedDevice, SharedRadio};

const PORTAL_PORT: u16 = 80;
const HEADER_MAX: usize = 1024;
const BODY_MAX: usize = 512;
const SOCKET_BUF: usize = 2048;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Serves the portal on the access-point stack. Restarts the chip once a
/// response asks for it.
#[embassy_executor::task]
pub async fn portal_server_task(
    stack: Stack<'static>,
    device: &'static SharedDevice,
    radio: &'static SharedRadio,
    restart_delay_ms: u64,
) {
    stack.wait_config_up().await;
    info!("Portal listening on port {}", PORTAL_PORT);

    let mut rx_buffer = [0u8; SOCKET_BUF];
    let mut tx_buffer = [0u8; SOCKET_BUF];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

    loop {
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        if let Err(e) = socket
            .accept(IpListenEndpoint {
                addr: None,
                port: PORTAL_PORT,
            })
            .await
        {
            warn!("Portal accept failed: {:?}", e);
            continue;
        }

        let restart = match handle_connection(&mut socket, device, radio).await {
            Ok(restart) => restart,
            Err(e) => {
                debug!("Portal request dropped: {}", e);
                false
            }
        };

        match with_timeout(FLUSH_TIMEOUT, socket.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Portal flush failed: {:?}", e),
            Err(_) => debug!("Portal flush timed out"),
        }
        socket.close();
        Timer::after(Duration::from_millis(20)).await;
        socket.abort();

        if restart {
            info!("Credentials saved, restarting in {} ms", restart_delay_ms);
            Timer::after(Duration::from_millis(restart_delay_ms)).await;
            esp_hal::system::software_reset();
        }
    }
}

/// Reads one request and answers it. Returns whether to restart.
async fn handle_connection(
    socket: &mut TcpSocket<'_>,
    device: &SharedDevice,
    radio: &SharedRadio,
) -> Result<bool, &'static str> {
    let mut buf = [0u8; HEADER_MAX + BODY_MAX];
    let mut filled = 0usize;
    let header_end = loop {
        if filled >= HEADER_MAX {
            write_response(socket, &PortalResponse::too_large()).await;
            return Err("header too large");
        }
        let n = socket.read(&mut buf[filled..HEADER_MAX]).await.map_err(|_| "read")?;
        if n == 0 {
            return Err("eof");
        }
        filled += n;
        if let Some(end) = find_header_end(&buf[..filled]) {
            break end;
        }
    };

    let header = core::str::from_utf8(&buf[..header_end]).map_err(|_| "header utf8")?;
    let request = Request::parse(header)?;
    debug!("Portal {} {}", request.method, request.target);

    let body_start = header_end + 4;
    let body_len = request.content_length.unwrap_or(0);
    if body_len > BODY_MAX {
        write_response(socket, &PortalResponse::too_large()).await;
        return Err("body too large");
    }

    let mut body = Vec::with_capacity(body_len);
    body.extend_from_slice(&buf[body_start..filled.max(body_start)]);
    body.truncate(body_len);
    while body.len() < body_len {
        let mut chunk = [0u8; 128];
        let want = (body_len - body.len()).min(chunk.len());
        let n = socket.read(&mut chunk[..want]).await.map_err(|_| "read body")?;
        if n == 0 {
            return Err("eof in body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let body = core::str::from_utf8(&body).map_err(|_| "body utf8")?;

    let networks = if request.route() == Route::Scan {
        match radio.lock().await.scan().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!("Scan failed: {}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let response = {
        let mut device = device.lock().await;
        device.handle_request(&request, body, Instant::now().as_millis(), &networks)
    };
    write_response(socket, &response).await;
    Ok(response.restart)
}

async fn write_response(socket: &mut TcpSocket<'_>, response: &PortalResponse) {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status_line(),
        response.content_type,
        response.body.len()
    );
    if let Err(e) = socket.write_all(head.as_bytes()).await {
        debug!("Portal response head not sent: {:?}", e);
        return;
    }
    if let Err(e) = socket.write_all(response.body.as_bytes()).await {
        debug!("Portal response body not sent: {:?}", e);
    }
}
