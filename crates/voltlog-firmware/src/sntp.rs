//! Single-shot SNTP query.

use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, Instant, with_timeout};
use log::{debug, info};

use crate::error::LinkError;

pub const NTP_SERVER: &str = "pool.ntp.org";
const NTP_PORT: u16 = 123;
const NTP_PACKET_SIZE: usize = 48;
/// Seconds between 1900-01-01 and 1970-01-01
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;
/// LI = 0, version 4, mode 3 (client)
const CLIENT_HEADER: u8 = 0b00_100_011;

/// Asks `server` for the time. The whole exchange, DNS included, is bounded
/// by `timeout`. Returns unix milliseconds corrected by half the round trip.
pub async fn query_unix_ms(
    stack: Stack<'_>,
    server: &str,
    timeout: Duration,
) -> Result<u64, LinkError> {
    with_timeout(timeout, exchange(stack, server))
        .await
        .map_err(|_| LinkError::Timeout)?
}

async fn exchange(stack: Stack<'_>, server: &str) -> Result<u64, LinkError> {
    let addresses = stack
        .dns_query(server, DnsQueryType::A)
        .await
        .map_err(|_| LinkError::Dns)?;
    let address = *addresses.first().ok_or(LinkError::Dns)?;
    let endpoint = IpEndpoint::new(address, NTP_PORT);

    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buffer = [0; NTP_PACKET_SIZE];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_buffer = [0; NTP_PACKET_SIZE];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    socket.bind(0).map_err(|_| LinkError::Socket)?;

    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = CLIENT_HEADER;

    let sent_at = Instant::now();
    socket
        .send_to(&packet, endpoint)
        .await
        .map_err(|_| LinkError::Socket)?;
    debug!("SNTP request sent to {}", endpoint);

    let mut response = [0u8; NTP_PACKET_SIZE];
    let (len, _) = socket
        .recv_from(&mut response)
        .await
        .map_err(|_| LinkError::Socket)?;
    let round_trip_ms = (Instant::now() - sent_at).as_millis();

    let unix_ms = parse_transmit_time(&response[..len]).ok_or(LinkError::InvalidTime)?;
    info!("SNTP time {} ms (round trip {} ms)", unix_ms, round_trip_ms);
    Ok(unix_ms + round_trip_ms / 2)
}

/// Unix milliseconds from the transmit timestamp (bytes 40..48).
fn parse_transmit_time(packet: &[u8]) -> Option<u64> {
    if packet.len() != NTP_PACKET_SIZE {
        return None;
    }
    let seconds = u32::from_be_bytes(packet[40..44].try_into().ok()?) as u64;
    let fraction = u32::from_be_bytes(packet[44..48].try_into().ok()?) as u64;
    let unix_secs = seconds.checked_sub(NTP_EPOCH_OFFSET)?;
    Some(unix_secs * 1000 + ((fraction * 1000) >> 32))
}
