//! Minimal DHCPv4 server for the portal access point.
//!
//! Hands out addresses from a small pool keyed by client MAC and answers
//! DISCOVER with OFFER and REQUEST with ACK or NAK. Leases never expire;
//! the pool only has to outlive one provisioning session.

use alloc::vec;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use log::{debug, info, warn};

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;
const LEASE_SECS: u32 = 3600;

const HEADER_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_START: usize = HEADER_LEN + MAGIC_COOKIE.len();
const PACKET_MAX: usize = 576;

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;
const NAK: u8 = 6;

type Mac = [u8; 6];

struct Pool {
    start: u32,
    leases: Vec<Option<Mac>>,
}

impl Pool {
    fn new(start: Ipv4Addr, size: u8) -> Self {
        Self {
            start: u32::from(start),
            leases: vec![None; usize::from(size)],
        }
    }

    /// Address already leased to `mac`, else the first free one.
    fn assign(&mut self, mac: Mac) -> Option<Ipv4Addr> {
        let slot = match self.leases.iter().position(|lease| *lease == Some(mac)) {
            Some(slot) => slot,
            None => {
                let free = self.leases.iter().position(Option::is_none)?;
                self.leases[free] = Some(mac);
                free
            }
        };
        Some(self.address(slot))
    }

    fn leased_to(&self, mac: Mac) -> Option<Ipv4Addr> {
        self.leases
            .iter()
            .position(|lease| *lease == Some(mac))
            .map(|slot| self.address(slot))
    }

    fn address(&self, slot: usize) -> Ipv4Addr {
        Ipv4Addr::from(self.start + slot as u32)
    }
}

struct ClientMessage {
    xid: [u8; 4],
    flags: [u8; 2],
    chaddr: [u8; 16],
    kind: u8,
    requested: Option<Ipv4Addr>,
}

impl ClientMessage {
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < OPTIONS_START
            || packet[0] != OP_REQUEST
            || packet[HEADER_LEN..OPTIONS_START] != MAGIC_COOKIE
        {
            return None;
        }

        let mut kind = None;
        let mut requested = None;
        let mut i = OPTIONS_START;
        while i < packet.len() {
            let code = packet[i];
            if code == OPT_END {
                break;
            }
            if code == OPT_PAD {
                i += 1;
                continue;
            }
            let len = usize::from(*packet.get(i + 1)?);
            let value = packet.get(i + 2..i + 2 + len)?;
            match (code, value) {
                (OPT_MESSAGE_TYPE, [t]) => kind = Some(*t),
                (OPT_REQUESTED_IP, [a, b, c, d]) => requested = Some(Ipv4Addr::new(*a, *b, *c, *d)),
                _ => {}
            }
            i += 2 + len;
        }

        Some(Self {
            xid: packet[4..8].try_into().ok()?,
            flags: packet[10..12].try_into().ok()?,
            chaddr: packet[28..44].try_into().ok()?,
            kind: kind?,
            requested,
        })
    }

    fn mac(&self) -> Mac {
        let mut mac = [0; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        mac
    }
}

struct Reply<'a> {
    buf: &'a mut [u8; PACKET_MAX],
    len: usize,
}

impl<'a> Reply<'a> {
    fn new(buf: &'a mut [u8; PACKET_MAX], msg: &ClientMessage, yiaddr: Ipv4Addr, server: Ipv4Addr) -> Self {
        buf.fill(0);
        buf[0] = OP_REPLY;
        buf[1] = 1; // Ethernet
        buf[2] = 6;
        buf[4..8].copy_from_slice(&msg.xid);
        buf[10..12].copy_from_slice(&msg.flags);
        buf[16..20].copy_from_slice(&yiaddr.octets());
        buf[20..24].copy_from_slice(&server.octets());
        buf[28..44].copy_from_slice(&msg.chaddr);
        buf[HEADER_LEN..OPTIONS_START].copy_from_slice(&MAGIC_COOKIE);
        Self {
            buf,
            len: OPTIONS_START,
        }
    }

    fn option(&mut self, code: u8, value: &[u8]) {
        let end = self.len + 2 + value.len();
        self.buf[self.len] = code;
        self.buf[self.len + 1] = value.len() as u8;
        self.buf[self.len + 2..end].copy_from_slice(value);
        self.len = end;
    }

    fn finish(self) -> &'a [u8] {
        let len = self.len;
        self.buf[len] = OPT_END;
        let buf: &'a [u8; PACKET_MAX] = self.buf;
        &buf[..=len]
    }
}

fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    };
    Ipv4Addr::from(bits)
}

/// Serves leases on the access-point stack forever.
#[embassy_executor::task]
pub async fn dhcp_server_task(
    stack: Stack<'static>,
    server_ip: Ipv4Addr,
    prefix_len: u8,
    pool_start: Ipv4Addr,
    pool_size: u8,
) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0; 1024];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_buffer = [0; 1024];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(e) = socket.bind(SERVER_PORT) {
        warn!("DHCP server could not bind: {:?}", e);
        return;
    }
    info!(
        "DHCP server on {} leasing {} addresses from {}",
        server_ip, pool_size, pool_start
    );

    let mask = netmask(prefix_len);
    let broadcast = IpEndpoint::new(IpAddress::Ipv4(Ipv4Addr::BROADCAST), CLIENT_PORT);
    let mut pool = Pool::new(pool_start, pool_size);
    let mut packet = [0u8; PACKET_MAX];
    let mut reply = [0u8; PACKET_MAX];

    loop {
        let (len, _) = match socket.recv_from(&mut packet).await {
            Ok(received) => received,
            Err(e) => {
                debug!("DHCP receive failed: {:?}", e);
                continue;
            }
        };
        let Some(msg) = ClientMessage::parse(&packet[..len]) else {
            continue;
        };

        let (kind, address) = match msg.kind {
            DISCOVER => match pool.assign(msg.mac()) {
                Some(address) => (OFFER, address),
                None => {
                    warn!("DHCP pool exhausted");
                    continue;
                }
            },
            REQUEST => match (pool.leased_to(msg.mac()), msg.requested) {
                (Some(leased), Some(requested)) if leased != requested => (NAK, Ipv4Addr::UNSPECIFIED),
                (Some(leased), _) => (ACK, leased),
                (None, _) => match pool.assign(msg.mac()) {
                    Some(address) if msg.requested.is_none_or(|r| r == address) => (ACK, address),
                    _ => (NAK, Ipv4Addr::UNSPECIFIED),
                },
            },
            _ => continue,
        };

        let mut out = Reply::new(&mut reply, &msg, address, server_ip);
        out.option(OPT_MESSAGE_TYPE, &[kind]);
        out.option(OPT_SERVER_ID, &server_ip.octets());
        if kind != NAK {
            out.option(OPT_LEASE_TIME, &LEASE_SECS.to_be_bytes());
            out.option(OPT_SUBNET_MASK, &mask.octets());
            out.option(OPT_ROUTER, &server_ip.octets());
        }

        if let Err(e) = socket.send_to(out.finish(), broadcast).await {
            debug!("DHCP reply failed: {:?}", e);
        } else if kind == ACK {
            info!("DHCP lease {} acknowledged", address);
        }
    }
}
