//! Probe transports.
//!
//! A transport sends exactly one hop-limited echo request and reports what came
//! back. The engine owns scheduling; transports never retry.

use std::{
    io,
    mem::MaybeUninit,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pnet::packet::{
    icmp::{
        echo_reply::EchoReplyPacket,
        echo_request::{EchoRequestPacket, MutableEchoRequestPacket},
        IcmpCode, IcmpPacket, IcmpTypes,
    },
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    util, MutablePacket, Packet,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::config::ESTIMATION_HOP_LIMIT;
use crate::error::ProbeError;

/// Maximum MTU size for network packets
const MAX_MTU: usize = 1500;

/// Echo request payload length (matches the 32 byte buffer classic ping tools send)
const PAYLOAD_LEN: usize = 32;

/// Starting sequence number for probe packets
const INITIAL_SEQUENCE: u16 = 32768;

/// What answered a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The target itself sent an echo reply.
    EchoReply,
    /// A router on the path reported the hop limit expired.
    TtlExpired,
    /// Nothing matching arrived before the timeout.
    Timeout,
    /// Destination or route unreachable was reported.
    Unreachable,
}

impl ProbeStatus {
    /// Echo replies and TTL-exceeded replies both count as a hop answering.
    pub fn is_reply(self) -> bool {
        matches!(self, ProbeStatus::EchoReply | ProbeStatus::TtlExpired)
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    pub address: Option<IpAddr>,
    pub latency: Duration,
    pub status: ProbeStatus,
    /// Remaining hop limit carried by the reply, when the transport can see it.
    pub reply_ttl: Option<u8>,
}

impl ProbeReply {
    pub fn timeout(latency: Duration) -> Self {
        Self {
            address: None,
            latency,
            status: ProbeStatus::Timeout,
            reply_ttl: None,
        }
    }
}

/// Sends hop-limited echo probes.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Send one echo request to `target` with the given hop limit and wait at most `timeout`.
    async fn probe(
        &self,
        target: IpAddr,
        hop_limit: u8,
        timeout: Duration,
    ) -> Result<ProbeReply, ProbeError>;

    /// Send one probe with an effectively unlimited hop limit.
    async fn probe_unlimited(
        &self,
        target: IpAddr,
        timeout: Duration,
    ) -> Result<ProbeReply, ProbeError> {
        self.probe(target, ESTIMATION_HOP_LIMIT, timeout).await
    }
}

/// Raw-socket ICMP/ICMPv6 transport. Every probe opens its own socket on a blocking
/// thread and filters the replies it sees by identifier and sequence number.
pub struct IcmpTransport {
    identifier: u16,
    next_seq: AtomicU16,
}

impl IcmpTransport {
    /// Create the transport, checking up front that raw sockets can be opened.
    pub fn new() -> Result<Self, ProbeError> {
        open_socket(false)?;
        Ok(Self {
            identifier: std::process::id() as u16,
            next_seq: AtomicU16::new(INITIAL_SEQUENCE),
        })
    }

    fn alloc_seq(&self) -> u16 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ProbeTransport for IcmpTransport {
    async fn probe(
        &self,
        target: IpAddr,
        hop_limit: u8,
        timeout: Duration,
    ) -> Result<ProbeReply, ProbeError> {
        let id = self.identifier;
        let seq = self.alloc_seq();

        tokio::task::spawn_blocking(move || probe_blocking(target, hop_limit, timeout, id, seq))
            .await
            .map_err(|e| ProbeError::Aborted(e.to_string()))?
    }
}

fn open_socket(ipv6: bool) -> Result<Socket, ProbeError> {
    let socket = if ipv6 {
        Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
    } else {
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
    };
    socket.map_err(ProbeError::Socket)
}

fn probe_blocking(
    target: IpAddr,
    hop_limit: u8,
    timeout: Duration,
    id: u16,
    seq: u16,
) -> Result<ProbeReply, ProbeError> {
    let socket = open_socket(target.is_ipv6())?;
    let packet = match target {
        IpAddr::V4(_) => {
            socket.set_ttl(hop_limit.into())?;
            construct_icmp_packet(id, seq)?
        }
        IpAddr::V6(_) => {
            socket.set_unicast_hops_v6(hop_limit.into())?;
            construct_icmp6_packet(id, seq)
        }
    };

    let start = Instant::now();
    socket.send_to(&packet, &SocketAddr::new(target, 0).into())?;
    trace!("Sent probe to {} ttl={} seq={}", target, hop_limit, seq);

    let mut buffer = [0u8; MAX_MTU];
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Ok(ProbeReply::timeout(start.elapsed()));
        }
        socket.set_read_timeout(Some(remaining))?;

        let (len, from) = match recv_from(&socket, &mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(ProbeReply::timeout(start.elapsed()));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let latency = start.elapsed();

        let parsed = match target {
            IpAddr::V4(_) => parse_icmp_response(&buffer[..len], id, seq),
            IpAddr::V6(_) => parse_icmp6_response(&buffer[..len], &from, id, seq),
        };

        if let Some((address, status, reply_ttl)) = parsed {
            debug!(
                "Probe seq={} ttl={} answered by {} ({:?}) in {:.1}ms",
                seq,
                hop_limit,
                address,
                status,
                latency.as_secs_f64() * 1000.0
            );
            return Ok(ProbeReply {
                address: Some(address),
                latency,
                status,
                reply_ttl,
            });
        }
    }
}

fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    // SAFETY: `u8` and `MaybeUninit<u8>` share layout, and the socket only ever
    // writes initialised bytes into the slice.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(uninit)
}

/// Build an ICMPv4 echo request carrying `id`/`seq`.
fn construct_icmp_packet(id: u16, seq: u16) -> Result<Vec<u8>, ProbeError> {
    let mut buffer = vec![0u8; 8 + PAYLOAD_LEN];
    let mut icmp_packet = MutableEchoRequestPacket::new(&mut buffer).ok_or(ProbeError::Packet)?;

    icmp_packet.set_icmp_type(IcmpTypes::EchoRequest);
    icmp_packet.set_icmp_code(IcmpCode::new(0));
    icmp_packet.set_identifier(id);
    icmp_packet.set_sequence_number(seq);

    let payload = format!("hoptrace-{}-{}", id, seq);
    let payload_bytes = payload.as_bytes();
    let room = icmp_packet.payload().len();
    let n = payload_bytes.len().min(room);
    icmp_packet.payload_mut()[..n].copy_from_slice(&payload_bytes[..n]);

    let checksum = util::checksum(icmp_packet.packet(), 1);
    icmp_packet.set_checksum(checksum);

    Ok(buffer)
}

/// Build an ICMPv6 echo request. The kernel fills in the ICMPv6 checksum.
fn construct_icmp6_packet(id: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + PAYLOAD_LEN];
    packet[0] = 128;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet
}

/// Parse an IPv4 datagram (header included) received on the raw socket. Returns
/// `None` for anything that does not answer our `id`/`seq`.
fn parse_icmp_response(buf: &[u8], id: u16, seq: u16) -> Option<(IpAddr, ProbeStatus, Option<u8>)> {
    let ip_packet = Ipv4Packet::new(buf)?;
    if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let source = IpAddr::V4(ip_packet.get_source());
    let icmp_start = (ip_packet.get_header_length() as usize) * 4;
    let icmp_bytes = buf.get(icmp_start..)?;
    let icmp_packet = IcmpPacket::new(icmp_bytes)?;

    match icmp_packet.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(icmp_bytes)?;
            (reply.get_identifier() == id && reply.get_sequence_number() == seq)
                .then_some((source, ProbeStatus::EchoReply, Some(ip_packet.get_ttl())))
        }
        IcmpTypes::TimeExceeded => (extract_original_packet_info(icmp_packet.payload())?
            == (id, seq))
            .then_some((source, ProbeStatus::TtlExpired, None)),
        IcmpTypes::DestinationUnreachable => (extract_original_packet_info(icmp_packet.payload())?
            == (id, seq))
            .then_some((source, ProbeStatus::Unreachable, None)),
        _ => None,
    }
}

/// Pull the identifier and sequence of our echo request back out of an ICMP error payload.
fn extract_original_packet_info(payload: &[u8]) -> Option<(u16, u16)> {
    // 4 unused bytes precede the quoted IP header
    let orig_ip_bytes = payload.get(4..)?;
    let orig_ip_packet = Ipv4Packet::new(orig_ip_bytes)?;
    if orig_ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let orig_icmp_start = (orig_ip_packet.get_header_length() as usize) * 4;
    let orig_icmp = orig_ip_bytes.get(orig_icmp_start..orig_icmp_start + 8)?;
    let request = EchoRequestPacket::new(orig_icmp)?;
    Some((request.get_identifier(), request.get_sequence_number()))
}

/// Parse an ICMPv6 message (raw ICMPv6 sockets deliver no IP header).
///
/// The remaining hop limit of an IPv6 reply only arrives as `IPV6_HOPLIMIT`
/// ancillary data, which this plain `recv_from` path does not request, so echo
/// replies carry `reply_ttl: None` and hop-count estimation for IPv6 targets
/// falls back to the maximum hop count.
fn parse_icmp6_response(
    buf: &[u8],
    from: &SockAddr,
    id: u16,
    seq: u16,
) -> Option<(IpAddr, ProbeStatus, Option<u8>)> {
    if buf.len() < 8 {
        return None;
    }
    let source = match from.as_socket()? {
        SocketAddr::V6(v6) => IpAddr::V6(*v6.ip()),
        SocketAddr::V4(v4) => IpAddr::V4(*v4.ip()),
    };
    let ids = |offset: usize| -> Option<(u16, u16)> {
        let header = buf.get(offset..offset + 8)?;
        Some((
            u16::from_be_bytes([header[4], header[5]]),
            u16::from_be_bytes([header[6], header[7]]),
        ))
    };

    // ICMPv6 header (8) + quoted IPv6 header (40)
    let quoted = 8 + 40;
    let (status, matched) = match buf[0] {
        129 => (ProbeStatus::EchoReply, ids(0)),
        3 => (ProbeStatus::TtlExpired, ids(quoted)),
        1 => (ProbeStatus::Unreachable, ids(quoted)),
        _ => return None,
    };
    (matched? == (id, seq)).then_some((source, status, None))
}

/// Transport that fabricates a plausible path, for demos and unprivileged runs.
pub struct SimulatedTransport {
    path_len: u8,
    loss_rate: f64,
}

impl SimulatedTransport {
    pub fn new(path_len: u8, loss_rate: f64) -> Self {
        Self {
            path_len: path_len.max(1),
            loss_rate: loss_rate.clamp(0.0, 1.0),
        }
    }

    fn router_addr(hop: u8) -> IpAddr {
        match hop {
            1 => IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            _ => IpAddr::V4(Ipv4Addr::new(10, 0, hop, 1)),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(8, 0.02)
    }
}

#[async_trait]
impl ProbeTransport for SimulatedTransport {
    async fn probe(
        &self,
        target: IpAddr,
        hop_limit: u8,
        timeout: Duration,
    ) -> Result<ProbeReply, ProbeError> {
        let reaches_target = hop_limit >= self.path_len;
        let distance = hop_limit.min(self.path_len) as u64;
        let base_latency = distance * 10 + 5;
        let jitter = rand::random::<u64>() % 15;
        let lost = rand::random::<f64>() < self.loss_rate;
        let latency = Duration::from_millis(base_latency + jitter);

        if lost || latency > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(ProbeReply::timeout(timeout));
        }
        tokio::time::sleep(latency).await;

        let (address, status, reply_ttl) = if reaches_target {
            (target, ProbeStatus::EchoReply, Some(64 - self.path_len.min(63)))
        } else {
            (Self::router_addr(hop_limit), ProbeStatus::TtlExpired, None)
        };

        Ok(ProbeReply {
            address: Some(address),
            latency,
            status,
            reply_ttl,
        })
    }
}
