//! Flow identification
//!
//! A flow is one transport-layer connection identified by its 5-tuple.
//! The key is extracted from raw IP packets read off the local interface
//! and is used purely for lookup; it is immutable once created.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::FlowError;

/// IANA protocol number for TCP
const PROTO_TCP: u8 = 6;
/// IANA protocol number for UDP
const PROTO_UDP: u8 = 17;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TCP (protocol 6)
    Tcp,
    /// UDP (protocol 17)
    Udp,
}

impl Transport {
    /// Map an IANA protocol number to a transport, if supported
    #[must_use]
    pub const fn from_protocol(proto: u8) -> Option<Self> {
        match proto {
            PROTO_TCP => Some(Self::Tcp),
            PROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// 5-tuple identifying one active connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub transport: Transport,
    /// Local (device-side) endpoint
    pub local: SocketAddr,
    /// Remote endpoint
    pub remote: SocketAddr,
}

impl FlowKey {
    /// Create a flow key from its parts
    #[must_use]
    pub const fn new(transport: Transport, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            transport,
            local,
            remote,
        }
    }

    /// Extract the flow key from a raw outbound IP packet.
    ///
    /// The packet's source is taken as the local endpoint and its
    /// destination as the remote endpoint, which matches the orientation
    /// of packets read from the local interface.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::NotIp` for non-IP data, `FlowError::Truncated`
    /// for packets cut mid-header, and `FlowError::UnsupportedTransport`
    /// for protocols without ports (ICMP and friends carry no flow
    /// identity and are handled by policy, not tracking).
    pub fn parse(packet: &[u8]) -> Result<Self, FlowError> {
        if packet.is_empty() {
            return Err(FlowError::NotIp(0));
        }

        let version = packet[0] >> 4;
        let (src_ip, dst_ip, protocol, transport_bytes) = match version {
            4 => parse_ipv4(packet)?,
            6 => parse_ipv6(packet)?,
            _ => return Err(FlowError::NotIp(packet.len())),
        };

        let transport = Transport::from_protocol(protocol)
            .ok_or(FlowError::UnsupportedTransport(protocol))?;

        if transport_bytes.len() < 4 {
            return Err(FlowError::Truncated("transport header".into()));
        }

        let src_port = u16::from_be_bytes([transport_bytes[0], transport_bytes[1]]);
        let dst_port = u16::from_be_bytes([transport_bytes[2], transport_bytes[3]]);

        Ok(Self {
            transport,
            local: SocketAddr::new(src_ip, src_port),
            remote: SocketAddr::new(dst_ip, dst_port),
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.transport, self.local, self.remote)
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<(IpAddr, IpAddr, u8, &[u8]), FlowError> {
    if packet.len() < 20 {
        return Err(FlowError::Truncated("ipv4 header".into()));
    }

    let ihl = (packet[0] & 0x0f) as usize * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(FlowError::Truncated("ipv4 options".into()));
    }

    let protocol = packet[9];
    let src_ip = IpAddr::V4(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ));

    Ok((src_ip, dst_ip, protocol, &packet[ihl..]))
}

fn parse_ipv6(packet: &[u8]) -> Result<(IpAddr, IpAddr, u8, &[u8]), FlowError> {
    if packet.len() < 40 {
        return Err(FlowError::Truncated("ipv6 header".into()));
    }

    // Extension headers are not walked; flows behind them fall out as
    // unsupported transports and are handled by policy.
    let next_header = packet[6];

    let src_octets: [u8; 16] = packet[8..24]
        .try_into()
        .map_err(|_| FlowError::Truncated("ipv6 src".into()))?;
    let dst_octets: [u8; 16] = packet[24..40]
        .try_into()
        .map_err(|_| FlowError::Truncated("ipv6 dst".into()))?;

    let src_ip = IpAddr::V6(Ipv6Addr::from(src_octets));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(dst_octets));

    Ok((src_ip, dst_ip, next_header, &packet[40..]))
}
