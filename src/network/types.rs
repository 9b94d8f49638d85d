use crate::error_handling::types::FrameError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One direction of a TCP connection. Routes every segment to exactly one reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

/// Control flags the assembler cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// A captured TCP payload chunk.
#[derive(Debug, Clone)]
pub struct Segment {
    pub key: FlowKey,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// A frame as delivered by the capture handle.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Link-layer framing of captured frames, derived from the pcap data link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux cooked capture, used by the `any` pseudo-device.
    LinuxSll,
    LinuxSll2,
    /// BSD loopback encapsulation (4-byte family header).
    Null,
    /// Bare IPv4/IPv6 packets.
    Raw,
}

impl LinkLayer {
    pub fn from_dlt(dlt: i32) -> Result<Self, FrameError> {
        match dlt {
            1 => Ok(LinkLayer::Ethernet),
            113 => Ok(LinkLayer::LinuxSll),
            276 => Ok(LinkLayer::LinuxSll2),
            0 | 108 => Ok(LinkLayer::Null),
            12 | 14 | 101 | 228 | 229 => Ok(LinkLayer::Raw),
            other => Err(FrameError::UnsupportedLinkType(other)),
        }
    }

    /// Bytes preceding the network layer, for encapsulations etherparse does not slice itself.
    pub(crate) fn header_len(&self) -> usize {
        match self {
            LinkLayer::Ethernet | LinkLayer::Raw => 0,
            LinkLayer::LinuxSll => 16,
            LinkLayer::LinuxSll2 => 20,
            LinkLayer::Null => 4,
        }
    }
}
