//! Turns captured link-layer frames into TCP [`Segment`]s.

use super::types::{FlowKey, LinkLayer, RawFrame, Segment, TcpFlags};
use crate::error_handling::types::FrameError;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

/// Slices `frame` down to its TCP header and payload.
///
/// The payload shares the frame's buffer, no bytes are copied.
pub fn decode_segment(link: LinkLayer, frame: &RawFrame) -> Result<Segment, FrameError> {
    let data = &frame.data[..];
    let sliced = match link {
        LinkLayer::Ethernet => {
            SlicedPacket::from_ethernet(data).map_err(|_| FrameError::Malformed)?
        }
        other => {
            let skip = other.header_len();
            if data.len() <= skip {
                return Err(FrameError::Malformed);
            }
            SlicedPacket::from_ip(&data[skip..]).map_err(|_| FrameError::MissingNetworkLayer)?
        }
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return Err(FrameError::MissingNetworkLayer),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        Some(_) => return Err(FrameError::NotTcp),
        None => return Err(FrameError::MissingTransportLayer),
    };

    Ok(Segment {
        key: FlowKey {
            src_ip,
            src_port: tcp.source_port(),
            dst_ip,
            dst_port: tcp.destination_port(),
        },
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload: frame.data.slice_ref(tcp.payload()),
        timestamp: frame.timestamp,
    })
}

/// Frame builders shared by the unit and pipeline tests.
#[cfg(test)]
pub(crate) mod test_frames {
    use crate::network::types::RawFrame;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use etherparse::PacketBuilder;

    #[derive(Clone, Copy, Default)]
    pub struct Flags {
        pub syn: bool,
        pub fin: bool,
        pub rst: bool,
    }

    pub const DATA: Flags = Flags {
        syn: false,
        fin: false,
        rst: false,
    };
    pub const SYN: Flags = Flags {
        syn: true,
        fin: false,
        rst: false,
    };
    pub const FIN: Flags = Flags {
        syn: false,
        fin: true,
        rst: false,
    };
    pub const RST: Flags = Flags {
        syn: false,
        fin: false,
        rst: true,
    };

    /// An Ethernet/IPv4/TCP frame.
    pub fn tcp_frame(
        src: ([u8; 4], u16),
        dst: ([u8; 4], u16),
        seq: u32,
        flags: Flags,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut tcp = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src.0, dst.0, 64)
            .tcp(src.1, dst.1, seq, 64240);
        if flags.syn {
            tcp = tcp.syn();
        }
        if flags.fin {
            tcp = tcp.fin();
        }
        if flags.rst {
            tcp = tcp.rst();
        }
        let tcp = tcp.ack(1);
        let mut out = Vec::with_capacity(tcp.size(payload.len()));
        tcp.write(&mut out, payload)
            .unwrap_or_else(|e| panic!("building test frame: {:?}", e));
        out
    }

    pub fn udp_frame(src: ([u8; 4], u16), dst: ([u8; 4], u16), payload: &[u8]) -> Vec<u8> {
        let udp = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src.0, dst.0, 64)
            .udp(src.1, dst.1);
        let mut out = Vec::with_capacity(udp.size(payload.len()));
        udp.write(&mut out, payload)
            .unwrap_or_else(|e| panic!("building test frame: {:?}", e));
        out
    }

    pub fn raw(data: Vec<u8>, timestamp: DateTime<Utc>) -> RawFrame {
        RawFrame {
            data: Bytes::from(data),
            timestamp,
        }
    }
}
