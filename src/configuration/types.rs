use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Where mirrored requests are sent: `http://<host>:<port><request-uri>`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MirrorTarget {
    pub host: String,
    pub port: u16,
}

impl MirrorTarget {
    /// The `host:port` authority, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for MirrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

/// How frames are captured.
#[derive(Debug, PartialEq, Clone)]
pub struct CaptureSettings {
    /// Interface to open in promiscuous mode. `any` captures on all interfaces.
    pub interface: String,
    /// Replay this capture file instead of opening `interface`.
    pub pcap_file: Option<PathBuf>,
    pub snaplen: i32,
    pub promiscuous: bool,
    /// Read timeout of the capture handle, lets the capture thread notice shutdown.
    pub read_timeout_ms: i32,
    /// Capacity of the channel between the capture thread and the controller.
    pub channel_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: String::from("any"),
            pcap_file: None,
            snaplen: 65535,
            promiscuous: true,
            read_timeout_ms: 500,
            channel_capacity: 4096,
        }
    }
}

/// Bounds and timers of the flow table.
#[derive(Debug, PartialEq, Clone)]
pub struct AssemblerSettings {
    /// Flows idle longer than this are evicted by the sweep.
    pub flow_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_flows: usize,
    /// Out-of-order bytes held per flow while waiting for a gap to close.
    pub max_pending_bytes: usize,
    /// Released chunks queued per flow before its reader is considered stalled.
    pub flow_channel_capacity: usize,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            flow_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            max_flows: 65536,
            max_pending_bytes: 4 * 1024 * 1024,
            flow_channel_capacity: 1024,
        }
    }
}

/// Size caps applied while framing requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FramingLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for FramingLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct ForwarderSettings {
    pub timeout: Duration,
    /// Forwards allowed in flight at once; extra requests are dropped.
    pub max_in_flight: usize,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_in_flight: 256,
        }
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, PartialEq, Clone)]
pub struct Config {
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination: MirrorTarget,
    pub capture: CaptureSettings,
    pub assembler: AssemblerSettings,
    pub framing: FramingLimits,
    pub forwarder: ForwarderSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_brackets_ipv6() {
        let v4 = MirrorTarget {
            host: "10.0.0.9".to_string(),
            port: 8080,
        };
        assert_eq!(v4.authority(), "10.0.0.9:8080");

        let v6 = MirrorTarget {
            host: "fd00::9".to_string(),
            port: 8080,
        };
        assert_eq!(v6.authority(), "[fd00::9]:8080");

        let named = MirrorTarget {
            host: "canary.svc".to_string(),
            port: 80,
        };
        assert_eq!(named.to_string(), "canary.svc:80");
    }
}
