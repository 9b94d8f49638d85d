use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line and environment arguments of the agent.
///
/// Every flag can also be supplied through the environment variable named in its `env`
/// attribute. The four orchestration values (`SOURCE_IP`, `SOURCE_PORT`, `DESTINATION_IP`,
/// `DESTINATION_PORT`) are usually injected that way when the agent is deployed next to the
/// workload it mirrors.
///
/// Values given here take precedence over the ones read from `config_file`, which in turn
/// take precedence over the built-in defaults. Nothing is validated at this stage; see
/// [`Config::load`].
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "shadowtap")]
#[command(version)]
#[command(about = "Mirrors live HTTP requests onto a shadow destination")]
pub struct Args {
    /// Optional TOML configuration file
    ///
    /// # Command Line
    /// Use `--config-file <PATH>` or `CONFIG_FILE`
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Address of the mirrored workload. Captured traffic is filtered on it.
    #[arg(long, env = "SOURCE_IP")]
    pub source_ip: Option<String>,

    /// Port of the mirrored workload.
    #[arg(long, env = "SOURCE_PORT")]
    pub source_port: Option<String>,

    /// Host (address or name) receiving the mirrored requests.
    #[arg(long, env = "DESTINATION_IP")]
    pub destination_ip: Option<String>,

    /// Port receiving the mirrored requests.
    #[arg(long, env = "DESTINATION_PORT")]
    pub destination_port: Option<String>,

    /// Capture interface, `any` by default
    #[arg(long, env = "CAPTURE_INTERFACE")]
    pub interface: Option<String>,

    /// Replay a capture file instead of capturing live
    #[arg(long, env = "PCAP_FILE")]
    pub pcap_file: Option<PathBuf>,

    /// Idle time after which a flow is evicted
    #[arg(long, env = "FLOW_TIMEOUT_SECS")]
    pub flow_timeout_secs: Option<u64>,

    /// Timeout applied to every mirrored request
    #[arg(long, env = "FORWARD_TIMEOUT_SECS")]
    pub forward_timeout_secs: Option<u64>,

    /// Maximum number of mirrored requests in flight
    #[arg(long, env = "MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    source: SourceSection,
    destination: DestinationSection,
    capture: CaptureSection,
    assembler: AssemblerSection,
    http: HttpSection,
    forwarder: ForwarderSection,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct SourceSection {
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct DestinationSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct CaptureSection {
    interface: Option<String>,
    pcap_file: Option<PathBuf>,
    snaplen: Option<i32>,
    promiscuous: Option<bool>,
    read_timeout_ms: Option<i32>,
    channel_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct AssemblerSection {
    flow_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    max_flows: Option<usize>,
    max_pending_bytes: Option<usize>,
    flow_channel_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct HttpSection {
    max_head_bytes: Option<usize>,
    max_body_bytes: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct ForwarderSection {
    timeout_secs: Option<u64>,
    max_in_flight: Option<usize>,
}

impl FileConfig {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl Config {
    /// Builds the runtime configuration from parsed arguments and the optional file they
    /// point to.
    ///
    /// The destination is checked here so that the agent refuses to start rather than
    /// building unreachable mirror URLs once traffic flows.
    ///
    /// # Errors
    /// - [`ConfigError::IoError`] / [`ConfigError::TomlError`] if the file can't be read
    /// - [`ConfigError::MissingValue`] if one of the four endpoint values is absent
    /// - [`ConfigError::BadIPFormatting`], [`ConfigError::BadPort`],
    ///   [`ConfigError::InvalidDestination`], [`ConfigError::NotInRange`] for bad values
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config_file {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };

        let source_ip = match args.source_ip.as_deref().or(file.source.ip.as_deref()) {
            Some(raw) => parse_ip("SOURCE_IP", raw)?,
            None => return Err(ConfigError::MissingValue("SOURCE_IP")),
        };
        let source_port = resolve_port("SOURCE_PORT", &args.source_port, file.source.port)?;

        let host = args
            .destination_ip
            .clone()
            .or(file.destination.host)
            .ok_or(ConfigError::MissingValue("DESTINATION_IP"))?;
        let port = resolve_port(
            "DESTINATION_PORT",
            &args.destination_port,
            file.destination.port,
        )?;
        let destination = validate_destination(&host, port)?;

        let capture_defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            interface: args
                .interface
                .clone()
                .or(file.capture.interface)
                .unwrap_or(capture_defaults.interface),
            pcap_file: args.pcap_file.clone().or(file.capture.pcap_file),
            snaplen: file.capture.snaplen.unwrap_or(capture_defaults.snaplen),
            promiscuous: file
                .capture
                .promiscuous
                .unwrap_or(capture_defaults.promiscuous),
            read_timeout_ms: file
                .capture
                .read_timeout_ms
                .unwrap_or(capture_defaults.read_timeout_ms),
            channel_capacity: file
                .capture
                .channel_capacity
                .unwrap_or(capture_defaults.channel_capacity),
        };

        let assembler_defaults = AssemblerSettings::default();
        let assembler = AssemblerSettings {
            flow_timeout: args
                .flow_timeout_secs
                .or(file.assembler.flow_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(assembler_defaults.flow_timeout),
            sweep_interval: file
                .assembler
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(assembler_defaults.sweep_interval),
            max_flows: file
                .assembler
                .max_flows
                .unwrap_or(assembler_defaults.max_flows),
            max_pending_bytes: file
                .assembler
                .max_pending_bytes
                .unwrap_or(assembler_defaults.max_pending_bytes),
            flow_channel_capacity: file
                .assembler
                .flow_channel_capacity
                .unwrap_or(assembler_defaults.flow_channel_capacity),
        };

        let framing_defaults = FramingLimits::default();
        let framing = FramingLimits {
            max_head_bytes: file
                .http
                .max_head_bytes
                .unwrap_or(framing_defaults.max_head_bytes),
            max_body_bytes: file
                .http
                .max_body_bytes
                .unwrap_or(framing_defaults.max_body_bytes),
        };

        let forwarder_defaults = ForwarderSettings::default();
        let forwarder = ForwarderSettings {
            timeout: args
                .forward_timeout_secs
                .or(file.forwarder.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(forwarder_defaults.timeout),
            max_in_flight: args
                .max_in_flight
                .or(file.forwarder.max_in_flight)
                .unwrap_or(forwarder_defaults.max_in_flight),
        };

        let config = Config {
            source_ip,
            source_port,
            destination,
            capture,
            assembler,
            framing,
            forwarder,
        };
        config.check_ranges()?;
        Ok(config)
    }

    fn check_ranges(&self) -> Result<(), ConfigError> {
        if self.capture.interface.trim().is_empty() && self.capture.pcap_file.is_none() {
            return Err(ConfigError::MissingValue("CAPTURE_INTERFACE"));
        }
        if self.capture.snaplen <= 0 {
            return Err(ConfigError::NotInRange("snaplen must be positive".to_string()));
        }
        if self.capture.read_timeout_ms <= 0 {
            return Err(ConfigError::NotInRange(
                "read_timeout_ms must be positive".to_string(),
            ));
        }
        let non_zero = [
            ("capture.channel_capacity", self.capture.channel_capacity),
            ("assembler.max_flows", self.assembler.max_flows),
            ("assembler.flow_channel_capacity", self.assembler.flow_channel_capacity),
            ("http.max_head_bytes", self.framing.max_head_bytes),
            ("forwarder.max_in_flight", self.forwarder.max_in_flight),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::NotInRange(format!("{} must be at least 1", name)));
            }
        }
        if self.assembler.flow_timeout.is_zero() || self.assembler.sweep_interval.is_zero() {
            return Err(ConfigError::NotInRange(
                "flow timeout and sweep interval must be at least one second".to_string(),
            ));
        }
        if self.forwarder.timeout.is_zero() {
            return Err(ConfigError::NotInRange(
                "forward timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_ip(name: &str, raw: &str) -> Result<IpAddr, ConfigError> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|e| ConfigError::BadIPFormatting(format!("{}={:?}: {}", name, raw, e)))
}

fn parse_port(name: &str, raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(0) => Err(ConfigError::BadPort(format!("{} must not be 0", name))),
        Ok(port) => Ok(port),
        Err(e) => Err(ConfigError::BadPort(format!("{}={:?}: {}", name, raw, e))),
    }
}

fn resolve_port(
    name: &'static str,
    from_args: &Option<String>,
    from_file: Option<u16>,
) -> Result<u16, ConfigError> {
    match (from_args, from_file) {
        (Some(raw), _) => parse_port(name, raw),
        (None, Some(0)) => Err(ConfigError::BadPort(format!("{} must not be 0", name))),
        (None, Some(port)) => Ok(port),
        (None, None) => Err(ConfigError::MissingValue(name)),
    }
}

fn validate_destination(host: &str, port: u16) -> Result<MirrorTarget, ConfigError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConfigError::MissingValue("DESTINATION_IP"));
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return Err(ConfigError::InvalidDestination(format!(
            "{:?} is not a host",
            host
        )));
    }

    let target = MirrorTarget {
        host: host.to_string(),
        port,
    };
    let probe = format!("http://{}/", target.authority());
    match probe.parse::<http::Uri>() {
        Ok(uri) if uri.host().is_some() => Ok(target),
        Ok(_) => Err(ConfigError::InvalidDestination(probe)),
        Err(e) => Err(ConfigError::InvalidDestination(format!("{}: {}", probe, e))),
    }
}
