use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingValue(&'static str),
    BadIPFormatting(String),
    BadPort(String),
    InvalidDestination(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingValue(name) => write!(f, "Missing required value: {}", name),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::BadPort(e) => write!(f, "Port error: {}", e),
            ConfigError::InvalidDestination(e) => write!(f, "Invalid mirror destination: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

/// Failure to establish the packet capture. Always fatal.
#[derive(Debug)]
pub enum CaptureError {
    OpenFailed(String),
    FilterRejected { filter: String, reason: String },
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::OpenFailed(e) => write!(f, "Capture open failed: {}", e),
            CaptureError::FilterRejected { filter, reason } => {
                write!(f, "Capture filter `{}` rejected: {}", filter, reason)
            }
            CaptureError::ThreadSpawn(e) => write!(f, "Capture thread spawn failed: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A captured frame that cannot be turned into a TCP segment.
///
/// These are counted and dropped by the controller, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameError {
    Malformed,
    UnsupportedLinkType(i32),
    MissingNetworkLayer,
    MissingTransportLayer,
    NotTcp,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed => write!(f, "Frame truncated or malformed"),
            FrameError::UnsupportedLinkType(l) => write!(f, "Unsupported link type {}", l),
            FrameError::MissingNetworkLayer => write!(f, "Frame has no network layer"),
            FrameError::MissingTransportLayer => write!(f, "Frame has no transport layer"),
            FrameError::NotTcp => write!(f, "Transport layer is not TCP"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Bytes on a flow that do not form a valid HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    InvalidHead(String),
    HeadTooLarge(usize),
    UnsupportedVersion,
    InvalidMethod(String),
    InvalidUri(String),
    InvalidHeader(String),
    InvalidContentLength(String),
    UnsupportedTransferEncoding(String),
    BodyTooLarge { declared: usize, limit: usize },
    InvalidChunk(String),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::InvalidHead(e) => write!(f, "Invalid request head: {}", e),
            FramingError::HeadTooLarge(limit) => {
                write!(f, "Request head exceeds {} bytes", limit)
            }
            FramingError::UnsupportedVersion => write!(f, "Unsupported HTTP version"),
            FramingError::InvalidMethod(e) => write!(f, "Invalid method: {}", e),
            FramingError::InvalidUri(e) => write!(f, "Invalid request URI: {}", e),
            FramingError::InvalidHeader(e) => write!(f, "Invalid header: {}", e),
            FramingError::InvalidContentLength(e) => write!(f, "Invalid Content-Length: {}", e),
            FramingError::UnsupportedTransferEncoding(e) => {
                write!(f, "Unsupported Transfer-Encoding: {}", e)
            }
            FramingError::BodyTooLarge { declared, limit } => {
                write!(f, "Body of {} bytes exceeds limit of {}", declared, limit)
            }
            FramingError::InvalidChunk(e) => write!(f, "Invalid chunk: {}", e),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<httparse::Error> for FramingError {
    fn from(err: httparse::Error) -> Self {
        FramingError::InvalidHead(err.to_string())
    }
}

/// Failure to deliver one mirrored request. Logged and dropped.
#[derive(Debug)]
pub enum ForwardError {
    InvalidTarget(String),
    Build(http::Error),
    Timeout(Duration),
    Transport(String),
    Body(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::InvalidTarget(e) => write!(f, "Invalid mirror target: {}", e),
            ForwardError::Build(e) => write!(f, "Request build error: {}", e),
            ForwardError::Timeout(d) => write!(f, "Forward timed out after {:?}", d),
            ForwardError::Transport(e) => write!(f, "Forward transport error: {}", e),
            ForwardError::Body(e) => write!(f, "Response body error: {}", e),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<http::Error> for ForwardError {
    fn from(err: http::Error) -> Self {
        ForwardError::Build(err)
    }
}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ForwardError::Transport(err.to_string())
    }
}

#[derive(Debug)]
pub enum ControllerError {
    CaptureError(CaptureError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::CaptureError(e) => write!(f, "Capture error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<CaptureError> for ControllerError {
    fn from(err: CaptureError) -> Self {
        ControllerError::CaptureError(err)
    }
}
