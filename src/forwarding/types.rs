use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use uuid::Uuid;

/// A captured request rewritten for the mirror destination.
#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub method: Method,
    /// `http://<destination-host>:<destination-port><path-and-query>`
    pub url: Uri,
    /// Original headers plus the `X-Forwarded-*` set.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub flow_id: Uuid,
}

/// Forwarder counters since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub sent: u64,
    pub failed: u64,
    /// Requests dropped because every forwarding slot was busy.
    pub dropped: u64,
}
