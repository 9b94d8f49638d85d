//! Common data types used by the HTTP framing subsystem.

use crate::error_handling::types::FramingError;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use std::net::IpAddr;
use uuid::Uuid;

/// One complete request recovered from a flow, with the flow context it was seen on.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// The request-target exactly as the client sent it (origin or absolute form).
    pub uri: Uri,
    pub version: Version,
    /// Every header in arrival order, repeated names kept as separate values.
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client address of the flow.
    pub source: IpAddr,
    /// Server port the client connected to.
    pub destination_port: u16,
    pub flow_id: Uuid,
}

/// How a flow's reader ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderOutcome {
    /// Stream closed on a request boundary.
    Closed,
    /// Stream closed or broke (capture gap) with an incomplete request buffered.
    Truncated { discarded: usize },
    /// Bytes that are not HTTP/1.x; the rest of the flow is ignored.
    Malformed(FramingError),
}
