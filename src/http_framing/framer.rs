//! # Request Framer
//!
//! Incremental HTTP/1.x request parser over a flow's ordered bytes.
//!
//! ```text
//!            head complete
//!   ┌──────┐ ─────────────▶ ┌────────────────┐  body complete
//!   │ Head │                │ Body / Chunked │ ──────────────┐
//!   └──────┘ ◀───────────── └────────────────┘               │
//!      ▲        emit request                                 │
//!      └─────────────────────────────────────────────────────┘
//! ```
//!
//! Bytes are appended with [`RequestFramer::push`]; [`RequestFramer::next_request`] yields
//! each request as soon as its last byte is buffered. The framer never resynchronises: the
//! first error is final for the flow.

use super::types::HttpRequest;
use crate::configuration::types::FramingLimits;
use crate::error_handling::types::FramingError;
use crate::network::types::FlowKey;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use uuid::Uuid;

const INITIAL_HEADERS: usize = 64;
/// Shortest header line: a one-byte name, the colon and CRLF.
const MIN_HEADER_LINE: usize = 4;
const MAX_CHUNK_LINE: usize = 1024;

struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
}

#[derive(Clone, Copy)]
enum ChunkPhase {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

enum State {
    Head,
    Body {
        head: RequestHead,
        length: usize,
    },
    Chunked {
        head: RequestHead,
        body: BytesMut,
        phase: ChunkPhase,
        trailer_bytes: usize,
    },
}

pub struct RequestFramer {
    buf: BytesMut,
    state: State,
    limits: FramingLimits,
    key: FlowKey,
    flow_id: Uuid,
}

impl RequestFramer {
    pub fn new(key: FlowKey, flow_id: Uuid, limits: FramingLimits) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Head,
            limits,
            key,
            flow_id,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete request at the front of the buffer, `None` if more bytes are needed.
    pub fn next_request(&mut self) -> Result<Option<HttpRequest>, FramingError> {
        loop {
            match std::mem::replace(&mut self.state, State::Head) {
                State::Head => {
                    let Some((head, body)) = self.parse_head()? else {
                        return Ok(None);
                    };
                    match body {
                        BodyKind::Empty => return Ok(Some(self.finish(head, Bytes::new()))),
                        BodyKind::Length(length) => self.state = State::Body { head, length },
                        BodyKind::Chunked => {
                            self.state = State::Chunked {
                                head,
                                body: BytesMut::new(),
                                phase: ChunkPhase::Size,
                                trailer_bytes: 0,
                            }
                        }
                    }
                }
                State::Body { head, length } => {
                    if self.buf.len() < length {
                        self.state = State::Body { head, length };
                        return Ok(None);
                    }
                    let body = self.buf.split_to(length).freeze();
                    return Ok(Some(self.finish(head, body)));
                }
                State::Chunked {
                    mut head,
                    mut body,
                    mut phase,
                    mut trailer_bytes,
                } => {
                    if self.decode_chunks(&mut body, &mut phase, &mut trailer_bytes)? {
                        // Forwarded with the decoded body, so the framing headers change.
                        head.headers.remove(TRANSFER_ENCODING);
                        head.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                        return Ok(Some(self.finish(head, body.freeze())));
                    }
                    self.state = State::Chunked {
                        head,
                        body,
                        phase,
                        trailer_bytes,
                    };
                    return Ok(None);
                }
            }
        }
    }

    fn parse_head(&mut self) -> Result<Option<(RequestHead, BodyKind)>, FramingError> {
        let limit = self.limits.max_head_bytes;
        // Any head with more headers than this is over the byte limit anyway.
        let max_headers = std::cmp::max(limit / MIN_HEADER_LINE, INITIAL_HEADERS);
        let mut capacity = INITIAL_HEADERS;
        let (len, head) = loop {
            let mut headers = vec![httparse::EMPTY_HEADER; capacity];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&self.buf) {
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > limit {
                        return Err(FramingError::HeadTooLarge(limit));
                    }
                    return Ok(None);
                }
                Ok(httparse::Status::Complete(len)) => {
                    if len > limit {
                        return Err(FramingError::HeadTooLarge(limit));
                    }
                    break (len, build_head(&req)?);
                }
                Err(httparse::Error::TooManyHeaders) if capacity < max_headers => {
                    capacity = std::cmp::min(capacity * 2, max_headers);
                }
                Err(httparse::Error::TooManyHeaders) => {
                    return Err(FramingError::HeadTooLarge(limit));
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.buf.advance(len);
        let body = body_kind(&head.headers, self.limits.max_body_bytes)?;
        Ok(Some((head, body)))
    }

    /// Decodes as much chunked body as is buffered. `true` once the terminating chunk and
    /// trailers have been consumed.
    fn decode_chunks(
        &mut self,
        body: &mut BytesMut,
        phase: &mut ChunkPhase,
        trailer_bytes: &mut usize,
    ) -> Result<bool, FramingError> {
        loop {
            match *phase {
                ChunkPhase::Size => {
                    let Some(line) = self.take_line(MAX_CHUNK_LINE)? else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        *phase = ChunkPhase::Trailers;
                        continue;
                    }
                    let total = body.len().saturating_add(size);
                    if total > self.limits.max_body_bytes {
                        return Err(FramingError::BodyTooLarge {
                            declared: total,
                            limit: self.limits.max_body_bytes,
                        });
                    }
                    *phase = ChunkPhase::Data(size);
                }
                ChunkPhase::Data(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(false);
                    }
                    let n = remaining.min(self.buf.len());
                    body.extend_from_slice(&self.buf[..n]);
                    self.buf.advance(n);
                    *phase = if n == remaining {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(remaining - n)
                    };
                }
                ChunkPhase::DataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(false);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(FramingError::InvalidChunk(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    self.buf.advance(2);
                    *phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    let budget = self.limits.max_head_bytes.saturating_sub(*trailer_bytes);
                    let Some(line) = self.take_line(budget)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        return Ok(true);
                    }
                    // Trailers are not forwarded.
                    *trailer_bytes += line.len() + 2;
                }
            }
        }
    }

    /// Removes one CRLF-terminated line from the buffer, without its terminator.
    fn take_line(&mut self, max: usize) -> Result<Option<Bytes>, FramingError> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) if pos > max => Err(FramingError::InvalidChunk(format!(
                "line exceeds {} bytes",
                max
            ))),
            Some(pos) => {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                Ok(Some(line))
            }
            None if self.buf.len() > max => Err(FramingError::InvalidChunk(format!(
                "line exceeds {} bytes",
                max
            ))),
            None => Ok(None),
        }
    }

    fn finish(&self, head: RequestHead, body: Bytes) -> HttpRequest {
        HttpRequest {
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            body,
            source: self.key.src_ip,
            destination_port: self.key.dst_port,
            flow_id: self.flow_id,
        }
    }

    /// Whether an incomplete request is buffered. Stray CRLFs between requests don't count.
    pub fn has_partial(&self) -> bool {
        match self.state {
            State::Head => self.buf.iter().any(|b| !matches!(b, b'\r' | b'\n')),
            _ => true,
        }
    }

    /// Bytes held for the request in progress.
    pub fn buffered_len(&self) -> usize {
        match &self.state {
            State::Chunked { body, .. } => self.buf.len() + body.len(),
            _ => self.buf.len(),
        }
    }

    /// Printable start of the buffered bytes, for logs.
    pub fn preview(&self) -> String {
        let end = std::cmp::min(self.buf.len(), 64);
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }
}

fn build_head(req: &httparse::Request<'_, '_>) -> Result<RequestHead, FramingError> {
    let method = req
        .method
        .ok_or_else(|| FramingError::InvalidHead("missing method".to_string()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| FramingError::InvalidMethod(method.to_string()))?;

    let path = req
        .path
        .ok_or_else(|| FramingError::InvalidHead("missing request target".to_string()))?;
    let uri = parse_target(path)?;

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(FramingError::UnsupportedVersion),
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| FramingError::InvalidHeader(header.name.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| FramingError::InvalidHeader(format!("value of {}", header.name)))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

/// Parses a request target. Bytes `http::Uri` refuses but HTTP servers commonly accept,
/// such as a backtick or `{`, are percent-encoded instead of failing the flow.
fn parse_target(path: &str) -> Result<Uri, FramingError> {
    if let Ok(uri) = path.parse::<Uri>() {
        return Ok(uri);
    }
    let mut escaped = String::with_capacity(path.len() + 8);
    for byte in path.bytes() {
        match byte {
            b'"' | b'<' | b'>' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}' => {
                escaped.push_str(&format!("%{:02X}", byte))
            }
            _ if byte.is_ascii_graphic() => escaped.push(byte as char),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
        .parse::<Uri>()
        .map_err(|e| FramingError::InvalidUri(format!("{}: {}", path, e)))
}

fn body_kind(headers: &HeaderMap, max_body: usize) -> Result<BodyKind, FramingError> {
    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value.to_str().map_err(|_| {
            FramingError::UnsupportedTransferEncoding("non-ASCII value".to_string())
        })?;
        codings.extend(
            value
                .split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty()),
        );
    }
    // Transfer-Encoding takes precedence over Content-Length.
    if !codings.is_empty() {
        if codings.len() == 1 && codings[0] == "chunked" {
            return Ok(BodyKind::Chunked);
        }
        return Err(FramingError::UnsupportedTransferEncoding(codings.join(", ")));
    }

    let mut length: Option<usize> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| FramingError::InvalidContentLength("non-ASCII value".to_string()))?;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FramingError::InvalidContentLength(part.to_string()));
            }
            let parsed: usize = part
                .parse()
                .map_err(|_| FramingError::InvalidContentLength(part.to_string()))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(FramingError::InvalidContentLength(format!(
                        "conflicting values {} and {}",
                        previous, parsed
                    )))
                }
                _ => length = Some(parsed),
            }
        }
    }

    match length {
        None | Some(0) => Ok(BodyKind::Empty),
        Some(n) if n > max_body => Err(FramingError::BodyTooLarge {
            declared: n,
            limit: max_body,
        }),
        Some(n) => Ok(BodyKind::Length(n)),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FramingError::InvalidChunk("non-ASCII chunk size".to_string()))?;
    // Chunk extensions are ignored.
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FramingError::InvalidChunk(format!("bad chunk size {:?}", size)));
    }
    usize::from_str_radix(size, 16)
        .map_err(|_| FramingError::InvalidChunk(format!("bad chunk size {:?}", size)))
}
