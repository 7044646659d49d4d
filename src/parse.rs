//! Inbound HTTP/1 framing: request heads, request bodies and response heads.

use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    uri::Scheme,
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, e, ensure_any};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::ChannelError, util::Prebuffered};

/// Maximum number of header fields accepted in an inbound request head.
const MAX_HEADERS: usize = 96;

/// Host and port of a request target.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal. IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("invalid authority")?)
    }
}

impl Authority {
    /// Parses a CONNECT target (`host:port`, no scheme, no path).
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "CONNECT target must not have a scheme");
        ensure_any!(
            uri.path_and_query().is_none_or(|pq| pq.as_str().is_empty()),
            "CONNECT target must not have a path"
        );
        let authority = uri.authority().context("CONNECT target without authority")?;
        let port = authority.port_u16().context("CONNECT target without port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Parses an absolute-form target, defaulting the port from the scheme.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("target without authority")?;
        ensure_any!(!authority.host().is_empty(), "target with empty host");
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => return Err(anyerr!("target without port or http(s) scheme")),
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }
}

/// Target of an inbound proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `CONNECT host:port`.
    Tunnel(Authority),
    /// Absolute-form target of a forwarded request.
    Absolute(Uri),
}

/// An inbound request line plus header section.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: RequestTarget,
    pub version: Version,
    /// Header fields as received, duplicates kept in order.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Reads the next request head and removes it from `reader`.
    ///
    /// Returns `None` if the client closed the connection between requests.
    pub async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Option<Self>, ChannelError> {
        loop {
            if let Some((len, head)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(Some(head));
            }
            if reader.is_full() {
                return Err(e!(ChannelError::HeadersTooLarge {
                    limit: reader.max_len()
                }));
            }
            let n = reader
                .buffer_more()
                .await
                .map_err(|source| e!(ChannelError::Io { source }))?;
            if n == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(e!(ChannelError::Io {
                    source: io::ErrorKind::UnexpectedEof.into()
                }));
            }
        }
    }

    /// Parses a head from `buf`, returning `None` while it is incomplete.
    ///
    /// On success also returns the length of the head in bytes.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ChannelError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req
            .parse(buf)
            .std_context("invalid request head")
            .map_err(bad_request)?;
        match status {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let head = Self::from_httparse(req).map_err(bad_request)?;
                Ok(Some((len, head)))
            }
        }
    }

    fn from_httparse(req: httparse::Request) -> Result<Self> {
        let method: Method = req
            .method
            .context("missing method")?
            .parse()
            .std_context("invalid method")?;
        let path = req.path.context("missing request target")?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name =
                HeaderName::from_bytes(header.name.as_bytes()).std_context("invalid header name")?;
            let value = HeaderValue::from_bytes(header.value).std_context("invalid header value")?;
            headers.append(name, value);
        }
        let target = if method == Method::CONNECT {
            RequestTarget::Tunnel(Authority::from_str(path)?)
        } else {
            let uri = Uri::from_str(path).std_context("invalid request target")?;
            ensure_any!(
                uri.scheme().is_some(),
                "expected absolute-form request target, got {path:?}"
            );
            RequestTarget::Absolute(uri)
        };
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Whether the client wants the connection kept open after this exchange.
    pub fn keep_alive(&self) -> bool {
        if has_token(&self.headers, &CONNECTION, "close") {
            false
        } else if self.version == Version::HTTP_10 {
            has_token(&self.headers, &CONNECTION, "keep-alive")
        } else {
            true
        }
    }

    /// Reads the request body framed by this head, bounded by `limit` bytes.
    ///
    /// Returns `None` when the request has no body framing at all.
    pub async fn read_body(
        &self,
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
        limit: usize,
    ) -> Result<Option<Bytes>, ChannelError> {
        match body_length(&self.headers)? {
            BodyLength::Empty => Ok(None),
            BodyLength::Length(len) => {
                if len > limit as u64 {
                    return Err(e!(ChannelError::PayloadTooLarge { limit }));
                }
                let mut body = vec![0u8; len as usize];
                reader
                    .read_exact(&mut body)
                    .await
                    .map_err(|source| e!(ChannelError::Io { source }))?;
                Ok(Some(body.into()))
            }
            BodyLength::Chunked => read_chunked(reader, limit).await.map(Some),
        }
    }
}

enum BodyLength {
    Empty,
    Length(u64),
    Chunked,
}

fn body_length(headers: &HeaderMap) -> Result<BodyLength, ChannelError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        let last = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .last();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyLength::Chunked),
            _ => Err(bad_request(anyerr!("unsupported transfer-encoding"))),
        };
    }
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| bad_request(anyerr!("invalid content-length")))?;
        if length.is_some_and(|len| len != parsed) {
            return Err(bad_request(anyerr!("conflicting content-length values")));
        }
        length = Some(parsed);
    }
    Ok(length.map(BodyLength::Length).unwrap_or(BodyLength::Empty))
}

async fn read_chunked(
    reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    limit: usize,
) -> Result<Bytes, ChannelError> {
    let mut body = BytesMut::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(reader.buffer()) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => fill(reader).await?,
                Err(_) => return Err(bad_request(anyerr!("invalid chunk size line"))),
            }
        };
        reader.discard(consumed);
        if size == 0 {
            skip_trailers(reader).await?;
            return Ok(body.freeze());
        }
        if size > limit.saturating_sub(body.len()) as u64 {
            return Err(e!(ChannelError::PayloadTooLarge { limit }));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|source| e!(ChannelError::Io { source }))?;
        while reader.buffer().len() < 2 {
            fill(reader).await?;
        }
        if &reader.buffer()[..2] != b"\r\n" {
            return Err(bad_request(anyerr!("missing CRLF after chunk data")));
        }
        reader.discard(2);
    }
}

/// Consumes trailer fields up to and including the final empty line.
async fn skip_trailers(
    reader: &mut Prebuffered<impl AsyncRead + Unpin>,
) -> Result<(), ChannelError> {
    loop {
        match reader.buffer().windows(2).position(|w| w == b"\r\n") {
            Some(0) => {
                reader.discard(2);
                return Ok(());
            }
            Some(pos) => reader.discard(pos + 2),
            None => fill(reader).await?,
        }
    }
}

async fn fill(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(), ChannelError> {
    if reader.is_full() {
        return Err(bad_request(anyerr!("chunk framing line too long")));
    }
    match reader.buffer_more().await {
        Ok(0) => Err(e!(ChannelError::Io {
            source: io::ErrorKind::UnexpectedEof.into()
        })),
        Ok(_) => Ok(()),
        Err(source) => Err(e!(ChannelError::Io { source })),
    }
}

fn bad_request(source: n0_error::AnyError) -> ChannelError {
    e!(ChannelError::BadRequest { source })
}

/// Whether the comma-separated header `name` lists `token`.
pub(crate) fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Removes hop-by-hop header fields, including those named in `Connection`.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authorization",
        "proxy-authenticate",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

/// Maximum number of header fields kept from an upstream response head.
const MAX_RESPONSE_HEADERS: usize = 128;

/// Header fields in wire order, names spelled as received.
///
/// Unlike [`HeaderMap`], this keeps interleaved fields in place and does not
/// fold name case, so a head can be relayed byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<(String, HeaderValue)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the fields of a raw response head (status line included).
    ///
    /// Returns `None` unless `raw` is one complete, valid head.
    pub fn from_response_head(raw: &[u8]) -> Option<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(raw).ok()? {
            httparse::Status::Complete(len) if len == raw.len() => {}
            _ => return None,
        }
        let mut fields = Self::new();
        for header in response.headers.iter() {
            fields.append(header.name, HeaderValue::from_bytes(header.value).ok()?);
        }
        Some(fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn append(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.fields.push((name.into(), value));
    }

    /// All values of `name`, compared case-insensitively, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_all(name).next().is_some()
    }

    /// Removes every field called `name`.
    pub fn remove(&mut self, name: &str) {
        self.fields
            .retain(|(field, _)| !field.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Collects into a [`HeaderMap`], skipping names it cannot represent.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                map.append(name, value.clone());
            }
        }
        map
    }
}

impl From<&HeaderMap> for HeaderFields {
    fn from(map: &HeaderMap) -> Self {
        Self {
            fields: map
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                .collect(),
        }
    }
}

/// Response status line plus header section, written to the inbound client.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase; the canonical one is used when `None`.
    pub reason: Option<String>,
    pub headers: HeaderFields,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderFields::new(),
        }
    }

    /// A bodyless response announcing `Content-Length: 0`.
    pub fn empty(status: StatusCode) -> Self {
        let mut head = Self::new(status);
        head.headers
            .append(CONTENT_LENGTH.as_str(), HeaderValue::from_static("0"));
        head
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Serializes the head, including the terminating empty line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.status_line().into_bytes();
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        writer.write_all(&self.encode()).await
    }
}
