use std::{str::FromStr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, Version,
    header::{CONTENT_LENGTH, HOST},
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, client::conn::http1::SendRequest};
use hyper_util::rt::TokioIo;
use n0_error::{StdResultExt, e};
use tracing::{Instrument, debug};

use crate::{
    circuit::{CircuitPolicy, IsolationMode},
    descriptor::{ConnectionDescriptor, PoolKey, Scheme, SocksEndpoint},
    dial::{BoxedTransport, Dialer, DynDialer},
    error::{AgentError, DialError},
    parse::{Authority, HeaderFields, filter_hop_by_hop_headers},
    pool::ConnectionPool,
    tls::TlsWrapper,
    util::{HeadCapture, HeadTap},
};

/// Body type of outbound requests: the inbound body, captured once.
pub type RequestBody = Full<Bytes>;

/// Options for an [`OutboundAgent`].
#[derive(Debug, Clone)]
pub struct AgentOpts {
    /// Maximum time for the SOCKS dial to complete.
    pub connect_timeout: Duration,
    /// How long an idle pooled upstream connection stays reusable.
    pub idle_timeout: Duration,
    /// Idle connections kept per pool key. `0` disables pooling.
    pub max_idle_per_key: usize,
    /// Ask Tor for a new circuit for every connection this agent opens.
    pub new_circuit: bool,
    /// Tor SOCKS listener to dial through.
    pub socks: SocksEndpoint,
}

impl Default for AgentOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            max_idle_per_key: 8,
            new_circuit: false,
            socks: SocksEndpoint::default(),
        }
    }
}

/// Builds [`OutboundAgent`]s sharing one dialer and configuration.
///
/// Every [`build`](Self::build) call starts a new circuit policy, so agents
/// built in [`IsolationMode::CircuitPerAgent`] never share credentials.
#[derive(derive_more::Debug, Clone)]
pub struct AgentBuilder {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
    mode: IsolationMode,
    opts: AgentOpts,
    tls: Option<TlsWrapper>,
}

impl AgentBuilder {
    pub fn new(dialer: impl Dialer + 'static) -> Self {
        Self {
            dialer: DynDialer::new_arc(dialer),
            mode: IsolationMode::default(),
            opts: AgentOpts::default(),
            tls: None,
        }
    }

    pub fn isolation(mut self, mode: IsolationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the isolation mode from its textual name (`monoCircuit`, `circuitPerAgent`).
    pub fn isolation_mode(self, mode: &str) -> Result<Self, AgentError> {
        Ok(self.isolation(IsolationMode::from_str(mode)?))
    }

    pub fn opts(mut self, opts: AgentOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Enables `https` targets.
    pub fn tls(mut self, tls: TlsWrapper) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(&self) -> OutboundAgent {
        OutboundAgent {
            dialer: self.dialer.clone(),
            policy: CircuitPolicy::new(self.mode),
            pool: Arc::new(ConnectionPool::new(
                self.opts.idle_timeout,
                self.opts.max_idle_per_key,
            )),
            opts: self.opts.clone(),
            tls: self.tls.clone(),
        }
    }
}

/// HTTP client whose connections are routed through Tor.
///
/// `http` targets are always supported, `https` only when TLS was enabled on
/// the builder. Nothing is retried: every failure is returned to the caller.
#[derive(derive_more::Debug)]
pub struct OutboundAgent {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
    policy: CircuitPolicy,
    opts: AgentOpts,
    tls: Option<TlsWrapper>,
    pool: Arc<ConnectionPool>,
}

impl OutboundAgent {
    /// Creates an agent with the given isolation mode and options, without TLS.
    pub fn new(dialer: impl Dialer + 'static, mode: IsolationMode, opts: AgentOpts) -> Self {
        AgentBuilder::new(dialer).isolation(mode).opts(opts).build()
    }

    /// Creates an agent from a textual isolation mode.
    ///
    /// Fails with [`AgentError::UnsupportedIsolationMode`] for unknown modes.
    pub fn with_isolation_mode(
        dialer: impl Dialer + 'static,
        mode: &str,
        opts: AgentOpts,
    ) -> Result<Self, AgentError> {
        Ok(AgentBuilder::new(dialer)
            .isolation_mode(mode)?
            .opts(opts)
            .build())
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    pub fn opts(&self) -> &AgentOpts {
        &self.opts
    }

    /// Builds the dial descriptor for an endpoint under this agent's circuit policy.
    pub fn descriptor(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
        new_circuit: bool,
    ) -> ConnectionDescriptor {
        ConnectionDescriptor {
            scheme,
            host: host.to_string(),
            port,
            socks: self.opts.socks.clone(),
            credentials: self.policy.identity().cloned(),
            new_circuit,
        }
    }

    /// Descriptor for a raw CONNECT tunnel to `authority`.
    ///
    /// Tunnels are dialed as plain transports; whatever the client speaks
    /// inside them is opaque to us.
    pub fn tunnel_descriptor(&self, authority: &Authority) -> ConnectionDescriptor {
        self.descriptor(
            Scheme::Http,
            &authority.host,
            authority.port,
            self.opts.new_circuit,
        )
    }

    /// Issues a request using the agent's default for new circuits.
    pub async fn request(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response, AgentError> {
        self.request_with_circuit(method, uri, headers, body, self.opts.new_circuit)
            .await
    }

    /// Issues a request, optionally on a new circuit used for this connection only.
    ///
    /// Returns once the response head is parsed; the body stays open in
    /// [`Response::body`] for the caller to drain.
    pub async fn request_with_circuit(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Option<Bytes>,
        new_circuit: bool,
    ) -> Result<Response, AgentError> {
        let scheme = uri.scheme_str().unwrap_or_default();
        let scheme = match Scheme::from_uri_scheme(scheme) {
            Some(Scheme::Https) if self.tls.is_none() => None,
            scheme => scheme,
        }
        .ok_or_else(|| {
            e!(AgentError::UnsupportedScheme {
                scheme: scheme.to_string()
            })
        })?;
        let authority = Authority::from_absolute_uri(uri)
            .map_err(|source| e!(AgentError::InvalidTarget { source }))?;
        let descriptor = self.descriptor(scheme, &authority.host, authority.port, new_circuit);
        let request = build_request(method.clone(), uri, &authority, headers, body)?;

        let key = descriptor.pool_key().filter(|_| self.pool.is_enabled());
        let mut pooled = None;
        if let Some(key) = &key {
            while let Some(mut conn) = self.pool.checkout(key) {
                if conn.sender.ready().await.is_ok() {
                    pooled = Some(conn);
                    break;
                }
            }
        }
        let mut conn = match pooled {
            Some(conn) => {
                debug!(%descriptor, "reusing pooled connection");
                conn
            }
            None => self.open(&descriptor).await?,
        };

        debug!(%method, %uri, "sending request upstream");
        conn.capture.arm();
        let response = conn.sender.send_request(request).await.map_err(|source| {
            if source.is_parse() {
                e!(AgentError::MalformedUpstreamResponse { source })
            } else {
                e!(AgentError::Upstream { source })
            }
        })?;
        let raw_head = conn.capture.take();
        let checkin = key.map(|key| Checkin {
            pool: self.pool.clone(),
            key,
            conn,
        });
        Ok(Response::from_hyper(response, raw_head, checkin))
    }

    /// Dials `descriptor` within the connect timeout.
    pub async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<BoxedTransport, AgentError> {
        match descriptor.scheme {
            Scheme::Http => debug!("tor connect {descriptor}"),
            Scheme::Https => debug!("tor connect with tls {descriptor}"),
        }
        let timeout = self.opts.connect_timeout;
        let res = tokio::time::timeout(timeout, self.dialer.dial(descriptor))
            .await
            .unwrap_or_else(|_elapsed| Err(e!(DialError::Timeout { timeout })));
        res.map_err(|source| {
            e!(AgentError::Connect {
                descriptor: descriptor.to_string(),
                source
            })
        })
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<UpstreamConn, AgentError> {
        let transport = self.connect(descriptor).await?;
        let transport: BoxedTransport = match (descriptor.scheme, &self.tls) {
            (Scheme::Https, Some(tls)) => {
                let stream = tls.wrap(&descriptor.host, transport).await.map_err(|source| {
                    e!(AgentError::Tls {
                        host: descriptor.host.clone(),
                        source
                    })
                })?;
                Box::new(stream)
            }
            _ => transport,
        };
        let capture = HeadCapture::default();
        let transport = HeadTap::new(transport, capture.clone());
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(transport))
            .await
            .map_err(|source| e!(AgentError::Upstream { source }))?;
        tokio::spawn(
            async move {
                if let Err(err) = conn.await {
                    debug!("upstream connection closed: {err:#}");
                }
            }
            .instrument(tracing::Span::current()),
        );
        Ok(UpstreamConn { sender, capture })
    }
}

fn build_request(
    method: Method,
    uri: &Uri,
    authority: &Authority,
    mut headers: HeaderMap,
    body: Option<Bytes>,
) -> Result<Request<RequestBody>, AgentError> {
    filter_hop_by_hop_headers(&mut headers);
    if !headers.contains_key(HOST) {
        let host = match uri.port_u16() {
            Some(_) => authority.to_string(),
            None => authority.host.clone(),
        };
        let value = HeaderValue::from_str(&host)
            .std_context("invalid host")
            .map_err(|source| e!(AgentError::InvalidTarget { source }))?;
        headers.insert(HOST, value);
    }
    match &body {
        Some(body) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        None => {
            headers.remove(CONTENT_LENGTH);
        }
    }
    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    let origin_form = if origin_form.starts_with('/') {
        Uri::from_str(origin_form)
    } else {
        Uri::from_str(&format!("/{origin_form}"))
    }
    .std_context("invalid request path")
    .map_err(|source| e!(AgentError::InvalidTarget { source }))?;

    let mut request = Request::new(Full::new(body.unwrap_or_default()));
    *request.method_mut() = method;
    *request.uri_mut() = origin_form;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}

/// An open upstream HTTP/1 connection.
#[derive(Debug)]
pub(crate) struct UpstreamConn {
    pub(crate) sender: SendRequest<RequestBody>,
    /// Raw copy of each response head read on this connection.
    pub(crate) capture: HeadCapture,
}

/// Returns a connection to the pool once its response body was fully read.
struct Checkin {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    conn: UpstreamConn,
}

/// Response head from upstream plus its still-open body stream.
#[derive(derive_more::Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase as sent, when it differs from the canonical one.
    pub reason: Option<String>,
    pub version: Version,
    /// Header fields in the order and spelling the upstream sent them.
    pub headers: HeaderFields,
    #[debug("ResponseBody")]
    pub body: ResponseBody,
}

impl Response {
    fn from_hyper(
        response: hyper::Response<Incoming>,
        raw_head: Option<Bytes>,
        checkin: Option<Checkin>,
    ) -> Self {
        let (parts, body) = response.into_parts();
        let headers = raw_head
            .and_then(|raw| HeaderFields::from_response_head(&raw))
            .unwrap_or_else(|| HeaderFields::from(&parts.headers));
        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned());
        Self {
            status: parts.status,
            reason,
            version: parts.version,
            headers,
            body: ResponseBody {
                inner: body,
                checkin,
            },
        }
    }

    /// The reason phrase as sent, or the canonical one for the status.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }
}

/// Streaming response body.
///
/// Owns the upstream connection until drained; a fully read body releases
/// its connection back to the agent's pool.
pub struct ResponseBody {
    inner: Incoming,
    checkin: Option<Checkin>,
}

impl ResponseBody {
    /// Returns the next data chunk, or `None` once the response is complete.
    ///
    /// Trailers are skipped.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, hyper::Error>> {
        loop {
            match self.inner.frame().await {
                None => {
                    if let Some(checkin) = self.checkin.take() {
                        checkin.pool.checkin(checkin.key, checkin.conn);
                    }
                    return None;
                }
                Some(Err(err)) => {
                    self.checkin = None;
                    return Some(Err(err));
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data()
                        && !data.is_empty()
                    {
                        return Some(Ok(data));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use n0_error::Result;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    /// Dialer that never connects and records what it was asked for.
    #[derive(Default)]
    struct RecordingDialer {
        seen: Arc<Mutex<Vec<ConnectionDescriptor>>>,
    }

    impl Dialer for RecordingDialer {
        async fn dial<'a>(
            &'a self,
            target: &'a ConnectionDescriptor,
        ) -> Result<BoxedTransport, DialError> {
            self.seen.lock().unwrap().push(target.clone());
            Err(e!(DialError::Io {
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused)
            }))
        }
    }

    /// Dialer answering every connection with a canned HTTP response.
    struct CannedDialer(&'static [u8]);

    impl Dialer for CannedDialer {
        async fn dial<'a>(
            &'a self,
            _target: &'a ConnectionDescriptor,
        ) -> Result<BoxedTransport, DialError> {
            let (client, mut server) = duplex(64 * 1024);
            let reply = self.0;
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = server.read(&mut buf).await;
                let _ = server.write_all(reply).await;
            });
            Ok(Box::new(client))
        }
    }

    /// Dialer that never completes.
    struct StallingDialer;

    impl Dialer for StallingDialer {
        async fn dial<'a>(
            &'a self,
            _target: &'a ConnectionDescriptor,
        ) -> Result<BoxedTransport, DialError> {
            std::future::pending().await
        }
    }

    fn recording_agent(
        mode: IsolationMode,
    ) -> (OutboundAgent, Arc<Mutex<Vec<ConnectionDescriptor>>>) {
        let dialer = RecordingDialer::default();
        let seen = dialer.seen.clone();
        (OutboundAgent::new(dialer, mode, AgentOpts::default()), seen)
    }

    async fn try_get(agent: &OutboundAgent, uri: &str) -> Result<Response, AgentError> {
        let uri = Uri::from_str(uri).unwrap();
        agent.request(Method::GET, &uri, HeaderMap::new(), None).await
    }

    #[tokio::test]
    async fn descriptor_matches_uri_authority() {
        let (agent, seen) = recording_agent(IsolationMode::MonoCircuit);
        for (uri, host, port) in [
            ("http://example.com/", "example.com", 80),
            ("http://example.com:8080/x?y=1", "example.com", 8080),
            ("http://10.1.2.3", "10.1.2.3", 80),
        ] {
            let err = try_get(&agent, uri).await.unwrap_err();
            assert!(matches!(err, AgentError::Connect { .. }));
            let desc = seen.lock().unwrap().pop().unwrap();
            assert_eq!(desc.host, host);
            assert_eq!(desc.port, port);
            assert_eq!(desc.scheme, Scheme::Http);
            assert!(desc.credentials.is_none());
            assert!(!desc.new_circuit);
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_does_not_dial() {
        let (agent, seen) = recording_agent(IsolationMode::MonoCircuit);
        for uri in ["ftp://example.com/file", "gopher://example.com/"] {
            let err = try_get(&agent, uri).await.unwrap_err();
            assert!(matches!(err, AgentError::UnsupportedScheme { .. }));
        }
        // https needs a TLS wrapper.
        let err = try_get(&agent, "https://example.com/").await.unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedScheme { .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn https_is_dialed_when_tls_is_enabled() {
        let dialer = RecordingDialer::default();
        let seen = dialer.seen.clone();
        let agent = AgentBuilder::new(dialer)
            .tls(TlsWrapper::with_webpki_roots().unwrap())
            .build();
        let err = try_get(&agent, "https://example.com/").await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { .. }));
        let desc = seen.lock().unwrap().pop().unwrap();
        assert_eq!(desc.scheme, Scheme::Https);
        assert_eq!(desc.port, 443);
    }

    #[tokio::test]
    async fn circuit_per_agent_credentials() {
        let (agent, seen) = recording_agent(IsolationMode::CircuitPerAgent);
        try_get(&agent, "http://a.example/").await.unwrap_err();
        try_get(&agent, "http://b.example/").await.unwrap_err();
        let (other, other_seen) = recording_agent(IsolationMode::CircuitPerAgent);
        try_get(&other, "http://a.example/").await.unwrap_err();

        let seen = seen.lock().unwrap();
        let first = seen[0].credentials.clone().unwrap();
        let second = seen[1].credentials.clone().unwrap();
        assert_eq!(first, second);
        let third = other_seen.lock().unwrap()[0].credentials.clone().unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn new_circuit_flag_is_per_request() {
        let (agent, seen) = recording_agent(IsolationMode::MonoCircuit);
        let uri = Uri::from_static("http://example.com/");
        agent
            .request_with_circuit(Method::GET, &uri, HeaderMap::new(), None, true)
            .await
            .unwrap_err();
        try_get(&agent, "http://example.com/").await.unwrap_err();
        let seen = seen.lock().unwrap();
        assert!(seen[0].new_circuit);
        assert!(seen[0].credentials.is_none());
        assert!(!seen[1].new_circuit);
    }

    #[test]
    fn unknown_isolation_mode_fails_construction() {
        let err = OutboundAgent::with_isolation_mode(
            RecordingDialer::default(),
            "circuitPerRequest",
            AgentOpts::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedIsolationMode { .. }));
    }

    #[tokio::test]
    async fn connect_timeout() {
        let opts = AgentOpts {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let agent = OutboundAgent::new(StallingDialer, IsolationMode::MonoCircuit, opts);
        let err = try_get(&agent, "http://example.com/").await.unwrap_err();
        assert_eq!(err.response_status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn malformed_response_head() {
        let agent = OutboundAgent::new(
            CannedDialer(b"this is not http\r\n\r\n"),
            IsolationMode::MonoCircuit,
            AgentOpts::default(),
        );
        let err = try_get(&agent, "http://example.com/").await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedUpstreamResponse { .. }));
        assert_eq!(err.response_status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn response_head_and_body() -> Result {
        let agent = OutboundAgent::new(
            CannedDialer(
                b"HTTP/1.1 203 Fine By Me\r\n\
                  X-Dup: 1\r\nContent-Length: 5\r\nX-Dup: 2\r\n\r\nhello",
            ),
            IsolationMode::MonoCircuit,
            AgentOpts::default(),
        );
        let mut response = try_get(&agent, "http://example.com/").await?;
        assert_eq!(response.status, StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(response.reason(), "Fine By Me");
        let dups: Vec<_> = response.headers.get_all("x-dup").collect();
        assert_eq!(dups, ["1", "2"]);
        let names: Vec<_> = response.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["X-Dup", "Content-Length", "X-Dup"]);
        let mut body = Vec::new();
        while let Some(chunk) = response.body.chunk().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello");
        Ok(())
    }

    #[test]
    fn request_uses_origin_form_and_host() {
        let uri = Uri::from_static("http://example.com:8080/a/b?c=d");
        let authority = Authority::from_absolute_uri(&uri).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-length", HeaderValue::from_static("99"));
        let req = build_request(Method::GET, &uri, &authority, headers, None).unwrap();
        assert_eq!(req.uri(), "/a/b?c=d");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert!(!req.headers().contains_key("proxy-connection"));
        assert!(!req.headers().contains_key(CONTENT_LENGTH));

        let uri = Uri::from_static("http://example.com");
        let authority = Authority::from_absolute_uri(&uri).unwrap();
        let req = build_request(
            Method::POST,
            &uri,
            &authority,
            HeaderMap::new(),
            Some(Bytes::from_static(b"abc")),
        )
        .unwrap();
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[HOST], "example.com");
        assert_eq!(req.headers()[CONTENT_LENGTH], "3");
    }
}
