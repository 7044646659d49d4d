//! Inbound HTTP/1 connection handling.
//!
//! A [`ProxyChannel`] serves one client connection. It starts in
//! [`ChannelMode::Http`], where each request is forwarded through the
//! [`OutboundAgent`] and responses are written back in request order. A
//! `CONNECT` request switches the connection to [`ChannelMode::Tunnel`] for the
//! rest of its life: the request parser stops reading, and once the tunnel
//! endpoint is dialed the raw bytes are handed to a [`TunnelRelay`].

use std::sync::Arc;

use http::{HeaderValue, Method, StatusCode, Uri, Version, header::CONNECTION};
use n0_error::e;
use n0_future::task::AbortOnDropHandle;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{Instrument, Span, debug, debug_span, warn};

use crate::{
    agent::{OutboundAgent, Response},
    dial::BoxedTransport,
    error::{AgentError, ChannelError},
    parse::{Authority, HeaderFields, RequestHead, RequestTarget, ResponseHead},
    relay::{BodyFraming, BodyRelay, FramedSink, upstream_delimits_body},
    tunnel::TunnelRelay,
    util::Prebuffered,
};

/// Reply written to the client once a `CONNECT` tunnel is established.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Limits for an inbound connection.
#[derive(Debug, Clone)]
pub struct ChannelOpts {
    /// Requests dispatched ahead of the response currently being written.
    pub max_pipelined: usize,
    /// Largest request body that is buffered and forwarded.
    pub max_request_body: usize,
    /// Largest accepted request head.
    pub header_section_max_length: usize,
}

impl Default for ChannelOpts {
    fn default() -> Self {
        Self {
            max_pipelined: 16,
            max_request_body: 8 * 1024 * 1024,
            header_section_max_length: 8 * 1024,
        }
    }
}

/// Protocol spoken on a client connection. The switch to `Tunnel` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ChannelMode {
    #[display("http")]
    Http,
    #[display("tunnel")]
    Tunnel,
}

/// Work queued for the response writer, in request order.
enum Pending<R> {
    Exchange(Exchange),
    /// The request could not be read; answer with `status` and close.
    Reject { status: StatusCode },
    Tunnel {
        authority: Authority,
        dial: AbortOnDropHandle<Result<BoxedTransport, AgentError>>,
        /// The client read side, with any bytes already sent past the CONNECT head.
        reader: Prebuffered<R>,
    },
}

struct Exchange {
    seq: u64,
    method: Method,
    uri: Uri,
    client_version: Version,
    keep_alive: bool,
    response: AbortOnDropHandle<Result<Response, AgentError>>,
}

/// Handler for one inbound client connection.
#[derive(Debug)]
pub struct ProxyChannel {
    agent: Arc<OutboundAgent>,
    opts: ChannelOpts,
    shutdown: CancellationToken,
}

impl ProxyChannel {
    pub fn new(agent: Arc<OutboundAgent>, opts: ChannelOpts) -> Self {
        Self {
            agent,
            opts,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops reading new requests once `token` is cancelled.
    ///
    /// Requests already read are still answered before the connection closes.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Serves a TCP client connection until it closes.
    pub async fn serve(self, stream: TcpStream) -> Result<ChannelMode, ChannelError> {
        let (read, write) = stream.into_split();
        self.run(read, write).await
    }

    /// Serves a client connection given as separate read and write halves.
    ///
    /// Returns the mode the connection was in when it closed.
    pub async fn run<R, W>(self, reader: R, mut writer: W) -> Result<ChannelMode, ChannelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin,
    {
        let (tx, mut rx) = mpsc::channel(self.opts.max_pipelined.max(1));
        let reader = Prebuffered::new(reader, self.opts.header_section_max_length);
        let _read_task = AbortOnDropHandle::new(tokio::spawn(
            read_requests(
                self.agent.clone(),
                self.opts.clone(),
                self.shutdown.clone(),
                reader,
                tx,
            )
            .instrument(Span::current()),
        ));

        while let Some(pending) = rx.recv().await {
            match pending {
                Pending::Exchange(exchange) => {
                    let seq = exchange.seq;
                    let keep_alive = self
                        .respond(exchange, &mut writer)
                        .instrument(debug_span!("req", seq))
                        .await?;
                    if !keep_alive {
                        break;
                    }
                }
                Pending::Reject { status } => {
                    let mut head = ResponseHead::empty(status);
                    set_connection_close(&mut head.headers);
                    head.write(&mut writer)
                        .await
                        .map_err(|source| e!(ChannelError::Io { source }))?;
                    break;
                }
                Pending::Tunnel {
                    authority,
                    dial,
                    mut reader,
                } => {
                    drop(rx);
                    return self.tunnel(authority, dial, &mut reader, &mut writer).await;
                }
            }
        }
        writer.shutdown().await.ok();
        Ok(ChannelMode::Http)
    }

    /// Writes the response for one exchange. Returns whether the connection stays open.
    async fn respond(
        &self,
        exchange: Exchange,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<bool, ChannelError> {
        let Exchange {
            method,
            uri,
            client_version,
            keep_alive,
            response,
            ..
        } = exchange;
        let result = match response.await {
            Ok(result) => result,
            Err(err) => {
                warn!(%method, %uri, "request task failed: {err:#}");
                write_error(writer, StatusCode::BAD_GATEWAY, false).await?;
                return Ok(false);
            }
        };
        let Response {
            status,
            reason,
            mut headers,
            mut body,
            ..
        } = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(%method, %uri, "request failed: {err:#}");
                write_error(writer, err.response_status(), keep_alive).await?;
                return Ok(keep_alive);
            }
        };

        let delimited = upstream_delimits_body(&headers);
        let framing = BodyFraming::for_response(&method, status, &mut headers, client_version);
        let keep_alive = keep_alive && !framing.closes_connection();
        if !keep_alive {
            set_connection_close(&mut headers);
        }
        debug!(%method, %uri, %status, ?framing, "relaying response");
        ResponseHead {
            status,
            reason,
            headers,
        }
        .write(writer)
        .await
        .map_err(|source| e!(ChannelError::Io { source }))?;

        let mut sink = FramedSink::new(writer, framing);
        let relay = BodyRelay::new(delimited || framing == BodyFraming::NoBody);
        match relay.run(&mut body, &mut sink).await {
            Ok(outcome) => {
                debug!(?outcome, "response complete");
                Ok(keep_alive)
            }
            Err(err) => {
                warn!(%method, %uri, "response body relay failed: {err:#}");
                Ok(false)
            }
        }
    }

    /// Waits for the tunnel dial and relays bytes once it succeeds.
    ///
    /// The connection only counts as a tunnel after the dial succeeded. On
    /// failure it is closed without a reply.
    async fn tunnel<R, W>(
        &self,
        authority: Authority,
        dial: AbortOnDropHandle<Result<BoxedTransport, AgentError>>,
        reader: &mut Prebuffered<R>,
        writer: &mut W,
    ) -> Result<ChannelMode, ChannelError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let peer = match dial.await {
            Ok(Ok(peer)) => peer,
            Ok(Err(err)) => {
                warn!(%authority, "tunnel dial failed, closing client connection: {err:#}");
                writer.shutdown().await.ok();
                return Ok(ChannelMode::Http);
            }
            Err(err) => {
                warn!(%authority, "tunnel dial task failed: {err:#}");
                writer.shutdown().await.ok();
                return Ok(ChannelMode::Http);
            }
        };
        writer
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(|source| e!(ChannelError::Io { source }))?;
        writer
            .flush()
            .await
            .map_err(|source| e!(ChannelError::Io { source }))?;
        debug!(%authority, "tunnel established");
        TunnelRelay::default().run(reader, writer, peer).await;
        Ok(ChannelMode::Tunnel)
    }
}

fn set_connection_close(headers: &mut HeaderFields) {
    headers.remove(CONNECTION.as_str());
    headers.append(CONNECTION.as_str(), HeaderValue::from_static("close"));
}

async fn write_error(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
    keep_alive: bool,
) -> Result<(), ChannelError> {
    let mut head = ResponseHead::empty(status);
    if !keep_alive {
        set_connection_close(&mut head.headers);
    }
    head.write(writer)
        .await
        .map_err(|source| e!(ChannelError::Io { source }))?;
    writer
        .flush()
        .await
        .map_err(|source| e!(ChannelError::Io { source }))
}

/// Parses requests and dispatches them in arrival order.
///
/// Stops after a request that ends the connection, and hands the reader over
/// to the writer on `CONNECT` so no further bytes are parsed as HTTP.
async fn read_requests<R: AsyncRead + Send + Unpin + 'static>(
    agent: Arc<OutboundAgent>,
    opts: ChannelOpts,
    shutdown: CancellationToken,
    mut reader: Prebuffered<R>,
    tx: mpsc::Sender<Pending<R>>,
) {
    let mut seq = 0u64;
    loop {
        let Some(next) = RequestHead::read(&mut reader)
            .with_cancellation_token(&shutdown)
            .await
        else {
            debug!("shutting down, not reading further requests");
            return;
        };
        let head = match next {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!("client closed connection");
                return;
            }
            Err(err) => {
                reject(&tx, err).await;
                return;
            }
        };
        match head.target.clone() {
            RequestTarget::Tunnel(authority) => {
                debug!(%authority, "CONNECT request, switching to tunnel mode");
                let descriptor = agent.tunnel_descriptor(&authority);
                let agent = agent.clone();
                let dial = AbortOnDropHandle::new(tokio::spawn(
                    async move { agent.connect(&descriptor).await }.instrument(Span::current()),
                ));
                tx.send(Pending::Tunnel {
                    authority,
                    dial,
                    reader,
                })
                .await
                .ok();
                return;
            }
            RequestTarget::Absolute(uri) => {
                let body = match head.read_body(&mut reader, opts.max_request_body).await {
                    Ok(body) => body,
                    Err(err) => {
                        reject(&tx, err).await;
                        return;
                    }
                };
                let keep_alive = head.keep_alive();
                let RequestHead {
                    method,
                    version,
                    headers,
                    ..
                } = head;
                debug!(seq, %method, %uri, "dispatching request");
                let response = {
                    let agent = agent.clone();
                    let method = method.clone();
                    let uri = uri.clone();
                    AbortOnDropHandle::new(tokio::spawn(
                        async move { agent.request(method, &uri, headers, body).await }
                            .instrument(debug_span!("req", seq)),
                    ))
                };
                let exchange = Exchange {
                    seq,
                    method,
                    uri,
                    client_version: version,
                    keep_alive,
                    response,
                };
                if tx.send(Pending::Exchange(exchange)).await.is_err() || !keep_alive {
                    return;
                }
                seq += 1;
            }
        }
    }
}

async fn reject<R>(tx: &mpsc::Sender<Pending<R>>, err: ChannelError) {
    match err.should_reply() {
        Some(status) => {
            warn!("rejecting request: {err:#}");
            tx.send(Pending::Reject { status }).await.ok();
        }
        None => debug!("client connection failed: {err:#}"),
    }
}
