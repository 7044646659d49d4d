use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use n0_error::e;
use tokio::net::TcpListener;
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    agent::{AgentBuilder, OutboundAgent},
    channel::{ChannelOpts, ProxyChannel},
    descriptor::split_escaped,
    error::ListenError,
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Address the proxy listens on.
///
/// Parsed from a server endpoint string:
///
/// - `tcp:8080`
/// - `tcp:8080:interface=127.0.0.1`
/// - `tcp:interface=127.0.0.1:8080`
/// - `127.0.0.1:8080`
///
/// Colons inside values are escaped with a backslash (`interface=\:\:1`).
/// Without an interface the listener binds all IPv4 interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("{addr}")]
pub struct ListenEndpoint {
    pub addr: SocketAddr,
}

impl FromStr for ListenEndpoint {
    type Err = ListenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || e!(ListenError::InvalidEndpoint { input: s.to_string() });
        let Some(rest) = s.strip_prefix("tcp:") else {
            let addr = SocketAddr::from_str(s).map_err(|_| invalid())?;
            return Ok(Self { addr });
        };
        let mut port = None;
        let mut interface = None;
        for part in split_escaped(rest) {
            match part.split_once('=') {
                Some(("interface", value)) if interface.is_none() => {
                    interface = Some(IpAddr::from_str(value).map_err(|_| invalid())?);
                }
                Some(("port", value)) if port.is_none() => {
                    port = Some(value.parse::<u16>().map_err(|_| invalid())?);
                }
                None if port.is_none() => {
                    port = Some(part.parse::<u16>().map_err(|_| invalid())?);
                }
                _ => return Err(invalid()),
            }
        }
        let interface = interface.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = port.ok_or_else(invalid)?;
        Ok(Self {
            addr: SocketAddr::new(interface, port),
        })
    }
}

/// How outbound agents are shared between inbound connections.
#[derive(Debug, Clone)]
pub enum AgentScope {
    /// Every connection uses the same agent and its connection pool.
    Shared(Arc<OutboundAgent>),
    /// Every connection gets a freshly built agent.
    ///
    /// With per-agent circuit isolation, this puts each client connection on its own circuit.
    PerConnection(AgentBuilder),
}

impl AgentScope {
    fn agent_for_connection(&self) -> Arc<OutboundAgent> {
        match self {
            AgentScope::Shared(agent) => agent.clone(),
            AgentScope::PerConnection(builder) => Arc::new(builder.build()),
        }
    }
}

/// Accepts client connections and runs a [`ProxyChannel`] for each.
#[derive(Debug)]
pub struct ProxyListener {
    local_addr: SocketAddr,
    /// Stops accepting connections and reading new requests.
    shutdown: CancellationToken,
    /// Drops connections that are still open.
    abort: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyListener {
    /// Binds `endpoint` and starts accepting connections in the background.
    pub async fn bind(
        endpoint: ListenEndpoint,
        agents: AgentScope,
        opts: ChannelOpts,
    ) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(endpoint.addr)
            .await
            .map_err(|source| e!(ListenError::Bind { addr: endpoint.addr, source }))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| e!(ListenError::Bind { addr: endpoint.addr, source }))?;
        info!(%local_addr, "proxy listening");
        let this = Self {
            local_addr,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        let tokens = ConnectionTokens {
            shutdown: this.shutdown.clone(),
            abort: this.abort.clone(),
        };
        let tasks = this.tasks.clone();
        tokio::spawn(accept_loop(listener, agents, opts, tokens, tasks));
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and lets open connections finish their current exchanges.
    ///
    /// Connections stop reading new requests right away. Whatever is still open
    /// after [`GRACEFUL_SHUTDOWN_TIMEOUT`] is dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} open connections)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => {
                debug!(
                    remaining = self.tasks.len(),
                    "not all connections closed in time, abort"
                );
                self.abort.cancel();
                self.tasks.wait().await;
            }
        }
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.abort.cancel();
    }
}

#[derive(Debug, Clone)]
struct ConnectionTokens {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

async fn accept_loop(
    listener: TcpListener,
    agents: AgentScope,
    opts: ChannelOpts,
    tokens: ConnectionTokens,
    tasks: TaskTracker,
) {
    let mut id = 0u64;
    loop {
        let Some(next) = listener
            .accept()
            .with_cancellation_token(&tokens.shutdown)
            .await
        else {
            debug!("accept loop cancelled");
            return;
        };
        let (stream, peer) = match next {
            Ok(next) => next,
            Err(source) => {
                let err = e!(ListenError::Accept { source });
                warn!("{err:#}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        let channel = ProxyChannel::new(agents.agent_for_connection(), opts.clone())
            .with_shutdown(tokens.shutdown.child_token());
        let abort = tokens.abort.clone();
        tasks.spawn(
            async move {
                debug!("accepted connection");
                let fut = channel.serve(stream);
                match fut.with_cancellation_token(&abort).await {
                    None => debug!("connection aborted at shutdown"),
                    Some(Ok(mode)) => debug!(%mode, "connection closed"),
                    Some(Err(err)) => warn!("connection failed: {err:#}"),
                }
            }
            .instrument(error_span!("conn", id, %peer)),
        );
        id += 1;
    }
}
