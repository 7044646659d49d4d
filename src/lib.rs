//! HTTP proxy that routes client traffic through Tor.
//!
//! Clients speak plain HTTP/1 to a [`ProxyListener`]. Ordinary requests are
//! forwarded by an [`OutboundAgent`] over a Tor SOCKS circuit, and `CONNECT`
//! requests turn the client connection into a raw tunnel to the requested
//! endpoint.
//!
//! Circuit selection is controlled per agent by an [`IsolationMode`] and per
//! connection by the one-shot `new_circuit` flag.

mod agent;
mod channel;
mod circuit;
mod descriptor;
mod dial;
mod error;
mod listener;
mod parse;
mod pool;
mod relay;
mod tls;
mod tunnel;
mod util;

pub use self::{
    agent::{AgentBuilder, AgentOpts, OutboundAgent, RequestBody, Response, ResponseBody},
    channel::{CONNECT_ESTABLISHED, ChannelMode, ChannelOpts, ProxyChannel},
    circuit::{CIRCUIT_IDENTITY_ENTROPY, CircuitIdentity, CircuitPolicy, IsolationMode},
    descriptor::{
        ConnectionDescriptor, DEFAULT_SOCKS_HOSTNAME, DEFAULT_SOCKS_PORT, PoolKey, Scheme,
        SocksEndpoint,
    },
    dial::{BoxedTransport, Dialer, TorDialer, Transport},
    error::{AgentError, ChannelError, DialError, ListenError, RelayError},
    listener::{AgentScope, ListenEndpoint, ProxyListener},
    parse::{
        Authority, HeaderFields, RequestHead, RequestTarget, ResponseHead,
        filter_hop_by_hop_headers,
    },
    relay::{
        BodyFraming, BodyRelay, BodySource, FramedSink, RelayOutcome, ResponseSink, Termination,
    },
    tls::TlsWrapper,
    tunnel::{TunnelRelay, TunnelStats},
};
