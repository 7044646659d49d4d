use std::{io, net::SocketAddr, time::Duration};

use http::StatusCode;
use n0_error::{AnyError, stack_error};

/// Errors from dialing an outbound connection through Tor.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    /// The SOCKS handshake did not complete within the connect timeout.
    #[error("connect timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The SOCKS proxy refused or failed the connection.
    #[error("socks connect failed")]
    Socks {
        #[error(source, std_err)]
        source: tokio_socks::Error,
    },

    /// Plain TCP failure (used by dialers that do not speak SOCKS).
    #[error("tcp connect failed")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Errors from [`OutboundAgent`](crate::OutboundAgent) requests and construction.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum AgentError {
    /// The target URI scheme is neither `http` nor `https`.
    #[error("unsupported scheme: {scheme:?}")]
    UnsupportedScheme { scheme: String },

    /// The agent was constructed with an unknown circuit isolation mode.
    #[error("unsupported circuit isolation mode: {mode:?}")]
    UnsupportedIsolationMode { mode: String },

    /// The target URI has no usable authority.
    #[error("invalid request target")]
    InvalidTarget {
        #[error(source)]
        source: AnyError,
    },

    /// Dialing the endpoint failed.
    #[error("failed to connect to {descriptor}")]
    Connect {
        /// Redacted descriptor of the endpoint we tried to reach.
        descriptor: String,
        #[error(source)]
        source: DialError,
    },

    /// The TLS handshake over the Tor transport failed.
    #[error("tls handshake with {host} failed")]
    Tls {
        host: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The upstream sent a response head that could not be parsed.
    #[error("malformed upstream response")]
    MalformedUpstreamResponse {
        #[error(source, std_err)]
        source: hyper::Error,
    },

    /// The HTTP exchange failed after the connection was established.
    #[error("upstream exchange failed")]
    Upstream {
        #[error(source, std_err)]
        source: hyper::Error,
    },
}

impl AgentError {
    /// Returns the status code to surface to the downstream client.
    pub fn response_status(&self) -> StatusCode {
        match self {
            AgentError::UnsupportedScheme { .. } | AgentError::InvalidTarget { .. } => {
                StatusCode::BAD_REQUEST
            }
            AgentError::Connect {
                source: DialError::Timeout { .. },
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors while copying a response body to the downstream client.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum RelayError {
    /// Reading the upstream body failed.
    #[error("failed to read upstream body")]
    Upstream {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Writing to the downstream client failed.
    #[error("failed to write to client")]
    Downstream {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Errors that end an inbound connection.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("bad request")]
    BadRequest {
        #[error(source)]
        source: AnyError,
    },

    #[error("request header section exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl ChannelError {
    /// Returns the status to answer with, if the client is still owed a response.
    pub fn should_reply(&self) -> Option<StatusCode> {
        match self {
            ChannelError::BadRequest { .. } => Some(StatusCode::BAD_REQUEST),
            ChannelError::HeadersTooLarge { .. } => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            ChannelError::PayloadTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ChannelError::Io { .. } => None,
        }
    }
}

/// Errors from binding and running the inbound listener.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ListenError {
    /// The server endpoint string could not be parsed.
    #[error("invalid server endpoint: {input:?}")]
    InvalidEndpoint { input: String },

    /// Failed to bind the TCP listener.
    #[error("failed to bind tcp socket to {addr}")]
    Bind {
        addr: SocketAddr,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Failed to accept an incoming TCP connection.
    #[error("failed to accept tcp connection")]
    Accept {
        #[error(source, std_err)]
        source: io::Error,
    },
}
