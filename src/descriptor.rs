//! Outbound dial targets.
//!
//! A [`ConnectionDescriptor`] names an endpoint to reach through Tor along with
//! the circuit selection for that connection. It has a textual form consumed by
//! external Tor-routing collaborators:
//!
//! ```text
//! tor:host=example.com:port=80:socksPort=9050:newCircuit=Yes
//! ```
//!
//! Values containing `:` or `\` are escaped with a backslash.

use std::{fmt, str::FromStr, sync::Arc};

use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr, ensure_any};

use crate::circuit::{CircuitIdentity, fmt_short};

/// Default Tor SOCKS host.
pub const DEFAULT_SOCKS_HOSTNAME: &str = "127.0.0.1";
/// Default Tor SOCKS port.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

const DESCRIPTOR_PREFIX: &str = "tor:";

/// Transport scheme of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Scheme {
    #[display("http")]
    Http,
    #[display("https")]
    Https,
}

impl Scheme {
    /// Maps a URI scheme, returning `None` for anything but `http` and `https`.
    pub fn from_uri_scheme(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else {
            None
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Location of the Tor SOCKS listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{hostname}:{port}")]
pub struct SocksEndpoint {
    pub hostname: String,
    pub port: u16,
}

impl Default for SocksEndpoint {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_SOCKS_HOSTNAME.to_string(),
            port: DEFAULT_SOCKS_PORT,
        }
    }
}

impl SocksEndpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// Where and how to dial one outbound connection.
///
/// Credentials are present if and only if the building agent runs in
/// per-agent circuit isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub socks: SocksEndpoint,
    pub credentials: Option<Arc<CircuitIdentity>>,
    /// Ask Tor for a brand-new circuit for this one connection.
    pub new_circuit: bool,
}

/// Identifies connections that may be reused for one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
    socks: SocksEndpoint,
    identity: Option<Arc<CircuitIdentity>>,
}

impl ConnectionDescriptor {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            socks: SocksEndpoint::default(),
            credentials: None,
            new_circuit: false,
        }
    }

    /// `host:port`, the target handed to the SOCKS proxy.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the pool key, or `None` if connections for this descriptor must not be reused.
    ///
    /// A connection on a one-shot new circuit is never shared.
    pub fn pool_key(&self) -> Option<PoolKey> {
        if self.new_circuit {
            return None;
        }
        Some(PoolKey {
            scheme: self.scheme,
            host: self.host.to_ascii_lowercase(),
            port: self.port,
            socks: self.socks.clone(),
            identity: self.credentials.clone(),
        })
    }

    /// Encodes the full textual descriptor, credentials included.
    pub fn encode(&self) -> String {
        self.render(true)
    }

    fn render(&self, reveal_password: bool) -> String {
        let mut out = String::from(DESCRIPTOR_PREFIX);
        out.push_str("host=");
        out.push_str(&escape(&self.host));
        out.push_str(&format!(":port={}", self.port));
        if self.socks.hostname != DEFAULT_SOCKS_HOSTNAME {
            out.push_str(":socksHostname=");
            out.push_str(&escape(&self.socks.hostname));
        }
        out.push_str(&format!(":socksPort={}", self.socks.port));
        if let Some(identity) = &self.credentials {
            out.push_str(":socksUsername=");
            if reveal_password {
                out.push_str(&escape(identity.username()));
                out.push_str(":socksPassword=");
                out.push_str(&escape(identity.password()));
            } else {
                out.push_str(&fmt_short(identity.username()));
                out.push_str(":socksPassword=***");
            }
        }
        if self.new_circuit {
            out.push_str(":newCircuit=Yes");
        }
        out
    }
}

/// Log-friendly form; credentials are shortened and the password is hidden.
impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

/// Parses the textual form. The scheme is not part of it and defaults to `http`.
impl FromStr for ConnectionDescriptor {
    type Err = AnyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(DESCRIPTOR_PREFIX)
            .context("descriptor must start with \"tor:\"")?;
        let mut host = None;
        let mut port = None;
        let mut socks = SocksEndpoint::default();
        let mut username = None;
        let mut password = None;
        let mut new_circuit = false;
        for field in split_escaped(rest) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| anyerr!("descriptor field without value: {field:?}"))?;
            match key {
                "host" => host = Some(value.to_string()),
                "port" => port = Some(value.parse::<u16>().std_context("invalid port")?),
                "socksHostname" => socks.hostname = value.to_string(),
                "socksPort" => socks.port = value.parse().std_context("invalid socksPort")?,
                "socksUsername" => username = Some(value.to_string()),
                "socksPassword" => password = Some(value.to_string()),
                "newCircuit" => new_circuit = parse_flag(value)?,
                other => return Err(anyerr!("unknown descriptor field {other:?}")),
            }
        }
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Arc::new(CircuitIdentity::from_parts(
                username, password,
            ))),
            (None, None) => None,
            _ => return Err(anyerr!("socksUsername and socksPassword must be given together")),
        };
        let host = host.context("descriptor is missing host")?;
        ensure_any!(!host.is_empty(), "descriptor host is empty");
        Ok(Self {
            scheme: Scheme::Http,
            host,
            port: port.context("descriptor is missing port")?,
            socks,
            credentials,
            new_circuit,
        })
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "Yes" | "yes" | "true" | "1" => Ok(true),
        "No" | "no" | "false" | "0" => Ok(false),
        other => Err(anyerr!("invalid flag value {other:?}")),
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ':' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Splits on unescaped `:` and removes the escapes.
pub(crate) fn split_escaped(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}
