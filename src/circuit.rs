//! Circuit isolation policy.
//!
//! Tor isolates streams by SOCKS credentials: two connections that present
//! different username/password pairs never share a circuit. An agent in
//! [`IsolationMode::CircuitPerAgent`] generates one [`CircuitIdentity`] at
//! construction and attaches it to every descriptor it builds. Independently,
//! a descriptor can ask for a fresh circuit for exactly one connection.

use std::{fmt, str::FromStr, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use n0_error::e;
use rand::{RngCore, rngs::OsRng};

use crate::error::AgentError;

/// Number of random bytes drawn for each half of a [`CircuitIdentity`].
///
/// Encoded with unpadded base64 this yields 171 characters, inside the
/// 255 byte limit SOCKS5 places on usernames and passwords.
pub const CIRCUIT_IDENTITY_ENTROPY: usize = 128;

/// How an agent's outbound connections are spread over Tor circuits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationMode {
    /// Use Tor's default circuit selection; no credentials are sent.
    #[default]
    MonoCircuit,
    /// Send per-agent random credentials so the agent gets a dedicated circuit.
    CircuitPerAgent,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::MonoCircuit => "monoCircuit",
            IsolationMode::CircuitPerAgent => "circuitPerAgent",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monoCircuit" => Ok(IsolationMode::MonoCircuit),
            "circuitPerAgent" => Ok(IsolationMode::CircuitPerAgent),
            other => Err(e!(AgentError::UnsupportedIsolationMode {
                mode: other.to_string()
            })),
        }
    }
}

/// SOCKS username/password pair that pins traffic to one Tor circuit.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CircuitIdentity {
    username: String,
    password: String,
}

impl CircuitIdentity {
    /// Generates a fresh identity from the OS random number generator.
    pub fn generate() -> Self {
        Self {
            username: random_token(),
            password: random_token(),
        }
    }

    pub(crate) fn from_parts(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for CircuitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitIdentity")
            .field("username", &fmt_short(&self.username))
            .field("password", &"***")
            .finish()
    }
}

/// Returns the first characters of a credential, enough to tell identities apart in logs.
pub(crate) fn fmt_short(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

fn random_token() -> String {
    let mut buf = [0u8; CIRCUIT_IDENTITY_ENTROPY];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Per-agent circuit policy, fixed at agent construction.
#[derive(Debug, Clone)]
pub struct CircuitPolicy {
    mode: IsolationMode,
    identity: Option<Arc<CircuitIdentity>>,
}

impl CircuitPolicy {
    pub fn new(mode: IsolationMode) -> Self {
        let identity = match mode {
            IsolationMode::MonoCircuit => None,
            IsolationMode::CircuitPerAgent => Some(Arc::new(CircuitIdentity::generate())),
        };
        Self { mode, identity }
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// The credentials attached to every descriptor, if the mode requires them.
    pub fn identity(&self) -> Option<&Arc<CircuitIdentity>> {
        self.identity.as_ref()
    }
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self::new(IsolationMode::default())
    }
}
