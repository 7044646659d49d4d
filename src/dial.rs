use std::future::Future;

use dynosaur::dynosaur;
use n0_error::e;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_socks::tcp::Socks5Stream;
use tracing::trace;

use crate::{
    circuit::CircuitIdentity, descriptor::ConnectionDescriptor, error::DialError,
};

/// A bidirectional byte stream to an outbound endpoint.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Type-erased outbound stream.
pub type BoxedTransport = Box<dyn Transport>;

#[dynosaur(pub(crate) DynDialer = dyn(box) Dialer)]
/// Opens outbound connections described by a [`ConnectionDescriptor`].
///
/// [`TorDialer`] is the production implementation. The agent applies the
/// connect timeout around every call, so implementations need not.
pub trait Dialer: Send + Sync {
    /// Connects to `target.host:target.port`, honoring its circuit selection.
    fn dial<'a>(
        &'a self,
        target: &'a ConnectionDescriptor,
    ) -> impl Future<Output = Result<BoxedTransport, DialError>> + Send + 'a;
}

/// Dials through the Tor SOCKS5 listener named in each descriptor.
///
/// Hostnames are resolved by Tor, never locally. Descriptors carrying
/// credentials authenticate with them; a descriptor asking for a new circuit
/// authenticates with credentials generated for that single connection.
#[derive(Debug, Clone, Default)]
pub struct TorDialer;

impl Dialer for TorDialer {
    async fn dial<'a>(
        &'a self,
        target: &'a ConnectionDescriptor,
    ) -> Result<BoxedTransport, DialError> {
        let proxy = (target.socks.hostname.as_str(), target.socks.port);
        let destination = (socks_host(&target.host), target.port);
        let one_shot;
        let credentials = if target.new_circuit {
            one_shot = CircuitIdentity::generate();
            Some(&one_shot)
        } else {
            target.credentials.as_deref()
        };
        trace!(socks=%target.socks, authenticated=credentials.is_some(), "socks5 connect");
        let stream = match credentials {
            Some(identity) => {
                Socks5Stream::connect_with_password(
                    proxy,
                    destination,
                    identity.username(),
                    identity.password(),
                )
                .await
            }
            None => Socks5Stream::connect(proxy, destination).await,
        }
        .map_err(|source| e!(DialError::Socks { source }))?;
        Ok(Box::new(stream.into_inner()))
    }
}

/// Strips the brackets from IPv6 literals so SOCKS sees a bare address.
pub(crate) fn socks_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
