use std::{io, sync::Arc};

use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::trace;

use crate::dial::{BoxedTransport, socks_host};

/// Wraps dialed Tor transports in TLS for `https` targets.
#[derive(Clone)]
pub struct TlsWrapper {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsWrapper").finish_non_exhaustive()
    }
}

impl TlsWrapper {
    /// Verifies servers against the Mozilla root store shipped in `webpki-roots`.
    pub fn with_webpki_roots() -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_root_certificates(roots)
                .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    /// Runs the client handshake for `host` over an already dialed transport.
    pub async fn wrap(
        &self,
        host: &str,
        transport: BoxedTransport,
    ) -> io::Result<TlsStream<BoxedTransport>> {
        let server_name = ServerName::try_from(socks_host(host).to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        trace!(%host, "tls handshake");
        self.connector.connect(server_name, transport).await
    }
}
