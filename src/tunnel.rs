use std::time::Instant;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes forwarded by a finished [`TunnelRelay`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub to_peer: u64,
    pub to_client: u64,
}

/// Raw bidirectional forwarder between a client connection and a dialed peer.
///
/// Each direction reads only once its previous write completed, so a slow
/// reader on one side pauses reading on the other. When either direction
/// ends, the other one stops reading but still finishes the write it has in
/// flight. Both write sides are then shut down and the relay returns.
#[derive(Debug, Clone, Copy)]
pub struct TunnelRelay {
    buffer_size: usize,
}

impl Default for TunnelRelay {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TunnelRelay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    pub async fn run(
        self,
        client_read: &mut (impl AsyncRead + Unpin),
        client_write: &mut (impl AsyncWrite + Unpin),
        peer: impl AsyncRead + AsyncWrite + Unpin,
    ) -> TunnelStats {
        let start = Instant::now();
        let (mut peer_read, mut peer_write) = io::split(peer);
        let mut stats = TunnelStats::default();
        let stop = CancellationToken::new();
        let (to_peer, to_client) = {
            let to_peer = pump(
                client_read,
                &mut peer_write,
                &mut stats.to_peer,
                self.buffer_size,
                &stop,
            );
            let to_client = pump(
                &mut peer_read,
                client_write,
                &mut stats.to_client,
                self.buffer_size,
                &stop,
            );
            tokio::join!(to_peer, to_client)
        };
        trace!(?to_peer, ?to_client, elapsed = ?start.elapsed(), "tunnel directions ended");
        peer_write.shutdown().await.ok();
        client_write.shutdown().await.ok();
        debug!(
            to_peer = stats.to_peer,
            to_client = stats.to_client,
            "tunnel closed"
        );
        stats
    }
}

async fn pump(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    count: &mut u64,
    buffer_size: usize,
    stop: &CancellationToken,
) -> io::Result<()> {
    let _stop_other = stop.clone().drop_guard();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *count += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use n0_error::{Result, StdResultExt};
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn forwards_both_directions_and_closes_together() -> Result {
        let (mut client, client_proxy) = duplex(1024);
        let (peer_proxy, mut peer) = duplex(1024);
        let relay = tokio::spawn(async move {
            let (mut read, mut write) = io::split(client_proxy);
            TunnelRelay::default().run(&mut read, &mut write, peer_proxy).await
        });

        client.write_all(b"ping").await.anyerr()?;
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.anyerr()?;
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.anyerr()?;
        drop(peer);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.anyerr()?;
        assert_eq!(rest, b"pong");

        let stats = relay.await.anyerr()?;
        assert_eq!(stats, TunnelStats { to_peer: 4, to_client: 4 });
        Ok(())
    }

    #[tokio::test]
    async fn client_disconnect_closes_peer() -> Result {
        let (client, client_proxy) = duplex(1024);
        let (peer_proxy, mut peer) = duplex(1024);
        let relay = tokio::spawn(async move {
            let (mut read, mut write) = io::split(client_proxy);
            TunnelRelay::default().run(&mut read, &mut write, peer_proxy).await
        });
        drop(client);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.anyerr()?;
        assert!(rest.is_empty());
        relay.await.anyerr()?;
        Ok(())
    }

    #[tokio::test]
    async fn slow_client_pauses_peer_reads() -> Result {
        const TOTAL: usize = 256 * 1024;
        const CHUNK: usize = 1024;
        let (mut client, client_proxy) = duplex(64);
        let (peer_proxy, mut peer) = duplex(64);
        let relay = tokio::spawn(async move {
            let (mut read, mut write) = io::split(client_proxy);
            TunnelRelay::new(4096).run(&mut read, &mut write, peer_proxy).await
        });

        let sent = Arc::new(AtomicUsize::new(0));
        let writer = tokio::spawn({
            let sent = sent.clone();
            async move {
                let chunk = [7u8; CHUNK];
                for _ in 0..TOTAL / CHUNK {
                    peer.write_all(&chunk).await?;
                    sent.fetch_add(CHUNK, Ordering::SeqCst);
                }
                io::Result::Ok(peer)
            }
        });

        // Nobody reads on the client side, so the peer must stall.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stalled_at = sent.load(Ordering::SeqCst);
        assert!(stalled_at < 16 * 1024, "peer wrote {stalled_at} bytes into a stalled tunnel");

        let mut received = vec![0u8; TOTAL];
        client.read_exact(&mut received).await.anyerr()?;
        assert!(received.iter().all(|b| *b == 7));
        let peer = writer.await.anyerr()?.anyerr()?;
        assert_eq!(sent.load(Ordering::SeqCst), TOTAL);

        drop(client);
        drop(peer);
        let stats = relay.await.anyerr()?;
        assert_eq!(stats.to_client, TOTAL as u64);
        Ok(())
    }

    #[tokio::test]
    async fn write_in_flight_completes_after_other_side_ends() -> Result {
        let (mut client, client_proxy) = duplex(64);
        let (peer_proxy, mut peer) = duplex(128 * 1024);
        peer.write_all(&[9u8; 64 * 1024]).await.anyerr()?;
        let relay = tokio::spawn(async move {
            let (mut read, mut write) = io::split(client_proxy);
            TunnelRelay::new(4096).run(&mut read, &mut write, peer_proxy).await
        });

        // Let the peer-to-client direction block on the full client buffer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.shutdown().await.anyerr()?;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.anyerr()?;

        let stats = relay.await.anyerr()?;
        assert!(received.len() > 64, "only {} bytes arrived", received.len());
        assert_eq!(received.len() as u64, stats.to_client);
        assert!(received.iter().all(|b| *b == 9));
        drop(peer);
        Ok(())
    }
}
