//! Read-ahead buffer for inbound client connections.
//!
//! [`Prebuffered`] lets the request parser look at bytes before committing to
//! them. Whatever is still buffered when the connection switches to a tunnel
//! is yielded first by its [`AsyncRead`] impl, so no client byte is lost.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// An `AsyncRead` with an inspectable read-ahead buffer of at most `max_len` bytes.
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn max_len(&self) -> usize {
        self.max_len
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drops `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Reads more from the inner reader, up to the buffer limit.
    ///
    /// Returns `0` at end of stream or when the buffer is full.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let room = self.max_len.saturating_sub(self.buf.len());
        (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await
    }

    /// Splits into the buffered bytes and the inner reader.
    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (bytes::Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        let chunk = self.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn buffering_stops_at_limit() {
        let mut p = Prebuffered::new(Cursor::new(&b"CONNECT a:1 HTTP/1.1"[..]), 7);
        assert_eq!(p.buffer_more().await.unwrap(), 7);
        assert!(p.is_full());
        assert_eq!(p.buffer_more().await.unwrap(), 0);
        assert_eq!(p.buffer(), b"CONNECT");
        p.discard(100);
        assert!(p.buffer().is_empty());
    }

    #[tokio::test]
    async fn reads_drain_buffer_before_inner() {
        let mut p = Prebuffered::new(Cursor::new(&b"head\r\n\r\ntunnel bytes"[..]), 12);
        p.buffer_more().await.unwrap();
        p.discard(8);
        assert_eq!(p.buffer(), b"tunn");
        let mut small = [0u8; 2];
        p.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"tu");
        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"nnel bytes");
    }

    #[tokio::test]
    async fn into_parts_keeps_unread_bytes() {
        let mut p = Prebuffered::new(Cursor::new(&b"abcdef"[..]), 4);
        p.buffer_more().await.unwrap();
        p.discard(1);
        let (buffered, mut inner) = p.into_parts();
        assert_eq!(&buffered[..], b"bcd");
        let mut rest = Vec::new();
        inner.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }
}
