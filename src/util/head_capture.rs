//! Raw copy of upstream response heads.
//!
//! The HTTP client parses response heads into an [`http::HeaderMap`], which
//! folds field-name case and groups fields by name. [`HeadTap`] sits under the
//! client and keeps the head bytes exactly as they arrived, so the proxy can
//! relay fields in their original order and spelling.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, ready},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Heads larger than this are not recorded.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Handle to the head recorder of one upstream connection.
///
/// Arm it before sending a request; the next final (non-1xx) response head read
/// through the matching [`HeadTap`] is then available from [`take`](Self::take).
#[derive(Debug, Clone, Default)]
pub(crate) struct HeadCapture(Arc<Mutex<CaptureState>>);

#[derive(Debug, Default)]
struct CaptureState {
    armed: bool,
    buf: Vec<u8>,
    head: Option<Bytes>,
}

impl HeadCapture {
    pub(crate) fn arm(&self) {
        if let Ok(mut state) = self.0.lock() {
            state.armed = true;
            state.buf.clear();
            state.head = None;
        }
    }

    /// Takes the recorded head, including its terminating empty line.
    pub(crate) fn take(&self) -> Option<Bytes> {
        self.0.lock().ok()?.head.take()
    }

    fn record(&self, data: &[u8]) {
        let Ok(mut state) = self.0.lock() else {
            return;
        };
        if !state.armed || data.is_empty() {
            return;
        }
        state.buf.extend_from_slice(data);
        while let Some(end) = find_head_end(&state.buf) {
            let head: Vec<u8> = state.buf.drain(..end).collect();
            if is_interim(&head) {
                continue;
            }
            state.head = Some(head.into());
            state.armed = false;
            state.buf.clear();
            return;
        }
        if state.buf.len() > MAX_HEAD_LEN {
            state.armed = false;
            state.buf.clear();
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// 1xx heads other than `101` are followed by the final head on the same exchange.
fn is_interim(head: &[u8]) -> bool {
    let code = head
        .strip_prefix(b"HTTP/1.")
        .and_then(|rest| rest.get(2..5))
        .and_then(|code| std::str::from_utf8(code).ok())
        .and_then(|code| code.parse::<u16>().ok());
    code.is_some_and(|code| (100..200).contains(&code) && code != 101)
}

/// Transport wrapper feeding everything it reads to a [`HeadCapture`].
pub(crate) struct HeadTap<T> {
    inner: T,
    capture: HeadCapture,
}

impl<T> HeadTap<T> {
    pub(crate) fn new(inner: T, capture: HeadCapture) -> Self {
        Self { inner, capture }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for HeadTap<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.capture.record(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for HeadTap<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn records_final_head_only_when_armed() {
        let (client, mut server) = duplex(1024);
        let capture = HeadCapture::default();
        let mut tap = HeadTap::new(client, capture.clone());

        server.write_all(b"HTTP/1.1 200 OK\r\nA: 1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = tap.read(&mut buf).await.unwrap();
        assert!(capture.take().is_none());

        capture.arm();
        server
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nX-B: 1\r\n")
            .await
            .unwrap();
        let _ = tap.read(&mut buf).await.unwrap();
        assert!(capture.take().is_none());
        server.write_all(b"X-A: 2\r\n\r\nbody").await.unwrap();
        let _ = tap.read(&mut buf).await.unwrap();
        assert_eq!(
            capture.take().unwrap(),
            &b"HTTP/1.1 200 OK\r\nX-B: 1\r\nX-A: 2\r\n\r\n"[..]
        );
        assert!(capture.take().is_none());
    }
}
