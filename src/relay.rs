//! Copies upstream response bodies to the inbound client.

use std::future::Future;

use bytes::Bytes;
use http::{
    Method, StatusCode, Version,
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
};
use n0_error::e;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::{agent::ResponseBody, error::RelayError, parse::HeaderFields};

/// A stream of response body chunks.
pub trait BodySource: Send {
    /// Next chunk, or `None` once the stream ended.
    fn next_chunk(&mut self) -> impl Future<Output = Option<io::Result<Bytes>>> + Send;
}

impl BodySource for ResponseBody {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.chunk().await.map(|res| res.map_err(io::Error::other))
    }
}

/// How a relayed body stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The upstream signalled the end of the body.
    Clean,
    /// The upstream closed without a length or terminator, so truncation is undetectable.
    Ambiguous,
    /// Reading or writing failed mid-body.
    Failed,
}

/// Destination of a relayed body.
pub trait ResponseSink: Send {
    fn write_data(&mut self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Completes the body. Called exactly once per relayed response.
    fn finalize(&mut self, termination: Termination) -> impl Future<Output = io::Result<()>> + Send;
}

/// Outcome of a relay that reached the sink's finalize successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Complete { bytes: u64 },
    /// Best-effort delivery of a close-delimited body.
    Ambiguous { bytes: u64 },
}

/// Body framing toward the inbound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body may follow the head.
    NoBody,
    /// Raw bytes, length announced by `Content-Length`.
    Length(u64),
    /// Re-chunked with `Transfer-Encoding: chunked`.
    Chunked,
    /// Raw bytes, ended by closing the connection.
    CloseDelimited,
}

impl BodyFraming {
    /// Picks the downstream framing for an upstream response and adjusts its headers to match.
    ///
    /// HTTP/1.0 clients never receive chunked framing.
    pub fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &mut HeaderFields,
        client_version: Version,
    ) -> Self {
        if *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return BodyFraming::NoBody;
        }
        if is_chunked(headers) {
            headers.remove(CONTENT_LENGTH.as_str());
            if client_version == Version::HTTP_10 {
                headers.remove(TRANSFER_ENCODING.as_str());
                return BodyFraming::CloseDelimited;
            }
            return BodyFraming::Chunked;
        }
        match content_length(headers) {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::CloseDelimited,
        }
    }

    /// Whether the client connection must close once the body is written.
    pub fn closes_connection(&self) -> bool {
        matches!(self, BodyFraming::CloseDelimited)
    }
}

/// Whether the upstream declared where its body ends.
pub(crate) fn upstream_delimits_body(headers: &HeaderFields) -> bool {
    is_chunked(headers) || content_length(headers).is_some()
}

fn is_chunked(headers: &HeaderFields) -> bool {
    headers
        .get_all(TRANSFER_ENCODING.as_str())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderFields) -> Option<u64> {
    headers
        .get_all(CONTENT_LENGTH.as_str())
        .next()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Writes body chunks to a client connection using a [`BodyFraming`].
#[derive(Debug)]
pub struct FramedSink<'a, W> {
    writer: &'a mut W,
    framing: BodyFraming,
}

impl<'a, W: AsyncWrite + Send + Unpin> FramedSink<'a, W> {
    pub fn new(writer: &'a mut W, framing: BodyFraming) -> Self {
        Self { writer, framing }
    }
}

impl<W: AsyncWrite + Send + Unpin> ResponseSink for FramedSink<'_, W> {
    async fn write_data(&mut self, data: Bytes) -> io::Result<()> {
        match self.framing {
            BodyFraming::NoBody => Ok(()),
            BodyFraming::Chunked => {
                let size = format!("{:x}\r\n", data.len());
                self.writer.write_all(size.as_bytes()).await?;
                self.writer.write_all(&data).await?;
                self.writer.write_all(b"\r\n").await
            }
            BodyFraming::Length(_) | BodyFraming::CloseDelimited => {
                self.writer.write_all(&data).await
            }
        }
    }

    async fn finalize(&mut self, termination: Termination) -> io::Result<()> {
        // A failed chunked body is left unterminated so the client sees the truncation.
        if self.framing == BodyFraming::Chunked && termination != Termination::Failed {
            self.writer.write_all(b"0\r\n\r\n").await?;
        }
        self.writer.flush().await
    }
}

/// Unidirectional copy of one response body into a [`ResponseSink`].
///
/// Every run ends in exactly one call to [`ResponseSink::finalize`], whatever
/// the termination.
#[derive(Debug, Clone, Copy)]
pub struct BodyRelay {
    delimited: bool,
}

impl BodyRelay {
    /// `delimited` tells whether the upstream announced the body end (length or chunked).
    pub fn new(delimited: bool) -> Self {
        Self { delimited }
    }

    pub async fn run(
        self,
        source: &mut impl BodySource,
        sink: &mut impl ResponseSink,
    ) -> Result<RelayOutcome, RelayError> {
        let copied = copy(source, sink).await;
        let termination = match (&copied, self.delimited) {
            (Err(_), _) => Termination::Failed,
            (Ok(_), true) => Termination::Clean,
            (Ok(_), false) => Termination::Ambiguous,
        };
        let finalized = sink.finalize(termination).await;
        let bytes = copied?;
        finalized.map_err(|source| e!(RelayError::Downstream { source }))?;
        trace!(bytes, ?termination, "body relayed");
        match termination {
            Termination::Ambiguous => {
                warn!(bytes, "upstream closed without a completion signal, delivered what arrived");
                Ok(RelayOutcome::Ambiguous { bytes })
            }
            _ => Ok(RelayOutcome::Complete { bytes }),
        }
    }
}

async fn copy(
    source: &mut impl BodySource,
    sink: &mut impl ResponseSink,
) -> Result<u64, RelayError> {
    let mut bytes = 0u64;
    while let Some(chunk) = source.next_chunk().await {
        let chunk = chunk.map_err(|source| e!(RelayError::Upstream { source }))?;
        bytes += chunk.len() as u64;
        sink.write_data(chunk)
            .await
            .map_err(|source| e!(RelayError::Downstream { source }))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use http::HeaderValue;

    use super::*;

    struct ScriptedSource(VecDeque<io::Result<Bytes>>);

    impl ScriptedSource {
        fn new(items: impl IntoIterator<Item = io::Result<&'static str>>) -> Self {
            Self(
                items
                    .into_iter()
                    .map(|item| item.map(|s| Bytes::from_static(s.as_bytes())))
                    .collect(),
            )
        }
    }

    impl BodySource for ScriptedSource {
        async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
            self.0.pop_front()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        data: Vec<u8>,
        finalized: Vec<Termination>,
        fail_writes: bool,
    }

    impl ResponseSink for RecordingSink {
        async fn write_data(&mut self, data: Bytes) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.data.extend_from_slice(&data);
            Ok(())
        }

        async fn finalize(&mut self, termination: Termination) -> io::Result<()> {
            self.finalized.push(termination);
            Ok(())
        }
    }

    #[tokio::test]
    async fn clean_completion_finalizes_once() {
        let mut source = ScriptedSource::new([Ok("hello "), Ok("world")]);
        let mut sink = RecordingSink::default();
        let outcome = BodyRelay::new(true).run(&mut source, &mut sink).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Complete { bytes: 11 });
        assert_eq!(sink.data, b"hello world");
        assert_eq!(sink.finalized, [Termination::Clean]);
    }

    #[tokio::test]
    async fn ambiguous_end_still_finalizes() {
        let mut source = ScriptedSource::new([Ok("partial")]);
        let mut sink = RecordingSink::default();
        let outcome = BodyRelay::new(false).run(&mut source, &mut sink).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Ambiguous { bytes: 7 });
        assert_eq!(sink.finalized, [Termination::Ambiguous]);
    }

    #[tokio::test]
    async fn upstream_error_finalizes_and_propagates() {
        let mut source = ScriptedSource::new([
            Ok("abc"),
            Err(io::ErrorKind::ConnectionReset.into()),
            Ok("never"),
        ]);
        let mut sink = RecordingSink::default();
        let err = BodyRelay::new(true).run(&mut source, &mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
        assert_eq!(sink.data, b"abc");
        assert_eq!(sink.finalized, [Termination::Failed]);
    }

    #[tokio::test]
    async fn downstream_error_finalizes_and_propagates() {
        let mut source = ScriptedSource::new([Ok("abc")]);
        let mut sink = RecordingSink {
            fail_writes: true,
            ..Default::default()
        };
        let err = BodyRelay::new(true).run(&mut source, &mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::Downstream { .. }));
        assert_eq!(sink.finalized, [Termination::Failed]);
    }

    #[tokio::test]
    async fn chunked_sink_framing() {
        let mut out = Vec::new();
        let mut sink = FramedSink::new(&mut out, BodyFraming::Chunked);
        let mut source = ScriptedSource::new([Ok("hello"), Ok("0123456789abcdef")]);
        BodyRelay::new(true).run(&mut source, &mut sink).await.unwrap();
        assert_eq!(out, b"5\r\nhello\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n");

        let mut out = Vec::new();
        let mut sink = FramedSink::new(&mut out, BodyFraming::Chunked);
        let mut source =
            ScriptedSource::new([Ok("hello"), Err(io::ErrorKind::ConnectionReset.into())]);
        BodyRelay::new(true).run(&mut source, &mut sink).await.unwrap_err();
        assert_eq!(out, b"5\r\nhello\r\n");
    }

    #[test]
    fn framing_selection() {
        let get = Method::GET;
        let v11 = Version::HTTP_11;

        let mut headers = HeaderFields::new();
        headers.append("Content-Length", HeaderValue::from_static("5"));
        assert_eq!(
            BodyFraming::for_response(&get, StatusCode::OK, &mut headers, v11),
            BodyFraming::Length(5)
        );
        assert_eq!(
            BodyFraming::for_response(&Method::HEAD, StatusCode::OK, &mut headers, v11),
            BodyFraming::NoBody
        );
        assert_eq!(
            BodyFraming::for_response(&get, StatusCode::NOT_MODIFIED, &mut headers, v11),
            BodyFraming::NoBody
        );

        let mut headers = HeaderFields::new();
        headers.append("Content-Length", HeaderValue::from_static("5"));
        headers.append("Transfer-Encoding", HeaderValue::from_static("gzip, chunked"));
        assert_eq!(
            BodyFraming::for_response(&get, StatusCode::OK, &mut headers, v11),
            BodyFraming::Chunked
        );
        assert!(upstream_delimits_body(&headers));
        assert!(!headers.contains("content-length"));
        let framing =
            BodyFraming::for_response(&get, StatusCode::OK, &mut headers, Version::HTTP_10);
        assert_eq!(framing, BodyFraming::CloseDelimited);
        assert!(!headers.contains("transfer-encoding"));

        let mut headers = HeaderFields::new();
        assert!(!upstream_delimits_body(&headers));
        let framing = BodyFraming::for_response(&get, StatusCode::OK, &mut headers, v11);
        assert_eq!(framing, BodyFraming::CloseDelimited);
        assert!(framing.closes_connection());
    }
}
