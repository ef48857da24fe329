//! Chunked response transport for `/invocation/{id}/response`.
//!
//! The request line, headers and every chunk frame are written by hand on a dedicated
//! connection. Any failure returns early and resets the connection without the terminator, which
//! is how the control plane learns the body was truncated. The acknowledgement is parsed with
//! `httparse`.

use std::{io, time::Duration};

use bytes::{Buf, BytesMut};
use http::StatusCode;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    framing::{encode_chunk_frame, TERMINATOR},
    handler::HandlerError,
    invoke::{ChunkSource, MidStreamFailure},
};

pub const RESPONSE_MODE_HEADER: &str = "Lambda-Runtime-Function-Response-Mode";

const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ACK_HEAD_BYTES: usize = 16 * 1024;
const MAX_ACK_BODY_BYTES: usize = 64 * 1024;
const MAX_ACK_HEADERS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Nothing of the body reached the control plane.
    #[error("failed to open response stream: {0}")]
    Connect(#[source] io::Error),
    #[error("response stream write failed after {emitted} chunk(s): {source}")]
    Write {
        emitted: usize,
        #[source]
        source: io::Error,
    },
    #[error("handler failed after {emitted} chunk(s): {error}")]
    Handler { emitted: usize, error: HandlerError },
}

impl StreamError {
    /// Whether streaming headers were already on the wire when the failure happened.
    pub fn headers_sent(&self) -> bool {
        !matches!(self, StreamError::Connect(_))
    }
}

impl From<MidStreamFailure> for StreamError {
    fn from(value: MidStreamFailure) -> Self {
        StreamError::Handler {
            emitted: value.emitted,
            error: value.error,
        }
    }
}

/// How the control plane answered a fully framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Accepted,
    Rejected { status: StatusCode, body: String },
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub chunks: usize,
    /// Sum of chunk payload lengths.
    pub body_bytes: usize,
    /// Bytes written after the headers: every frame plus the terminator.
    pub wire_bytes: usize,
    pub ack: Acknowledgement,
}

/// Opens one connection per streamed response.
#[derive(Debug, Clone)]
pub struct ResponseStreamer {
    runtime_api: String,
    base_path: String,
}

impl ResponseStreamer {
    /// `runtime_api` is `host:port`; `base_path` the versioned prefix, e.g. `/2018-06-01/runtime`.
    pub fn new(runtime_api: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            runtime_api: runtime_api.into(),
            base_path: base_path.into(),
        }
    }

    pub fn response_path(&self, request_id: &str) -> String {
        format!("{}/invocation/{}/response", self.base_path, request_id)
    }

    pub async fn stream(
        &self,
        request_id: &str,
        content_type: &str,
        source: &mut ChunkSource,
    ) -> Result<StreamSummary, StreamError> {
        let mut io = TcpStream::connect(&self.runtime_api)
            .await
            .map_err(StreamError::Connect)?;
        if let Err(err) = io.set_nodelay(true) {
            tracing::debug!(error = %err, "could not disable Nagle on response stream");
        }

        let head = request_head(
            &self.runtime_api,
            &self.response_path(request_id),
            content_type,
        );
        let result = send_stream(&mut io, head.as_bytes(), source).await;
        if matches!(result, Err(ref err) if err.headers_sent()) {
            abort(io);
        }
        result
    }
}

/// Close with RST instead of FIN so the peer sees an abnormal end of the body.
#[allow(deprecated)]
fn abort(io: TcpStream) {
    if let Err(err) = io.set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %err, "could not set zero linger on aborted response stream");
    }
    drop(io);
}

pub fn request_head(host: &str, path: &str, content_type: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         {RESPONSE_MODE_HEADER}: streaming\r\n\
         Transfer-Encoding: chunked\r\n\
         Content-Type: {content_type}\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// Write `head`, then one frame per chunk in handler order, then the terminator, and read the
/// acknowledgment. On error nothing more is written; the caller decides how to close `io`.
pub async fn send_stream<S>(
    io: &mut S,
    head: &[u8],
    source: &mut ChunkSource,
) -> Result<StreamSummary, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(head).await.map_err(StreamError::Connect)?;
    io.flush().await.map_err(StreamError::Connect)?;

    let mut chunks = 0usize;
    let mut body_bytes = 0usize;
    let mut wire_bytes = 0usize;

    while let Some(chunk) = source.next_chunk().await? {
        let frame = encode_chunk_frame(&chunk);
        write_frame(io, &frame)
            .await
            .map_err(|source| StreamError::Write {
                emitted: chunks,
                source,
            })?;

        chunks += 1;
        body_bytes += chunk.len();
        wire_bytes += frame.len();
        tracing::debug!(chunk = chunks, size = chunk.len(), "sent chunk");
    }

    write_frame(io, TERMINATOR)
        .await
        .map_err(|source| StreamError::Write {
            emitted: chunks,
            source,
        })?;
    wire_bytes += TERMINATOR.len();

    let ack = read_acknowledgement(io).await;
    Ok(StreamSummary {
        chunks,
        body_bytes,
        wire_bytes,
        ack,
    })
}

async fn write_frame<S: AsyncWrite + Unpin>(io: &mut S, frame: &[u8]) -> io::Result<()> {
    io.write_all(frame).await?;
    io.flush().await
}

async fn read_acknowledgement<S: AsyncRead + Unpin>(io: &mut S) -> Acknowledgement {
    match tokio::time::timeout(ACK_TIMEOUT, read_response(io)).await {
        Ok(Ok((status, _))) if status == StatusCode::ACCEPTED => Acknowledgement::Accepted,
        Ok(Ok((status, body))) => Acknowledgement::Rejected { status, body },
        Ok(Err(err)) => Acknowledgement::Unreadable(err.to_string()),
        Err(_) => Acknowledgement::Unreadable("timed out waiting for acknowledgement".into()),
    }
}

/// How the acknowledgement body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    fn from_headers(headers: &[httparse::Header<'_>]) -> io::Result<Self> {
        let mut framing = BodyFraming::UntilClose;
        for header in headers {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| invalid(format!("non-ascii {} header", header.name)))?;
            if header.name.eq_ignore_ascii_case("transfer-encoding") {
                let last = value.rsplit(',').next().unwrap_or_default().trim();
                if last.eq_ignore_ascii_case("chunked") {
                    // Chunked wins over any Content-Length.
                    return Ok(BodyFraming::Chunked);
                }
            } else if header.name.eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid(format!("invalid Content-Length {value:?}")))?;
                framing = BodyFraming::Length(len);
            }
        }
        Ok(framing)
    }
}

async fn read_response<S: AsyncRead + Unpin>(io: &mut S) -> io::Result<(StatusCode, String)> {
    let mut buf = BytesMut::with_capacity(1024);

    let (status, framing) = loop {
        if io.read_buf(&mut buf).await? == 0 {
            return Err(eof("connection closed before the acknowledgement head"));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_ACK_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf).map_err(|err| invalid(err.to_string()))? {
            httparse::Status::Complete(head_len) => {
                let code = response
                    .code
                    .ok_or_else(|| invalid("missing status code".to_string()))?;
                let status = StatusCode::from_u16(code).map_err(|err| invalid(err.to_string()))?;
                let framing = BodyFraming::from_headers(response.headers)?;
                buf.advance(head_len);
                break (status, framing);
            }
            httparse::Status::Partial if buf.len() > MAX_ACK_HEAD_BYTES => {
                return Err(invalid("acknowledgement head too large".to_string()));
            }
            httparse::Status::Partial => {}
        }
    };

    let (body, truncated) = match framing {
        BodyFraming::Length(len) => {
            let keep = len.min(MAX_ACK_BODY_BYTES);
            fill(io, &mut buf, keep).await?;
            (buf.split_to(keep).to_vec(), len > keep)
        }
        BodyFraming::UntilClose => {
            while buf.len() <= MAX_ACK_BODY_BYTES && io.read_buf(&mut buf).await? > 0 {}
            let truncated = buf.len() > MAX_ACK_BODY_BYTES;
            buf.truncate(MAX_ACK_BODY_BYTES);
            (buf.to_vec(), truncated)
        }
        BodyFraming::Chunked => read_chunked_body(io, &mut buf).await?,
    };

    if truncated {
        tracing::warn!(
            limit = MAX_ACK_BODY_BYTES,
            "acknowledgement body truncated for logging"
        );
    }
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Decode a chunked body, stopping early once the logging limit is reached.
async fn read_chunked_body<S: AsyncRead + Unpin>(
    io: &mut S,
    buf: &mut BytesMut,
) -> io::Result<(Vec<u8>, bool)> {
    let mut body = Vec::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(&buf[..])
                .map_err(|_| invalid("malformed chunk size".to_string()))?
            {
                httparse::Status::Complete(parsed) => break parsed,
                httparse::Status::Partial => {
                    if io.read_buf(buf).await? == 0 {
                        return Err(eof("connection closed inside a chunk header"));
                    }
                }
            }
        };
        buf.advance(consumed);

        // Trailers after the last chunk are not needed.
        if size == 0 {
            return Ok((body, false));
        }

        let size = usize::try_from(size).map_err(|_| invalid("chunk too large".to_string()))?;
        let room = MAX_ACK_BODY_BYTES - body.len();
        if size > room {
            fill(io, buf, room).await?;
            body.extend_from_slice(&buf[..room]);
            return Ok((body, true));
        }

        fill(io, buf, size + 2).await?;
        body.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(invalid("chunk not followed by CRLF".to_string()));
        }
        buf.advance(size + 2);
    }
}

async fn fill<S: AsyncRead + Unpin>(io: &mut S, buf: &mut BytesMut, want: usize) -> io::Result<()> {
    while buf.len() < want {
        if io.read_buf(buf).await? == 0 {
            return Err(eof("connection closed inside the acknowledgement body"));
        }
    }
    Ok(())
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn eof(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, msg)
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use serde_json::Value;
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::{
        context::ExecutionContext,
        framing::{decode_chunked_body, frame_overhead},
        handler::stream_handler,
        testing::context,
    };

    const ACCEPTED: &[u8] = b"HTTP/1.1 202 Accepted\r\nContent-Length: 15\r\n\r\n{\"status\":\"OK\"}";

    async fn source_of(items: Vec<Result<&'static str, HandlerError>>) -> ChunkSource {
        let handler = stream_handler(move |_event: Value, _ctx: ExecutionContext| {
            let items: Vec<Result<&'static str, HandlerError>> = items
                .iter()
                .map(|r| match r {
                    Ok(s) => Ok(*s),
                    Err(e) => Err(HandlerError::msg(e.to_string())),
                })
                .collect();
            stream::iter(items)
        });
        ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .unwrap()
    }

    /// Runs the transport against an in-memory peer that has already queued `reply`.
    /// Returns the transport result and everything written after the request head.
    async fn run(
        mut source: ChunkSource,
        reply: &[u8],
    ) -> (Result<StreamSummary, StreamError>, Vec<u8>) {
        let (mut client, mut server): (DuplexStream, DuplexStream) = duplex(256 * 1024);
        server.write_all(reply).await.unwrap();
        // The peer has said all it will; the stream reads EOF after `reply`.
        server.shutdown().await.unwrap();

        let head = request_head(
            "127.0.0.1:9001",
            "/2018-06-01/runtime/invocation/req-1/response",
            "text/plain",
        );
        let result = send_stream(&mut client, head.as_bytes(), &mut source).await;
        drop(client);

        let mut written = Vec::new();
        server.read_to_end(&mut written).await.unwrap();
        assert!(written.starts_with(head.as_bytes()));
        (result, written[head.len()..].to_vec())
    }

    #[test]
    fn head_announces_streaming_and_chunked_encoding() {
        let head = request_head(
            "localhost:9001",
            "/2018-06-01/runtime/invocation/abc/response",
            "application/x-ndjson",
        );
        assert!(head.starts_with("POST /2018-06-01/runtime/invocation/abc/response HTTP/1.1\r\n"));
        assert!(head.contains("\r\nLambda-Runtime-Function-Response-Mode: streaming\r\n"));
        assert!(head.contains("\r\nTransfer-Encoding: chunked\r\n"));
        assert!(head.contains("\r\nContent-Type: application/x-ndjson\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn frames_each_chunk_and_terminates_once() {
        let words = ["Hello ", "this ", "is ", "a ", "test "];
        let source = source_of(words.iter().map(|w| Ok(*w)).collect()).await;

        let (result, body) = run(source, ACCEPTED).await;
        let summary = result.unwrap();

        assert_eq!(summary.chunks, 5);
        assert_eq!(summary.ack, Acknowledgement::Accepted);
        assert_eq!(
            &body[..],
            &b"6\r\nHello \r\n5\r\nthis \r\n3\r\nis \r\n2\r\na \r\n5\r\ntest \r\n0\r\n\r\n"[..]
        );

        let expected_wire = words
            .iter()
            .map(|w| w.len() + frame_overhead(w.len()))
            .sum::<usize>()
            + TERMINATOR.len();
        assert_eq!(summary.wire_bytes, expected_wire);
        assert_eq!(summary.wire_bytes, body.len());
        assert_eq!(summary.body_bytes, words.concat().len());

        let (decoded, terminated) = decode_chunked_body(&body).unwrap();
        assert!(terminated);
        assert_eq!(decoded.concat(), words.concat().into_bytes());
        assert_eq!(body.windows(TERMINATOR.len()).filter(|w| *w == TERMINATOR).count(), 1);
    }

    #[tokio::test]
    async fn lengths_are_counted_over_encoded_bytes() {
        let source = source_of(vec![Ok("naïve ")]).await;
        let (result, body) = run(source, ACCEPTED).await;
        result.unwrap();
        assert!(body.starts_with(b"7\r\nna\xc3\xafve \r\n"));
    }

    #[tokio::test]
    async fn empty_output_sends_only_the_terminator() {
        let source = source_of(vec![]).await;
        let (result, body) = run(source, ACCEPTED).await;
        let summary = result.unwrap();
        assert_eq!(summary.chunks, 0);
        assert_eq!(&body[..], TERMINATOR);
    }

    #[tokio::test]
    async fn mid_stream_failure_aborts_without_terminator() {
        let source = source_of(vec![Ok("one "), Ok("two "), Err(HandlerError::msg("boom"))]).await;
        let (result, body) = run(source, ACCEPTED).await;

        match result {
            Err(StreamError::Handler { emitted, error }) => {
                assert_eq!(emitted, 2);
                assert_eq!(error.to_string(), "boom");
            }
            other => panic!("expected handler failure, got {other:?}"),
        }
        assert_eq!(&body[..], b"4\r\none \r\n4\r\ntwo \r\n");
        let (decoded, terminated) = decode_chunked_body(&body).unwrap();
        assert!(!terminated);
        assert_eq!(decoded.len(), 2);
    }

    #[tokio::test]
    async fn non_accepted_status_is_reported_not_raised() {
        let source = source_of(vec![Ok("x")]).await;
        let (result, _) = run(
            source,
            b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 8\r\n\r\ntoo big!",
        )
        .await;

        let summary = result.unwrap();
        assert_eq!(
            summary.ack,
            Acknowledgement::Rejected {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                body: "too big!".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn garbled_acknowledgement_is_unreadable() {
        let source = source_of(vec![Ok("x")]).await;
        let (result, _) = run(source, b"nonsense\r\n\r\n").await;
        assert!(matches!(result.unwrap().ack, Acknowledgement::Unreadable(_)));
    }

    #[tokio::test]
    async fn connect_failure_happens_before_headers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let streamer = ResponseStreamer::new(addr.to_string(), "/2018-06-01/runtime");
        let mut source = source_of(vec![Ok("x")]).await;
        let err = streamer
            .stream("req-1", "text/plain", &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Connect(_)));
        assert!(!err.headers_sent());
    }

    async fn ack_of(reply: &[u8]) -> Acknowledgement {
        let (result, _) = run(source_of(vec![Ok("x")]).await, reply).await;
        result.unwrap().ack
    }

    #[tokio::test]
    async fn chunked_acknowledgement_body_is_decoded() {
        let ack = ack_of(
            b"HTTP/1.1 400 Bad Request\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nbad \r\n6\r\nstream\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(
            ack,
            Acknowledgement::Rejected {
                status: StatusCode::BAD_REQUEST,
                body: "bad stream".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn body_without_length_is_read_to_close() {
        let ack = ack_of(b"HTTP/1.1 500 Internal Server Error\r\n\r\nexploded").await;
        assert_eq!(
            ack,
            Acknowledgement::Rejected {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "exploded".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn invalid_content_length_is_unreadable() {
        let ack = ack_of(b"HTTP/1.1 202 Accepted\r\nContent-Length: lots\r\n\r\n").await;
        match ack {
            Acknowledgement::Unreadable(reason) => assert!(reason.contains("Content-Length")),
            other => panic!("expected unreadable acknowledgement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_acknowledgement_body_is_capped() {
        let body = "e".repeat(MAX_ACK_BODY_BYTES + 100);
        let reply = format!(
            "HTTP/1.1 413 Payload Too Large\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        match ack_of(reply.as_bytes()).await {
            Acknowledgement::Rejected { status, body } => {
                assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
                assert_eq!(body.len(), MAX_ACK_BODY_BYTES);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_acknowledgement_is_unreadable() {
        assert!(matches!(ack_of(b"").await, Acknowledgement::Unreadable(_)));
        assert!(matches!(
            ack_of(b"HTTP/1.1 abc Nope\r\n\r\n").await,
            Acknowledgement::Unreadable(_)
        ));
    }

    #[tokio::test]
    async fn aborted_stream_resets_the_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let outcome = conn.read_to_end(&mut received).await;
            (outcome.map_err(|e| e.kind()), received)
        });

        let streamer = ResponseStreamer::new(addr.to_string(), "/2018-06-01/runtime");
        let mut source = source_of(vec![Ok("one "), Err(HandlerError::msg("boom"))]).await;
        let err = streamer
            .stream("req-1", "text/plain", &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Handler { emitted: 1, .. }));

        let (outcome, received) = peer.await.unwrap();
        assert_eq!(outcome.unwrap_err(), io::ErrorKind::ConnectionReset);
        assert!(!received.ends_with(TERMINATOR));
    }
}
