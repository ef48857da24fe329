//! Handler capability: turn an event into a lazy, finite stream of response chunks.

use std::fmt;

use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::context::ExecutionContext;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One chunk of a streamed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Text(String),
    Binary(Vec<u8>),
}

impl ResponseChunk {
    /// Wire bytes of the chunk. Text is encoded as UTF-8 here, before any length is computed.
    pub fn into_bytes(self) -> Bytes {
        match self {
            ResponseChunk::Text(s) => Bytes::from(s.into_bytes()),
            ResponseChunk::Binary(b) => Bytes::from(b),
        }
    }
}

impl From<&str> for ResponseChunk {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ResponseChunk {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for ResponseChunk {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<Bytes> for ResponseChunk {
    fn from(value: Bytes) -> Self {
        Self::Binary(value.to_vec())
    }
}

/// Failure classes reported to the control plane as `errorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The invocation payload could not be decoded into an event.
    InvalidEvent,
    /// The handler failed before any chunk was sent.
    HandlerFailure,
    /// The handler or the connection failed after chunked headers were sent.
    StreamFailure,
    /// The response connection could not be established.
    TransportFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidEvent => "Runtime.InvalidEvent",
            ErrorKind::HandlerFailure => "Handler.Failure",
            ErrorKind::StreamFailure => "Runtime.StreamFailure",
            ErrorKind::TransportFailure => "Runtime.TransportFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a handler, either when called or while its stream is being pulled.
///
/// Any `std::error::Error` converts into a `HandlerError` of kind [`ErrorKind::HandlerFailure`],
/// so handlers can use `?` freely.
pub struct HandlerError {
    kind: ErrorKind,
    error: anyhow::Error,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, error: anyhow::Error) -> Self {
        Self { kind, error }
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::HandlerFailure, anyhow::Error::msg(message))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Messages of this error and its sources, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = String> + '_ {
        self.error.chain().map(|e| e.to_string())
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(ErrorKind::HandlerFailure, anyhow::Error::new(error))
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("kind", &self.kind)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

pub type ChunkStream = BoxStream<'static, Result<ResponseChunk, HandlerError>>;

/// A handler whose output is produced incrementally.
pub trait StreamingHandler: Send + Sync {
    /// `Content-Type` announced on the response stream.
    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }

    /// Start handling `event`. Returning `Err` (or a stream whose first item is `Err`) is a
    /// failure before any output; errors later in the stream abort the response.
    fn call(&self, event: Value, ctx: ExecutionContext) -> Result<ChunkStream, HandlerError>;
}

/// Handler built from a closure; see [`stream_handler`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
    content_type: String,
}

/// Wrap a closure returning a chunk stream as a [`StreamingHandler`].
pub fn stream_handler<F>(f: F) -> FnHandler<F> {
    FnHandler {
        f,
        content_type: DEFAULT_CONTENT_TYPE.to_string(),
    }
}

impl<F> FnHandler<F> {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

impl<F, S, C, E> StreamingHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> S + Send + Sync,
    S: Stream<Item = Result<C, E>> + Send + 'static,
    C: Into<ResponseChunk> + 'static,
    E: Into<HandlerError> + 'static,
{
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn call(&self, event: Value, ctx: ExecutionContext) -> Result<ChunkStream, HandlerError> {
        let chunks = (self.f)(event, ctx).map(|item| -> Result<ResponseChunk, HandlerError> {
            match item {
                Ok(chunk) => Ok(chunk.into()),
                Err(err) => Err(err.into()),
            }
        });
        Ok(chunks.boxed())
    }
}
