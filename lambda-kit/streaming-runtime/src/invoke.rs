//! Handler invocation adapter.
//!
//! The first chunk is pulled before anything is sent to the control plane, so a handler that
//! fails up front is reported through `/error` without ever opening `/response`.

use bytes::Bytes;
use futures::{stream::Fuse, Stream, StreamExt};
use serde_json::Value;

use crate::{
    context::ExecutionContext,
    handler::{ChunkStream, ErrorKind, HandlerError, ResponseChunk, StreamingHandler},
};

/// Decode an invocation payload. An empty body is the empty event `{}`.
pub fn decode_event(payload: &[u8]) -> Result<Value, HandlerError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(payload)
        .map_err(|err| HandlerError::from(err).with_kind(ErrorKind::InvalidEvent))
}

/// A handler failed after `emitted` chunks were handed to the transport.
#[derive(Debug)]
pub struct MidStreamFailure {
    pub emitted: usize,
    pub error: HandlerError,
}

/// Pull-based view over handler output with the first chunk already buffered.
pub struct ChunkSource {
    first: Option<Bytes>,
    // Fused: the first pull may already have seen the end, and handler streams need not
    // tolerate being polled past it.
    rest: Fuse<ChunkStream>,
    emitted: usize,
}

impl ChunkSource {
    /// Begin the invocation: decode the event, call the handler and wait for its first chunk.
    ///
    /// Every error returned here happened before any output existed.
    pub async fn start(
        handler: &dyn StreamingHandler,
        payload: &[u8],
        ctx: ExecutionContext,
    ) -> Result<Self, HandlerError> {
        let event = decode_event(payload)?;
        let mut rest = handler.call(event, ctx)?.fuse();

        let first = next_non_empty(&mut rest).await.transpose()?;
        Ok(Self {
            first,
            rest,
            emitted: 0,
        })
    }

    /// Next chunk in handler order, `Ok(None)` at end of sequence.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, MidStreamFailure> {
        let next = match self.first.take() {
            Some(chunk) => Some(chunk),
            None => match next_non_empty(&mut self.rest).await {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(error)) => {
                    return Err(MidStreamFailure {
                        emitted: self.emitted,
                        error,
                    })
                }
                None => None,
            },
        };

        if next.is_some() {
            self.emitted += 1;
        }
        Ok(next)
    }

    /// Chunks handed out so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

// Zero-length chunks would read as the terminator on the wire, so they are dropped here.
async fn next_non_empty<S>(stream: &mut S) -> Option<Result<Bytes, HandlerError>>
where
    S: Stream<Item = Result<ResponseChunk, HandlerError>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(chunk) => {
                let bytes = chunk.into_bytes();
                if bytes.is_empty() {
                    tracing::debug!("skipping empty chunk");
                    continue;
                }
                return Some(Ok(bytes));
            }
            Err(err) => return Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::{handler::stream_handler, testing::context};

    fn failing_after(words: Vec<&'static str>) -> impl StreamingHandler {
        stream_handler(move |_event: Value, _ctx: ExecutionContext| {
            let items: Vec<Result<&'static str, HandlerError>> = words
                .clone()
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(HandlerError::msg("boom"))))
                .collect();
            stream::iter(items)
        })
    }

    #[test]
    fn empty_payload_is_an_empty_object() {
        assert_eq!(decode_event(b"").unwrap(), serde_json::json!({}));
        assert_eq!(decode_event(b" \n").unwrap(), serde_json::json!({}));
    }

    #[test]
    fn malformed_payload_is_an_invalid_event() {
        let err = decode_event(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
    }

    #[tokio::test]
    async fn failure_before_first_chunk_is_reported_by_start() {
        let handler = failing_after(vec![]);
        let err = ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn failure_after_chunks_carries_emitted_count() {
        let handler = failing_after(vec!["a", "b"]);
        let mut source = ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .unwrap();

        assert_eq!(source.next_chunk().await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(source.next_chunk().await.unwrap(), Some(Bytes::from_static(b"b")));
        let failure = source.next_chunk().await.unwrap_err();
        assert_eq!(failure.emitted, 2);
        assert_eq!(failure.error.to_string(), "boom");
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let handler = stream_handler(|_event: Value, _ctx: ExecutionContext| {
            stream::iter(vec![
                Ok::<_, HandlerError>(""),
                Ok("x"),
                Ok(""),
                Ok("y"),
            ])
        });
        let mut source = ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            seen.push(chunk);
        }
        assert_eq!(seen, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        assert_eq!(source.emitted(), 2);
    }

    #[tokio::test]
    async fn unfused_empty_stream_is_not_polled_past_its_end() {
        // `unfold` panics if polled again after yielding `None`.
        let handler = stream_handler(|_event: Value, _ctx: ExecutionContext| {
            stream::unfold((), |()| async { None::<(Result<&'static str, HandlerError>, ())> })
        });
        let mut source = ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .unwrap();

        assert_eq!(source.next_chunk().await.unwrap(), None);
        assert_eq!(source.next_chunk().await.unwrap(), None);
        assert_eq!(source.emitted(), 0);
    }

    #[tokio::test]
    async fn unfused_stream_ends_cleanly_after_its_chunks() {
        let handler = stream_handler(|_event: Value, _ctx: ExecutionContext| {
            stream::unfold(0u8, |n| async move {
                (n < 2).then(|| (Ok::<_, HandlerError>(format!("c{n}")), n + 1))
            })
        });
        let mut source = ChunkSource::start(&handler, b"{}", context("req-1"))
            .await
            .unwrap();

        assert_eq!(source.next_chunk().await.unwrap(), Some(Bytes::from_static(b"c0")));
        assert_eq!(source.next_chunk().await.unwrap(), Some(Bytes::from_static(b"c1")));
        assert_eq!(source.next_chunk().await.unwrap(), None);
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn handler_receives_decoded_event_and_context() {
        let handler = stream_handler(|event: Value, ctx: ExecutionContext| {
            let line = format!("{}:{}", ctx.request_id, event["name"].as_str().unwrap_or("?"));
            stream::iter(vec![Ok::<_, HandlerError>(line)])
        });
        let mut source = ChunkSource::start(&handler, br#"{"name":"ada"}"#, context("req-9"))
            .await
            .unwrap();
        assert_eq!(
            source.next_chunk().await.unwrap(),
            Some(Bytes::from_static(b"req-9:ada"))
        );
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }
}
