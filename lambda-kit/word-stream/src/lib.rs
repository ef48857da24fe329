//! Reference streaming handler: splits a sentence and streams one NDJSON record per word.
//!
//! Event shape: `{"sentence": "your sentence here"}`. Each chunk is a line such as
//! `{"word":"Hello","index":0,"total":5}\n`.

use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use streaming_runtime::{
    ChunkStream, ExecutionContext, HandlerError, ResponseChunk, StreamingHandler,
};

pub const DEFAULT_SENTENCE: &str = "Hello world";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const DELAY_VAR: &str = "WORD_STREAM_DELAY_MS";

fn default_delay() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WordRecord {
    pub word: String,
    pub index: usize,
    pub total: usize,
}

/// Encode a record as one newline-terminated JSON line.
pub fn encode_word_line(record: &WordRecord) -> Result<Vec<u8>, HandlerError> {
    let mut out = serde_json::to_vec(record)?;
    out.push(b'\n');
    Ok(out)
}

/// Sentence to split, falling back to [`DEFAULT_SENTENCE`] when the event has none.
pub fn sentence_of(event: &Value) -> &str {
    event
        .get("sentence")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SENTENCE)
}

pub fn word_records(sentence: &str) -> Vec<WordRecord> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let total = words.len();
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| WordRecord {
            word: word.to_string(),
            index,
            total,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct WordStream {
    delay: Duration,
}

impl Default for WordStream {
    fn default() -> Self {
        Self {
            delay: default_delay(),
        }
    }
}

impl WordStream {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay between words from `WORD_STREAM_DELAY_MS`, 500ms when unset or unparsable.
    pub fn from_env() -> Self {
        let delay = std::env::var(DELAY_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(default_delay);
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl StreamingHandler for WordStream {
    fn content_type(&self) -> &str {
        NDJSON_CONTENT_TYPE
    }

    fn call(&self, event: Value, ctx: ExecutionContext) -> Result<ChunkStream, HandlerError> {
        let records = word_records(sentence_of(&event));
        tracing::info!(
            request_id = %ctx.request_id,
            words = records.len(),
            "streaming words"
        );

        let delay = self.delay;
        let chunks =
            stream::iter(records.into_iter().enumerate()).then(move |(i, record)| async move {
                // Pause between words, not before the first one.
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                encode_word_line(&record).map(ResponseChunk::Binary)
            });

        Ok(chunks.boxed())
    }
}
