//! Run the word handler locally, printing chunks as they are produced.

use std::{io::Write as _, sync::Arc, time::Duration};

use clap::Parser;
use futures::StreamExt;
use streaming_runtime::{ExecutionContext, ResponseChunk, StreamingHandler};
use word_stream::WordStream;

#[derive(Debug, Parser)]
struct Args {
    /// Sentence to stream; the handler default is used when omitted.
    #[arg(long)]
    sentence: Option<String>,
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streaming_runtime::logging::init_tracing();
    let args = Args::parse();

    let event = match &args.sentence {
        Some(sentence) => serde_json::json!({ "sentence": sentence }),
        None => serde_json::json!({}),
    };
    let ctx = ExecutionContext::local("local-invocation", Arc::default());

    let handler = WordStream::new(Duration::from_millis(args.delay_ms));
    let mut chunks = handler
        .call(event, ctx)
        .map_err(|err| anyhow::anyhow!("handler failed: {err}"))?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|err| anyhow::anyhow!("handler failed mid-stream: {err}"))?;
        let bytes = match chunk {
            ResponseChunk::Text(s) => s.into_bytes(),
            ResponseChunk::Binary(b) => b,
        };
        stdout.write_all(&bytes)?;
        stdout.flush()?;
    }

    Ok(())
}
