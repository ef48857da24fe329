use word_stream::WordStream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streaming_runtime::run(WordStream::from_env()).await
}
