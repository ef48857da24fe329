//! `streaming-runtime` is a custom AWS Lambda runtime client for response streaming.
//!
//! It long-polls the Runtime API for invocations, runs a [`StreamingHandler`] that produces
//! output incrementally, and relays each chunk to the Runtime API as it is produced using
//! HTTP/1.1 chunked transfer encoding.
//!
//! Core modules:
//! - [`config`]: environment-sourced configuration
//! - [`runtime_api`]: `/next` long-poll and `/error` reports
//! - [`context`]: per-invocation execution context
//! - [`handler`]: the handler capability and its error type
//! - [`invoke`]: pull-based adapter over handler output
//! - [`framing`] and [`transport`]: chunk frames and the streamed `/response` call
//! - [`report`]: structured error reports
//! - [`runtime`]: the poll → invoke → stream loop

use std::future::Future;

pub mod config;
pub mod context;
pub mod framing;
pub mod handler;
pub mod invoke;
pub mod logging;
pub mod report;
pub mod runtime;
pub mod runtime_api;
pub mod transport;

pub use config::{Config, ConfigError};
pub use context::ExecutionContext;
pub use handler::{
    stream_handler, ChunkStream, ErrorKind, HandlerError, ResponseChunk, StreamingHandler,
};
pub use runtime::{LoopStats, Runtime};

/// Start the runtime with `handler` and serve invocations until SIGTERM or Ctrl-C.
///
/// Fails only on startup misconfiguration, before any invocation is polled.
pub async fn run<H: StreamingHandler>(handler: H) -> anyhow::Result<()> {
    logging::init_tracing();

    let cfg = Config::from_env().inspect_err(|err| {
        tracing::error!(error = %err, "invalid runtime configuration");
    })?;
    tracing::info!(
        runtime_api = %cfg.runtime_api,
        function_name = %cfg.function.function_name,
        "streaming runtime starting"
    );

    let runtime = Runtime::new(&cfg, handler)?;
    runtime.run_until(shutdown_signal()).await;
    Ok(())
}

fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown requested");
    }
}
