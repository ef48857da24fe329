//! The runtime loop: poll → invoke → stream, with error reporting on failure.
//!
//! The loop is an explicit state machine. One invocation is in flight at a time, and each
//! invocation ends in exactly one of: an acknowledged stream, or an error report.

use std::{future::Future, sync::Arc, time::Duration};

use tracing::Instrument as _;

use crate::{
    config::{Config, FunctionEnvironment},
    context::ExecutionContext,
    handler::StreamingHandler,
    invoke::ChunkSource,
    report::{ErrorReport, ErrorReporter},
    runtime_api::{Invocation, RuntimeApiClient},
    transport::{Acknowledgement, ResponseStreamer},
};

/// Process variable carrying the trace header of the invocation being handled.
pub const TRACE_ENV_VAR: &str = "_X_AMZN_TRACE_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Invoking,
    Streaming,
    Reporting,
}

struct Inflight {
    request_id: String,
    span: tracing::Span,
}

enum LoopState {
    Idle,
    Polling,
    Invoking(Inflight, Invocation),
    Streaming(Inflight, ChunkSource),
    Reporting(Inflight, ErrorReport),
}

impl LoopState {
    fn phase(&self) -> Phase {
        match self {
            LoopState::Idle => Phase::Idle,
            LoopState::Polling => Phase::Polling,
            LoopState::Invoking(..) => Phase::Invoking,
            LoopState::Streaming(..) => Phase::Streaming,
            LoopState::Reporting(..) => Phase::Reporting,
        }
    }
}

/// Counters returned when the loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Invocations whose stream was fully framed and terminated.
    pub streamed: u64,
    /// Invocations that ended with an error report attempt.
    pub reported: u64,
    pub poll_failures: u64,
}

pub struct Runtime<H> {
    api: RuntimeApiClient,
    streamer: ResponseStreamer,
    reporter: ErrorReporter,
    function: Arc<FunctionEnvironment>,
    poll_retry_delay: Duration,
    handler: H,
}

impl<H: StreamingHandler> Runtime<H> {
    pub fn new(config: &Config, handler: H) -> anyhow::Result<Self> {
        let api = RuntimeApiClient::new(config.runtime_base_url())?;
        Ok(Self {
            reporter: ErrorReporter::new(api.clone()),
            api,
            streamer: ResponseStreamer::new(&config.runtime_api, config.runtime_base_path()),
            function: config.function.clone(),
            poll_retry_delay: config.poll_retry_delay,
            handler,
        })
    }

    /// Drive the loop until `shutdown` resolves. Shutdown is only observed between
    /// invocations; an invocation in flight always runs to its terminal outcome.
    pub async fn run_until<F>(&self, shutdown: F) -> LoopStats
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut stats = LoopStats::default();
        let mut state = LoopState::Idle;

        loop {
            tracing::trace!(phase = ?state.phase(), "runtime loop step");
            state = match state {
                LoopState::Idle => {
                    set_trace_env(None);
                    LoopState::Polling
                }
                LoopState::Polling => {
                    let polled = tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        polled = self.api.next_invocation() => polled,
                    };

                    match polled {
                        Ok(invocation) => self.begin(invocation),
                        Err(err) if err.request_id().is_some() => {
                            stats.poll_failures += 1;
                            let request_id = err.request_id().unwrap_or_default().to_string();
                            let span = tracing::info_span!("invocation", request_id = %request_id);
                            span.in_scope(|| {
                                tracing::error!(error = %err, "invocation payload could not be read")
                            });
                            let report = ErrorReport::from_poll_failure(&err);
                            LoopState::Reporting(Inflight { request_id, span }, report)
                        }
                        Err(err) => {
                            stats.poll_failures += 1;
                            tracing::warn!(
                                error = %err,
                                retry_in_ms = self.poll_retry_delay.as_millis() as u64,
                                "poll for next invocation failed"
                            );
                            tokio::select! {
                                biased;
                                _ = &mut shutdown => break,
                                _ = tokio::time::sleep(self.poll_retry_delay) => {}
                            }
                            LoopState::Polling
                        }
                    }
                }
                LoopState::Invoking(inflight, invocation) => {
                    let ctx = ExecutionContext::new(&invocation, self.function.clone());
                    let started = ChunkSource::start(&self.handler, &invocation.payload, ctx)
                        .instrument(inflight.span.clone())
                        .await;

                    match started {
                        Ok(source) => LoopState::Streaming(inflight, source),
                        Err(err) => {
                            inflight.span.in_scope(|| {
                                tracing::error!(
                                    error = %err,
                                    error_type = %err.kind(),
                                    "handler failed before producing output"
                                )
                            });
                            let report = ErrorReport::from_handler_error(&err);
                            LoopState::Reporting(inflight, report)
                        }
                    }
                }
                LoopState::Streaming(inflight, mut source) => {
                    let streamed = self
                        .streamer
                        .stream(&inflight.request_id, self.handler.content_type(), &mut source)
                        .instrument(inflight.span.clone())
                        .await;
                    drop(source);

                    match streamed {
                        Ok(summary) => {
                            stats.streamed += 1;
                            inflight.span.in_scope(|| match &summary.ack {
                                Acknowledgement::Accepted => tracing::info!(
                                    chunks = summary.chunks,
                                    body_bytes = summary.body_bytes,
                                    "streaming complete"
                                ),
                                Acknowledgement::Rejected { status, body } => tracing::error!(
                                    chunks = summary.chunks,
                                    status = %status,
                                    body = %body,
                                    "control plane rejected response stream"
                                ),
                                Acknowledgement::Unreadable(reason) => tracing::error!(
                                    chunks = summary.chunks,
                                    reason = %reason,
                                    "no usable acknowledgement for response stream"
                                ),
                            });
                            LoopState::Idle
                        }
                        Err(err) => {
                            inflight.span.in_scope(|| {
                                tracing::error!(
                                    error = %err,
                                    headers_sent = err.headers_sent(),
                                    "response stream failed"
                                )
                            });
                            let report = ErrorReport::from_stream_error(&err);
                            LoopState::Reporting(inflight, report)
                        }
                    }
                }
                LoopState::Reporting(inflight, report) => {
                    stats.reported += 1;
                    self.reporter
                        .report(&inflight.request_id, &report)
                        .instrument(inflight.span.clone())
                        .await;
                    LoopState::Idle
                }
            };
        }

        set_trace_env(None);
        tracing::info!(
            streamed = stats.streamed,
            reported = stats.reported,
            poll_failures = stats.poll_failures,
            "runtime loop stopped"
        );
        stats
    }

    fn begin(&self, invocation: Invocation) -> LoopState {
        set_trace_env(invocation.trace_context.as_deref());

        let span = tracing::info_span!(
            "invocation",
            request_id = %invocation.request_id,
            trace_id = invocation.trace_context.as_deref().unwrap_or_default(),
        );
        span.in_scope(|| {
            tracing::info!(
                payload_len = invocation.payload.len(),
                deadline_ms = invocation.deadline_epoch_ms,
                "received invocation"
            )
        });

        let inflight = Inflight {
            request_id: invocation.request_id.clone(),
            span,
        };
        LoopState::Invoking(inflight, invocation)
    }
}

// The loop is the only writer, and it writes only between Runtime API calls, never while a
// request (and its name resolution) is in flight.
fn set_trace_env(trace_id: Option<&str>) {
    match trace_id {
        Some(id) => std::env::set_var(TRACE_ENV_VAR, id),
        None => std::env::remove_var(TRACE_ENV_VAR),
    }
}
