//! Structured error reports posted to `/invocation/{id}/error`.

use serde::{Serialize, Serializer};

use crate::{
    handler::{ErrorKind, HandlerError},
    runtime_api::{PollFailure, RuntimeApiClient},
    transport::StreamError,
};

fn serialize_kind<S: Serializer>(kind: &ErrorKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    #[serde(rename = "errorMessage")]
    pub message: String,
    #[serde(rename = "errorType", serialize_with = "serialize_kind")]
    pub kind: ErrorKind,
    #[serde(rename = "stackTrace")]
    pub trace: Vec<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            trace: Vec::new(),
        }
    }

    pub fn from_handler_error(err: &HandlerError) -> Self {
        let mut chain = err.chain();
        let message = chain.next().unwrap_or_default();
        Self {
            message,
            kind: err.kind(),
            trace: chain.collect(),
        }
    }

    pub fn from_stream_error(err: &StreamError) -> Self {
        match err {
            StreamError::Handler { emitted, error } => {
                let mut report = Self::from_handler_error(error);
                if *emitted > 0 {
                    report.kind = ErrorKind::StreamFailure;
                    report
                        .trace
                        .push(format!("response stream aborted after {emitted} chunk(s)"));
                }
                report
            }
            StreamError::Connect(_) => Self::with_sources(ErrorKind::TransportFailure, err),
            StreamError::Write { .. } => Self::with_sources(ErrorKind::StreamFailure, err),
        }
    }

    /// An invocation was handed out but its payload never arrived intact.
    pub fn from_poll_failure(err: &PollFailure) -> Self {
        Self::with_sources(ErrorKind::TransportFailure, err)
    }

    fn with_sources(kind: ErrorKind, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            kind,
            trace,
        }
    }
}

/// Posts error reports. Delivery problems are logged and swallowed; they never reach the loop.
#[derive(Clone)]
pub struct ErrorReporter {
    api: RuntimeApiClient,
}

impl ErrorReporter {
    pub fn new(api: RuntimeApiClient) -> Self {
        Self { api }
    }

    /// Returns whether the control plane accepted the report.
    pub async fn report(&self, request_id: &str, report: &ErrorReport) -> bool {
        match self.api.report_error(request_id, report).await {
            Ok(()) => {
                tracing::info!(
                    request_id = %request_id,
                    error_type = %report.kind,
                    error_message = %report.message,
                    "reported invocation error"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    error = %err,
                    error_type = %report.kind,
                    "failed to report invocation error"
                );
                false
            }
        }
    }
}
