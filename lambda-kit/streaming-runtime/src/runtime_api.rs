//! Runtime API calls that use a plain request/response exchange: `/next` and `/error`.
//!
//! The streamed `/response` call needs control over chunk framing and lives in
//! [`crate::transport`].

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::report::ErrorReport;

pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
pub const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
pub const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
pub const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
pub const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";
pub const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

/// One unit of work handed out by `/next`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: String,
    pub deadline_epoch_ms: Option<u64>,
    pub function_arn: String,
    pub trace_context: Option<String>,
    pub client_context: Option<String>,
    pub identity: Option<String>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

impl Invocation {
    pub fn from_parts(headers: HeaderMap, payload: Bytes) -> Result<Self, PollFailure> {
        let request_id = header_str(&headers, REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or(PollFailure::MissingRequestId)?
            .to_string();

        // A missing or garbled deadline means none is enforced.
        let deadline_epoch_ms =
            header_str(&headers, DEADLINE_HEADER).and_then(|v| v.trim().parse::<u64>().ok());

        Ok(Self {
            request_id,
            deadline_epoch_ms,
            function_arn: header_str(&headers, FUNCTION_ARN_HEADER)
                .unwrap_or_default()
                .to_string(),
            trace_context: header_str(&headers, TRACE_ID_HEADER).map(str::to_string),
            client_context: header_str(&headers, CLIENT_CONTEXT_HEADER).map(str::to_string),
            identity: header_str(&headers, COGNITO_IDENTITY_HEADER).map(str::to_string),
            headers,
            payload,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum PollFailure {
    #[error("runtime api /next request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runtime api /next failed (status {0})")]
    Status(StatusCode),
    #[error("runtime api /next response missing Lambda-Runtime-Aws-Request-Id")]
    MissingRequestId,
    /// Headers arrived, so the request id is known, but the payload could not be read.
    #[error("runtime api /next payload for {request_id} could not be read: {source}")]
    Body {
        request_id: String,
        #[source]
        source: reqwest::Error,
    },
}

impl PollFailure {
    /// Request id of an invocation that was handed out but could not be started.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            PollFailure::Body { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportFailure {
    #[error("runtime api /error request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runtime api /error failed (status {0})")]
    Status(StatusCode),
}

#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl RuntimeApiClient {
    /// `base_url` is the versioned runtime root, e.g. `http://127.0.0.1:9001/2018-06-01/runtime`.
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        // No idle pool: every poll and every report gets its own connection.
        let http = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { base_url, http })
    }

    /// Long-poll for the next invocation. The control plane holds the request open until work
    /// is available, so no client-side timeout is set.
    pub async fn next_invocation(&self) -> Result<Invocation, PollFailure> {
        let url = format!("{}/invocation/next", self.base_url);
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PollFailure::Status(status));
        }

        let headers = resp.headers().clone();
        let payload = match resp.bytes().await {
            Ok(payload) => payload,
            Err(source) => {
                return Err(match header_str(&headers, REQUEST_ID_HEADER) {
                    Some(id) if !id.is_empty() => PollFailure::Body {
                        request_id: id.to_string(),
                        source,
                    },
                    _ => PollFailure::Transport(source),
                })
            }
        };
        Invocation::from_parts(headers, payload)
    }

    pub async fn report_error(
        &self,
        request_id: &str,
        report: &ErrorReport,
    ) -> Result<(), ReportFailure> {
        let url = format!("{}/invocation/{}/error", self.base_url, request_id);
        let resp = self
            .http
            .post(url)
            .header(ERROR_TYPE_HEADER, report.kind.as_str())
            .json(report)
            .send()
            .await?;

        let status = resp.status();
        // Drain so the connection closes cleanly.
        let _ = resp.bytes().await;
        if status != StatusCode::ACCEPTED {
            return Err(ReportFailure::Status(status));
        }

        Ok(())
    }
}
