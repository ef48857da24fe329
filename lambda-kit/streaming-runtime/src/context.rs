//! Per-invocation execution context handed to the handler.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{config::FunctionEnvironment, runtime_api::Invocation};

/// Immutable metadata about the invocation being handled.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: String,
    /// Epoch milliseconds after which the platform stops the invocation. `None` when the
    /// control plane sent no usable deadline.
    pub deadline_epoch_ms: Option<u64>,
    pub invoked_function_arn: String,
    pub trace_id: Option<String>,
    pub client_context: Option<String>,
    pub identity: Option<String>,
    pub env: Arc<FunctionEnvironment>,
}

impl ExecutionContext {
    pub fn new(invocation: &Invocation, env: Arc<FunctionEnvironment>) -> Self {
        Self {
            request_id: invocation.request_id.clone(),
            deadline_epoch_ms: invocation.deadline_epoch_ms,
            invoked_function_arn: invocation.function_arn.clone(),
            trace_id: invocation.trace_context.clone(),
            client_context: invocation.client_context.clone(),
            identity: invocation.identity.clone(),
            env,
        }
    }

    /// Context for running a handler outside the Lambda environment: no deadline, ARN or
    /// trace.
    pub fn local(request_id: impl Into<String>, env: Arc<FunctionEnvironment>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline_epoch_ms: None,
            invoked_function_arn: String::new(),
            trace_id: None,
            client_context: None,
            identity: None,
            env,
        }
    }

    /// Time left before the deadline, clamped at zero. Recomputed from the wall clock on every
    /// call; `None` means no deadline is enforced.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.remaining_time_at(now_epoch_ms())
    }

    pub fn remaining_time_at(&self, now_epoch_ms: u64) -> Option<Duration> {
        self.deadline_epoch_ms
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_epoch_ms)))
    }

    pub fn function_name(&self) -> &str {
        &self.env.function_name
    }

    pub fn function_version(&self) -> &str {
        &self.env.function_version
    }

    pub fn memory_limit_in_mb(&self) -> Option<u32> {
        self.env.memory_limit_in_mb
    }

    pub fn log_group_name(&self) -> &str {
        &self.env.log_group_name
    }

    pub fn log_stream_name(&self) -> &str {
        &self.env.log_stream_name
    }
}

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
