//! Runtime configuration sourced from the Lambda execution environment.
//!
//! Everything is read once at startup and handed to the components that need it.

use std::{sync::Arc, time::Duration};

pub const RUNTIME_API_VAR: &str = "AWS_LAMBDA_RUNTIME_API";
pub const POLL_RETRY_VAR: &str = "STREAMING_RUNTIME_POLL_RETRY_MS";

const RUNTIME_API_VERSION: &str = "2018-06-01";

fn default_poll_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_function_version() -> String {
    "$LATEST".to_string()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {name} ({value}): {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Static facts about the deployed function, shared by every execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEnvironment {
    pub function_name: String,
    pub function_version: String,
    pub memory_limit_in_mb: Option<u32>,
    pub log_group_name: String,
    pub log_stream_name: String,
}

impl Default for FunctionEnvironment {
    fn default() -> Self {
        Self {
            function_name: String::new(),
            function_version: default_function_version(),
            memory_limit_in_mb: None,
            log_group_name: String::new(),
            log_stream_name: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the Runtime API.
    pub runtime_api: String,
    /// Fixed delay before polling again after a failed `/next`.
    pub poll_retry_delay: Duration,
    pub function: Arc<FunctionEnvironment>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let runtime_api = lookup(RUNTIME_API_VAR)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(RUNTIME_API_VAR))?;

        let poll_retry_delay = match lookup(POLL_RETRY_VAR) {
            Some(raw) => {
                let ms = raw.trim().parse::<u64>().map_err(|err| ConfigError::Invalid {
                    name: POLL_RETRY_VAR,
                    value: raw.clone(),
                    reason: err.to_string(),
                })?;
                Duration::from_millis(ms)
            }
            None => default_poll_retry_delay(),
        };

        let memory_limit_in_mb = lookup("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
            .and_then(|v| v.trim().parse::<u32>().ok());

        let function = FunctionEnvironment {
            function_name: lookup("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_default(),
            function_version: lookup("AWS_LAMBDA_FUNCTION_VERSION")
                .unwrap_or_else(default_function_version),
            memory_limit_in_mb,
            log_group_name: lookup("AWS_LAMBDA_LOG_GROUP_NAME").unwrap_or_default(),
            log_stream_name: lookup("AWS_LAMBDA_LOG_STREAM_NAME").unwrap_or_default(),
        };

        Ok(Self {
            runtime_api,
            poll_retry_delay,
            function: Arc::new(function),
        })
    }

    /// Versioned base URL of the runtime endpoints, e.g. `http://127.0.0.1:9001/2018-06-01/runtime`.
    pub fn runtime_base_url(&self) -> String {
        format!("http://{}/{RUNTIME_API_VERSION}/runtime", self.runtime_api)
    }

    /// Path prefix used when the request line is written by hand.
    pub fn runtime_base_path(&self) -> String {
        format!("/{RUNTIME_API_VERSION}/runtime")
    }
}
