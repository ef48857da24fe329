//! `tracing` subscriber setup for the Lambda environment.

pub const LOG_FORMAT_VAR: &str = "AWS_LAMBDA_LOG_FORMAT";

/// Install the global subscriber. `RUST_LOG` selects levels (default `info`); setting
/// `AWS_LAMBDA_LOG_FORMAT=json` switches to JSON lines. Later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var(LOG_FORMAT_VAR).unwrap_or_default();
    let installed = if wants_json(&log_format) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn wants_json(log_format: &str) -> bool {
    log_format.trim().eq_ignore_ascii_case("json")
}
