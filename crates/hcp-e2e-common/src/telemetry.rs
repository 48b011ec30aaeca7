//! Logging initialization for test processes
//!
//! Scenario tests run in parallel inside one process, so initialization is
//! idempotent: the first caller installs the subscriber, later calls are
//! no-ops.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting JSON log output
pub const LOG_FORMAT_ENV: &str = "HCP_E2E_LOG_FORMAT";

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str =
    "info,hcp_e2e=debug,hcp_e2e_common=debug,kube=info,hyper=warn";

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines captured by the test runner
    #[default]
    Pretty,
    /// One JSON object per line, for CI log ingestion
    Json,
}

impl LogFormat {
    /// Read the format from `HCP_E2E_LOG_FORMAT` ("json" selects JSON)
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global tracing subscriber once per process.
///
/// Returns false when a subscriber was already installed.
pub fn init_logging(format: LogFormat) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
    };
    result.is_ok()
}

/// Initialize logging from the environment; convenient first line of a test
pub fn init_test_logging() {
    let _ = init_logging(LogFormat::from_env());
}
