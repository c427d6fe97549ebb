//! `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{BucketError, Result};

/// Installs a global `fmt` subscriber filtered by `level`, an `EnvFilter`
/// directive such as `info` or `sombra_bucket=debug`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| BucketError::InvalidArgument(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| BucketError::InvalidArgument("logging already initialized".into()))
}
