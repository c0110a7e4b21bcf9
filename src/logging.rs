use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cache::{CacheKey, RemovalReason};
use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// Emits one `cache_event` record for an entry leaving the index.
pub fn log_removal(key: &CacheKey, reason: RemovalReason) {
    tracing::debug!(
        target: "cache_event",
        event = "removed",
        method = key.method(),
        uri = key.uri(),
        variant = key.variant().len(),
        file = %key.file_name(),
        reason = reason.as_str(),
    );
}
