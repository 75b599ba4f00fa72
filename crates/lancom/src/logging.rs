use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when neither `RUST_LOG` nor the caller supplies one.
pub const DEFAULT_FILTER: &str = "info,lancom=debug";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install a compact console subscriber. `RUST_LOG` overrides `filter`.
pub fn init_logging(filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(fmt::layer().with_target(false).with_thread_names(true).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Console output plus a daily-rolling `lancom.<date>` file in `logs_dir`.
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "lancom");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(fmt::layer().with_target(false).with_thread_names(true).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; another test may win.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        if let Err(e) = result {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = init_logging("info");
        assert!(init_logging("debug").is_err());
    }

    #[test]
    fn test_filters_parse() {
        for filter in [DEFAULT_FILTER, "warn", "lancom::master=trace,info"] {
            drop(env_filter(filter));
        }
    }
}
