// file: src/logging/logger.rs
// version: 1.0.0
// guid: d8a08976-8c50-4f18-8593-e2185119e3de

//! Logger initialization and configuration

use crate::Result;
use tracing::Instrument;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the console logger
pub fn init_logger(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .map_err(|e| {
            crate::error::K8sInitError::config(format!("Failed to initialize logger: {}", e))
        })?;

    Ok(())
}

/// Initialize structured JSON logging, honouring `RUST_LOG`
pub fn init_json_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| {
            crate::error::K8sInitError::config(format!(
                "Failed to initialize JSON logger: {}",
                e
            ))
        })?;

    Ok(())
}

/// Run a future inside an `operation` span
pub async fn with_async_operation_span<F, Fut, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let span = tracing::info_span!("operation", name = operation);
    async move { f().await }.instrument(span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice_does_not_panic() {
        // Only one subscriber can be installed per process; the second
        // call must surface an error instead of panicking.
        let first = init_logger(false, false);
        let second = init_logger(true, false);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_with_async_operation_span() {
        let result =
            with_async_operation_span("async_test_operation", || async { "async_result" }).await;

        assert_eq!(result, "async_result");
    }

    #[tokio::test]
    async fn test_with_async_operation_span_with_delay() {
        let result = with_async_operation_span("delayed_operation", || async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            42
        })
        .await;

        assert_eq!(result, 42);
    }
}
