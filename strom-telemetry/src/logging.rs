//! ## strom-telemetry::logging
//! **Structured logging with tracing and OpenTelemetry attributes**
//!
//! The engine crates only emit `tracing` events; a host installs the
//! subscriber once at startup through [`EventLogger::init`].

use opentelemetry::KeyValue;
use thiserror::Error;
use tracing::{info_span, Instrument};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("subscriber already installed: {0}")]
    Install(String),
}

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global fmt subscriber. `RUST_LOG` wins over `level`.
    pub fn init(level: &str) -> Result<(), TelemetryError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(level).map_err(|e| TelemetryError::Filter(e.to_string()))?,
        };

        fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_span_events(FmtSpan::ENTER)
            .try_init()
            .map_err(|e| TelemetryError::Install(e.to_string()))
    }

    /// Emits one host lifecycle event (unit started, connection opened,
    /// shutdown) with OpenTelemetry-style attributes.
    #[inline]
    pub async fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "engine_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );

        async {
            tracing::info!(
                metadata = ?metadata,
                "engine event"
            );
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logging() {
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(EventLogger::log_event(
                "unit_started",
                vec![KeyValue::new("unit", "unit-0")],
            ));
        assert!(logs_contain("engine event"));
        assert!(logs_contain("unit-0"));
    }
}
