//! # Strom Telemetry
//!
//! Logging subscriber setup and Prometheus metrics for hosts embedding the
//! engine.

pub mod logging;
pub mod metrics;

pub use logging::{EventLogger, TelemetryError};
pub use metrics::MetricsRecorder;
