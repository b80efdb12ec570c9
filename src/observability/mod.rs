//! Observability for the bridge agent
//!
//! Structured logging through `tracing` and a process-wide metrics
//! collector that backs the bridge status report.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{dispatch_span, drain_span, lifecycle_span, mqtt_span};
