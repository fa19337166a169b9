//! # Gateway Telemetry
//!
//! Observability for the Chat Completion Gateway:
//! - Structured logging via `tracing-subscriber`
//! - Prometheus metrics
//! - Fire-and-forget audit events

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod logging;
pub mod metrics;

// Re-export main types
pub use audit::{
    AuditEvent, AuditEventBuilder, AuditEventType, AuditOutcome, AuditSink, ChannelAuditSink,
    MemoryAuditSink, NoopAuditSink,
};
pub use logging::{init_logging, LoggingConfig, TracingError};
pub use metrics::{Metrics, MetricsError};
