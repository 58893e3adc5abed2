//! API layer
//!
//! HTTP handlers for:
//! - Discovery (host-meta, WebFinger) and dialback verification
//! - Metrics (Prometheus)

mod metrics;
mod wellknown;

pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
