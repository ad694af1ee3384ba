//! keel-metrics — observability for Keel endpoints.
//!
//! Aggregates instance health, request counters, deployment outcomes, and
//! circuit breaker state into a [`FleetMetrics`] snapshot, and renders it
//! in Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── refresh() ← called once per reconciliation tick
//!   └── snapshot() → last FleetMetrics
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{EndpointMetrics, FleetMetrics, MetricsCollector};
pub use prometheus::render_prometheus;
