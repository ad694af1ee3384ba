//! keel-health — health checking for Keel instances.
//!
//! Provides HTTP health probes, a bounded per-instance probe history, and
//! the rolling health score the rest of Keel routes and scales on.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── Arc<dyn Probe> (HttpProbe in production)
//!   ├── history: instance_id → ring buffer (cap 100)
//!   └── assess() → Assessment { outcome, score, status }
//!                    └── apply() onto ServiceInstance by the caller
//!
//! probe_instances() fans assess() out over a JoinSet and writes results
//! back through the Registry.
//! ```
//!
//! # Scoring
//!
//! `score = healthy / window` over the 20 most recent probes. With no
//! history the score is 0.5, a neutral prior.

pub mod checker;
pub mod probe;
pub mod sweep;

pub use checker::{Assessment, HealthCheckConfig, HealthChecker, HealthRecord};
pub use probe::{HttpProbe, Probe, ProbeFuture, ProbeOutcome, http_probe};
pub use sweep::probe_instances;
