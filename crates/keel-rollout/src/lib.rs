//! keel-rollout — deployment orchestration for Keel.
//!
//! Each call to [`Orchestrator::deploy_service`] creates a
//! [`DeploymentStatus`](keel_state::DeploymentStatus) and runs the chosen
//! strategy as its own task:
//!
//! ```text
//! planning ──► deploying ──► completed
//!                  │
//!                  └───────► failed   (timeout, degraded canary, cancel)
//! ```
//!
//! # Components
//!
//! - **`strategy`** — per-strategy parameters (`BlueGreenConfig`, `RollingConfig`, `CanaryConfig`)
//! - **`orchestrator`** — control operations: create instances, start, wait on, and cancel deployments
//! - **`executor`** — blue-green, rolling, and canary state machines
//!
//! Failed deployments are not rolled back. Whatever the strategy created
//! before failing stays in the registry.

mod executor;
pub mod error;
pub mod orchestrator;
pub mod strategy;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{EndpointStatus, InstanceSummary, Orchestrator};
pub use strategy::{BlueGreenConfig, CanaryConfig, DeployConfig, RollingConfig};
