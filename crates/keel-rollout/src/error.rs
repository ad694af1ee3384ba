//! Orchestrator error types.

use thiserror::Error;

/// Errors raised while starting or executing a deployment.
///
/// Once a deployment task is running, an error ends only that deployment:
/// it is recorded on the `DeploymentStatus` as `failed` with the message.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("endpoint not found: {0}")]
    UnknownEndpoint(String),

    #[error("deployment not found: {0}")]
    UnknownDeployment(String),

    #[error(transparent)]
    UnknownStrategy(#[from] keel_state::UnknownStrategy),

    #[error("endpoint {endpoint} already has deployment {deployment} in progress")]
    AlreadyDeploying { endpoint: String, deployment: String },

    #[error("timed out after {secs}s waiting for {pending} instance(s) to become healthy")]
    Timeout { secs: u64, pending: usize },

    #[error("instance {0} was removed during the deployment")]
    InstanceFailed(String),

    #[error("removing {instance} would leave {healthy} healthy instance(s), below the minimum of {min}")]
    BelowMinimum { instance: String, healthy: usize, min: u32 },

    #[error("canary degraded at {percent}%: {reason}")]
    CanaryDegraded { percent: u8, reason: String },

    #[error("deployment cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
