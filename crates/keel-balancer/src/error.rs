//! Routing error types.

use thiserror::Error;

/// Errors that can occur while routing a request to an instance.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no available instance for endpoint: {0}")]
    NoAvailableInstance(String),

    #[error("endpoint not found: {0}")]
    UnknownEndpoint(String),

    #[error("instance not found: {0}")]
    UnknownInstance(String),

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),
}

pub type RoutingResult<T> = Result<T, RoutingError>;
