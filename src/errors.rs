use thiserror::Error;

/// Typed error hierarchy for conductor.
///
/// Use at module boundaries (gateway handlers, command dispatch, runner tool
/// operations). Internal/leaf functions can continue using `anyhow::Result` —
/// the `Internal` variant allows seamless conversion via the `?` operator.
///
/// Scheduler-internal failure classes (resource-limit breaches, idle
/// timeouts, sub-agent exceptions, sandbox disposal errors) deliberately do
/// NOT appear here: they terminate the affected task with a descriptive
/// `error` field, or are logged and swallowed, and are never surfaced as an
/// `Err` to callers.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ConductorError.
pub type ConductorResult<T> = std::result::Result<T, ConductorError>;

impl ConductorError {
    /// HTTP status code this error maps to at the gateway boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ConductorError::Validation(_) | ConductorError::State(_) => 400,
            ConductorError::Auth(_) => 401,
            ConductorError::NotFound(_) => 404,
            ConductorError::Internal(_) => 500,
        }
    }
}
