//! Error taxonomy shared across the core.
//!
//! Tool-level failures (validation, permissions, stale files) surface as
//! error tool results inside the conversation and never abort a run;
//! provider and store failures end the run with an `error` finish reason.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuillError {
    /// Bad tool input; the loop continues with an error tool result.
    #[error("{0}")]
    Validation(String),

    #[error("permission denied")]
    PermissionDenied,

    /// Target file changed on disk after the recorded read.
    #[error("{0}")]
    StaleFile(String),

    /// Mutation attempted on a path never read in this process.
    #[error("{0}")]
    UnreadFile(String),

    /// Rate limit or overload; retried by the provider adapter.
    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    /// Retries exhausted or a non-retryable provider failure.
    #[error("provider error: {0}")]
    ProviderFatal(String),

    #[error("canceled")]
    Canceled,

    /// A second run was requested while one is still active (or unwinding).
    #[error("session {0} already has an active run")]
    SessionBusy(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QuillError {
    /// Whether this failure stays inside the conversation as a tool result.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            QuillError::Validation(_)
                | QuillError::PermissionDenied
                | QuillError::StaleFile(_)
                | QuillError::UnreadFile(_)
        )
    }
}

impl From<rusqlite::Error> for QuillError {
    fn from(err: rusqlite::Error) -> Self {
        QuillError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for QuillError {
    fn from(err: serde_json::Error) -> Self {
        QuillError::Internal(err.to_string())
    }
}
