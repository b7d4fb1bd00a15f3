//! Typed failure classes for the migration engine.
//!
//! Library entry points still return `anyhow::Result`; these enums are the
//! leaf errors that callers (and tests) can downcast to when the category
//! matters: configuration and safety failures stop a run before any I/O,
//! source failures name the legacy endpoint that broke.

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("safety gate refused the run: {0}")]
    Safety(String),
    #[error("invalid export payload {path}: {reason}")]
    Payload { path: String, reason: String },
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
    #[error("{endpoint} returned malformed JSON: {reason}")]
    Malformed { endpoint: String, reason: String },
    #[error("{endpoint} rejected the request: {message}")]
    Rejected { endpoint: String, message: String },
    #[error("{endpoint} request failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("login succeeded but the response carried no token")]
    MissingToken,
}

impl SourceError {
    /// HTTP status for non-2xx responses, `None` for every other failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            SourceError::Http { endpoint, .. }
            | SourceError::Timeout { endpoint, .. }
            | SourceError::Malformed { endpoint, .. }
            | SourceError::Rejected { endpoint, .. }
            | SourceError::Transport { endpoint, .. } => Some(endpoint),
            SourceError::MissingToken => None,
        }
    }
}

/// Shorthand used by config builders.
pub fn config_err(msg: impl Into<String>) -> anyhow::Error {
    MigrateError::Config(msg.into()).into()
}
