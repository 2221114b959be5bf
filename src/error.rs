use chrono::{DateTime, Utc};
use thiserror::Error;

/// Every way a submission can fail. Address lookup never appears here: it
/// degrades to `"unknown"` instead of erroring.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Rate limited. Please try again later.")]
    RateLimited { blocked_until: DateTime<Utc> },

    // message is the server's `error` field or "HTTP <status>: Verification failed"
    #[error("{message}")]
    SubmissionFailed { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SubmitError {
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            SubmitError::RateLimited { blocked_until } => Some(*blocked_until),
            _ => None,
        }
    }
}
