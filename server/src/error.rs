use derive_more::derive::Display;
use reqwest::StatusCode;

use crate::model::cancellation_action::CancellationStatus;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Display)]
pub enum AppError {
    #[display("Not found: {_0}")]
    NotFound(String),
    #[display("Bad request: {_0}")]
    BadRequest(String),
    #[display("Conflict: {_0}")]
    Conflict(String),
    /// Credential invalid, expired or revoked
    #[display("Authentication failed: {_0}")]
    Auth(String),
    #[display("Upstream fetch failed: {_0}")]
    UpstreamFetch(String),
    #[display("Rate limit exceeded: {_0}")]
    RateLimit(String),
    #[display("Generative provider error: {_0}")]
    Provider(String),
    /// Untrusted structured output did not match the expected shape
    #[display("Schema error: {_0}")]
    Schema(String),
    #[display("Automation error: {_0}")]
    Automation(String),
    #[display("Repository error: {_0}")]
    Repository(String),
    #[display("Timed out: {_0}")]
    Timeout(String),
    #[display("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: CancellationStatus,
        to: CancellationStatus,
    },
    #[display("Internal error: {_0}")]
    Internal(anyhow::Error),
}

impl std::error::Error for AppError {}

impl AppError {
    /// Errors the job queue may redeliver; everything else is final for the job
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Repository(_)
                | AppError::Timeout(_)
                | AppError::RateLimit(_)
                | AppError::UpstreamFetch(_)
        )
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(error)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        tracing::error!("Reqwest error: {:?}", error);
        if error.is_timeout() {
            return AppError::Timeout(error.to_string());
        }
        match error.status() {
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                AppError::Auth(error.to_string())
            }
            Some(StatusCode::BAD_REQUEST) => AppError::BadRequest(error.to_string()),
            Some(StatusCode::REQUEST_TIMEOUT) => AppError::Timeout(error.to_string()),
            Some(StatusCode::TOO_MANY_REQUESTS) => AppError::RateLimit(error.to_string()),
            _ => AppError::Internal(error.into()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Schema(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = AppError::InvalidTransition {
            from: CancellationStatus::Confirmed,
            to: CancellationStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: confirmed -> in_progress"
        );
        assert_eq!(
            AppError::Auth("Token has been expired or revoked.".to_string()).to_string(),
            "Authentication failed: Token has been expired or revoked."
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Repository("down".to_string()).is_retryable());
        assert!(AppError::Timeout("slow".to_string()).is_retryable());
        assert!(!AppError::Auth("revoked".to_string()).is_retryable());
        assert!(!AppError::Schema("bad".to_string()).is_retryable());
    }
}
