use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DashReportError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Tenant or process configuration is missing or unusable. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No credential provider produced a bearer token. Never retried.
    #[error("No credentials available: {0}")]
    NoCredentials(String),

    /// Transient rendering failure (timeout, navigation, transport)
    #[error("Render error: {0}")]
    Render(String),

    /// The renderer produced the login screen instead of the dashboard
    #[error("Rendered output is an authentication page: {0}")]
    AuthenticationPage(String),

    #[error("Email delivery error: {0}")]
    Delivery(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The write queue was shut down before the operation completed
    #[error("Write queue closed")]
    QueueClosed,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Too many pending report jobs ({0}); try again later")]
    Busy(usize),

    #[error("Schedule {0} already has a run in progress")]
    AlreadyRunning(i64),

    #[error("Error: {0}")]
    Error(String),
}

impl DashReportError {
    /// Whether another attempt of the same job could plausibly succeed.
    ///
    /// Authentication pages are retryable because the token source may have
    /// rotated the token between attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            DashReportError::Render(_)
            | DashReportError::AuthenticationPage(_)
            | DashReportError::IoError(_)
            | DashReportError::DatabaseError(_)
            | DashReportError::PoolError(_) => true,
            DashReportError::Configuration(_)
            | DashReportError::NoCredentials(_)
            | DashReportError::Delivery(_)
            | DashReportError::Validation(_)
            | DashReportError::NotFound(_)
            | DashReportError::QueueClosed
            | DashReportError::ShuttingDown
            | DashReportError::Busy(_)
            | DashReportError::AlreadyRunning(_)
            | DashReportError::JsonError(_)
            | DashReportError::Error(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DashReportError::Render("timeout".into()).is_retryable());
        assert!(DashReportError::AuthenticationPage("login".into()).is_retryable());
        assert!(!DashReportError::Configuration("no settings".into()).is_retryable());
        assert!(!DashReportError::NoCredentials("empty".into()).is_retryable());
        assert!(!DashReportError::QueueClosed.is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = DashReportError::NotFound("Schedule 7".into());
        assert_eq!(err.to_string(), "Schedule 7 not found");
    }
}
