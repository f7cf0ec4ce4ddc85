pub mod runs;
pub mod schedules;
pub mod settings;
pub mod state;

use axum::http::StatusCode;

use crate::error::DashReportError;

/// Map a core error onto a response, logging server-side failures
pub(crate) fn api_error(context: &str, e: DashReportError) -> (StatusCode, String) {
    let status = match &e {
        DashReportError::NotFound(_) => StatusCode::NOT_FOUND,
        DashReportError::Validation(_) | DashReportError::Configuration(_) => {
            StatusCode::BAD_REQUEST
        }
        DashReportError::AlreadyRunning(_) => StatusCode::CONFLICT,
        DashReportError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
        DashReportError::ShuttingDown | DashReportError::QueueClosed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("{}: {}", context, e);
    } else {
        log::debug!("{}: {}", context, e);
    }
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            api_error("t", DashReportError::NotFound("Schedule 1".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            api_error("t", DashReportError::Busy(100)).0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            api_error("t", DashReportError::AlreadyRunning(3)).0,
            StatusCode::CONFLICT
        );
        let (status, body) = api_error("t", DashReportError::Validation("bad cron".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid input: bad cron");
    }
}
