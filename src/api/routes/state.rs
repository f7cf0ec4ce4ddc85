use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};

use crate::dispatcher::Dispatcher;
use crate::render::RequestTokenProvider;
use crate::store::Store;

pub const ORG_HEADER: &str = "x-org-id";
pub const USER_HEADER: &str = "x-user-id";
const DEFAULT_ORG_ID: i64 = 1;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub request_tokens: Arc<RequestTokenProvider>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, request_tokens: Arc<RequestTokenProvider>) -> Self {
        Self {
            dispatcher,
            request_tokens,
        }
    }

    pub fn store(&self) -> &Store {
        self.dispatcher.store()
    }
}

/// Caller identity forwarded by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenant {
    pub org_id: i64,
    pub user_id: i64,
}

impl Tenant {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, (StatusCode, String)> {
        Ok(Tenant {
            org_id: header_id(headers, ORG_HEADER)?.unwrap_or(DEFAULT_ORG_ID),
            user_id: header_id(headers, USER_HEADER)?.unwrap_or(0),
        })
    }
}

fn header_id(headers: &HeaderMap, name: &str) -> Result<Option<i64>, (StatusCode, String)> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .map(Some)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("{} must be a positive integer", name),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_tenant_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            Tenant::from_headers(&headers).unwrap(),
            Tenant {
                org_id: 1,
                user_id: 0
            }
        );

        headers.insert(ORG_HEADER, HeaderValue::from_static("42"));
        headers.insert(USER_HEADER, HeaderValue::from_static("7"));
        assert_eq!(
            Tenant::from_headers(&headers).unwrap(),
            Tenant {
                org_id: 42,
                user_id: 7
            }
        );

        headers.insert(ORG_HEADER, HeaderValue::from_static("acme"));
        assert_eq!(
            Tenant::from_headers(&headers).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }
}
