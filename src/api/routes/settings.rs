use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use super::api_error;
use super::state::{AppState, Tenant};
use crate::settings::Settings;

/// GET /api/settings
/// Tenant settings, created with defaults on first access
pub async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Settings>, (StatusCode, String)> {
    let tenant = Tenant::from_headers(&headers)?;
    let settings = state
        .store()
        .get_or_create_settings(tenant.org_id)
        .await
        .map_err(|e| api_error("Failed to load settings", e))?;
    Ok(Json(settings.with_display_defaults()))
}

/// POST /api/settings
/// Saves settings and drops the tenant's cached settings and renderer
pub async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut settings): Json<Settings>,
) -> Result<Json<Settings>, (StatusCode, String)> {
    let tenant = Tenant::from_headers(&headers)?;
    settings.org_id = tenant.org_id;
    let saved = state
        .dispatcher
        .update_settings(settings)
        .await
        .map_err(|e| api_error("Failed to save settings", e))?;
    Ok(Json(saved))
}

/// POST /api/cache/clear
pub async fn clear_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let tenant = Tenant::from_headers(&headers)?;
    state.dispatcher.clear_tenant_cache(tenant.org_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: Option<String>,
}

/// POST /api/token
/// The host hands over the token of the live request; null clears it
pub async fn set_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> StatusCode {
    state.request_tokens.set(request.token);
    StatusCode::NO_CONTENT
}
