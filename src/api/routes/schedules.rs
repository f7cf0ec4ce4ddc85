use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use super::api_error;
use super::state::{AppState, Tenant};
use crate::schedules::Schedule;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// GET /api/schedules
pub async fn list_schedules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Schedule>>> {
    let tenant = Tenant::from_headers(&headers)?;
    let schedules = state
        .store()
        .list_schedules(tenant.org_id)
        .map_err(|e| api_error("Failed to list schedules", e))?;
    Ok(Json(schedules))
}

/// GET /api/schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Schedule>> {
    let tenant = Tenant::from_headers(&headers)?;
    let schedule = state
        .store()
        .get_schedule(tenant.org_id, id)
        .map_err(|e| api_error("Failed to get schedule", e))?;
    Ok(Json(schedule))
}

/// POST /api/schedules
pub async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut schedule): Json<Schedule>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let tenant = Tenant::from_headers(&headers)?;
    schedule.id = 0;
    schedule.org_id = tenant.org_id;
    schedule.owner_user_id = tenant.user_id;

    let created = state
        .dispatcher
        .create_schedule(schedule)
        .await
        .map_err(|e| api_error("Failed to create schedule", e))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /api/schedules/{id}
pub async fn update_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(mut schedule): Json<Schedule>,
) -> ApiResult<Json<Schedule>> {
    let tenant = Tenant::from_headers(&headers)?;
    schedule.id = id;
    schedule.org_id = tenant.org_id;

    let updated = state
        .dispatcher
        .update_schedule(schedule)
        .await
        .map_err(|e| api_error("Failed to update schedule", e))?;
    Ok(Json(updated))
}

/// DELETE /api/schedules/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let tenant = Tenant::from_headers(&headers)?;
    state
        .dispatcher
        .delete_schedule(tenant.org_id, id)
        .await
        .map_err(|e| api_error("Failed to delete schedule", e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/schedules/{id}/run
/// Starts a run and returns without waiting for it
pub async fn run_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let tenant = Tenant::from_headers(&headers)?;
    state
        .dispatcher
        .run_now(tenant.org_id, id)
        .await
        .map_err(|e| api_error("Failed to start run", e))?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/schedules/{id}/recalculate
pub async fn recalculate_next_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Schedule>> {
    let tenant = Tenant::from_headers(&headers)?;
    let schedule = state
        .dispatcher
        .recalculate_next_run(tenant.org_id, id)
        .await
        .map_err(|e| api_error("Failed to recalculate next run", e))?;
    Ok(Json(schedule))
}
