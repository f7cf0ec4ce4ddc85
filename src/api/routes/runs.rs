use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};

use super::api_error;
use super::state::{AppState, Tenant};
use crate::mail::report_filename;
use crate::runs::Run;

/// GET /api/schedules/{id}/runs
/// Latest runs of a schedule, without artifacts
pub async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(schedule_id): Path<i64>,
) -> Result<Json<Vec<Run>>, (StatusCode, String)> {
    let tenant = Tenant::from_headers(&headers)?;
    let store = state.store();
    store
        .get_schedule(tenant.org_id, schedule_id)
        .map_err(|e| api_error("Failed to get schedule", e))?;
    let runs = store
        .list_runs(tenant.org_id, schedule_id)
        .map_err(|e| api_error("Failed to list runs", e))?;
    Ok(Json(runs))
}

/// GET /api/runs/{id}/artifact
pub async fn get_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> Result<Response, (StatusCode, String)> {
    let tenant = Tenant::from_headers(&headers)?;
    let store = state.store();
    let run = store
        .get_run(tenant.org_id, run_id)
        .map_err(|e| api_error("Failed to get run", e))?;
    let schedule = store
        .get_schedule(tenant.org_id, run.schedule_id)
        .map_err(|e| api_error("Failed to get schedule", e))?;
    // Header values must be visible ASCII
    let filename = report_filename(&schedule, run.started_at)
        .replace(|c: char| !c.is_ascii_graphic() || c == '"', "_");

    let Some(artifact) = run.artifact.filter(|a| !a.is_empty()) else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Run {} has no stored report", run_id),
        ));
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(artifact))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
