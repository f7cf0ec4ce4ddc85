use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::api;
use crate::api::state::AppState;
use crate::error::DashReportError;

pub struct WebServer {
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Serve until SIGINT/SIGTERM, then stop the dispatcher and drain the
    /// write queue
    pub async fn start(&self, state: AppState) -> Result<(), DashReportError> {
        let app = Self::create_router(state.clone());

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| DashReportError::Error(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DashReportError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("dashReport server listening on http://{}", addr);
        log::info!("Server ready to handle requests on {}", addr);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                log::info!("Shutdown signal received, stopping server");
                println!("\nShutdown signal received - stopping server gracefully...");
            })
            .await
            .map_err(|e| DashReportError::Error(format!("Server error: {}", e)));

        state.dispatcher.stop().await;
        state.dispatcher.store().close().await;
        log::info!("Server shutdown complete");
        println!("   Server stopped");

        served
    }

    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            // Schedules
            .route(
                "/api/schedules",
                get(api::schedules::list_schedules).post(api::schedules::create_schedule),
            )
            .route(
                "/api/schedules/{id}",
                get(api::schedules::get_schedule)
                    .put(api::schedules::update_schedule)
                    .delete(api::schedules::delete_schedule),
            )
            .route("/api/schedules/{id}/run", post(api::schedules::run_schedule))
            .route(
                "/api/schedules/{id}/recalculate",
                post(api::schedules::recalculate_next_run),
            )
            // Runs
            .route("/api/schedules/{id}/runs", get(api::runs::list_runs))
            .route("/api/runs/{id}/artifact", get(api::runs::get_artifact))
            // Settings and caches
            .route(
                "/api/settings",
                get(api::settings::get_settings).post(api::settings::update_settings),
            )
            .route("/api/cache/clear", post(api::settings::clear_cache))
            .route("/api/token", post(api::settings::set_token))
            .with_state(state)
    }
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs_in_flight": state.dispatcher.in_flight(),
    }))
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::{Client, StatusCode};
    use tempfile::TempDir;

    use super::*;
    use crate::database::Database;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::mail::SmtpMailer;
    use crate::render::{
        CredentialChain, CredentialProvider, RequestTokenProvider, ServiceTokenProvider,
    };
    use crate::runs::{Run, RunStatus};
    use crate::schedules::{test_schedule, Schedule};
    use crate::store::Store;
    use crate::tenant_cache::test_support::StubFactory;
    use crate::tenant_cache::TenantCache;

    async fn serve() -> (TempDir, String, AppState) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("server.db")).unwrap();
        let store = Arc::new(Store::new(db, 16));
        let cache = Arc::new(TenantCache::new(
            store.clone(),
            Arc::new(StubFactory::default()),
        ));
        let request_tokens = Arc::new(RequestTokenProvider::new());
        let providers: Vec<Arc<dyn CredentialProvider>> = vec![
            request_tokens.clone(),
            Arc::new(ServiceTokenProvider::new("")),
        ];
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            cache,
            Arc::new(SmtpMailer::new()),
            CredentialChain::new(providers),
            DispatcherConfig {
                tick: Duration::from_secs(60),
                max_concurrent: 2,
                max_attempts: 1,
                max_pending: 10,
                backoff_base: Duration::ZERO,
            },
        ));
        let state = AppState::new(dispatcher, request_tokens);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = WebServer::create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (dir, format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_schedule_run_and_download() {
        let (_dir, base, state) = serve().await;
        let client = Client::new();

        let settings: Value = client
            .get(format!("{}/api/settings", base))
            .header("X-Org-Id", "3")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(settings["org_id"], 3);
        assert_eq!(settings["smtp_config"]["port"], 587);

        let response = client
            .post(format!("{}/api/token", base))
            .json(&json!({ "token": "glsa_request" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client
            .post(format!("{}/api/schedules", base))
            .header("X-Org-Id", "3")
            .header("X-User-Id", "12")
            .json(&test_schedule(99, "Nightly"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Schedule = response.json().await.unwrap();
        assert_eq!((created.org_id, created.owner_user_id), (3, 12));
        assert!(created.next_run_at.is_some());

        // Other tenants cannot see it
        let response = client
            .get(format!("{}/api/schedules/{}", base, created.id))
            .header("X-Org-Id", "4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client
            .post(format!("{}/api/schedules/{}/run", base, created.id))
            .header("X-Org-Id", "3")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut finished: Option<Run> = None;
        for _ in 0..100 {
            let runs: Vec<Run> = client
                .get(format!("{}/api/schedules/{}/runs", base, created.id))
                .header("X-Org-Id", "3")
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if let Some(run) = runs.into_iter().find(|r| r.status != RunStatus::Running) {
                finished = Some(run);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let run = finished.expect("run did not finish");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.email_error.as_deref(), Some("SMTP not configured"));

        let response = client
            .get(format!("{}/api/runs/{}/artifact", base, run.id))
            .header("X-Org-Id", "3")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/pdf"
        );
        assert_eq!(
            response.headers()["content-disposition"].to_str().unwrap(),
            format!(
                "attachment; filename=\"Nightly-{}.pdf\"",
                run.started_at.format("%Y-%m-%d-%H%M%S")
            )
        );
        assert!(response.bytes().await.unwrap().starts_with(b"%PDF-"));

        let response = client
            .delete(format!("{}/api/schedules/{}", base, created.id))
            .header("X-Org-Id", "3")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        state.dispatcher.store().close().await;
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_rejected() {
        let (_dir, base, state) = serve().await;
        let mut schedule = test_schedule(1, "Bad cron");
        schedule.cron_expr = "every tuesday".into();

        let response = Client::new()
            .post(format!("{}/api/schedules", base))
            .json(&schedule)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.text().await.unwrap().starts_with("Invalid input"));

        state.dispatcher.store().close().await;
    }
}
