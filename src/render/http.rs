use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, Level};
use logging_timer::timer;
use reqwest::{header, Client, StatusCode};
use url::Url;

use super::credentials::CredentialChain;
use super::dashboard_url::build_dashboard_url;
use super::RenderBackend;
use crate::error::DashReportError;
use crate::schedules::Schedule;
use crate::settings::RendererConfig;

// Headroom on top of the render timeout for transfer of the finished PDF
const TRANSFER_MARGIN: Duration = Duration::from_secs(10);

/// Renders through an external render service that loads the dashboard
/// in a headless browser and answers with PDF bytes.
pub struct HttpRenderer {
    client: Client,
    render_endpoint: Url,
    base_url: String,
    config: RendererConfig,
    closed: AtomicBool,
}

impl HttpRenderer {
    pub fn new(
        render_service_url: &str,
        base_url: &str,
        config: &RendererConfig,
    ) -> Result<Self, DashReportError> {
        let mut service = Url::parse(render_service_url.trim()).map_err(|e| {
            DashReportError::Configuration(format!(
                "invalid render service URL '{}': {}",
                render_service_url, e
            ))
        })?;
        // Keep any subpath the service is mounted under
        if !service.path().ends_with('/') {
            let path = format!("{}/", service.path());
            service.set_path(&path);
        }
        let render_endpoint = service.join("render").map_err(|e| {
            DashReportError::Configuration(format!("invalid render service URL: {}", e))
        })?;

        let timeout =
            Duration::from_millis(config.timeout_ms + config.delay_ms) + TRANSFER_MARGIN;
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|e| {
                DashReportError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(HttpRenderer {
            client,
            render_endpoint,
            base_url: base_url.to_string(),
            config: config.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn render_request(&self, dashboard: &Url) -> Url {
        let mut request = self.render_endpoint.clone();
        request
            .query_pairs_mut()
            .append_pair("url", dashboard.as_str())
            .append_pair("encoding", "pdf")
            .append_pair("width", &self.config.viewport_width.to_string())
            .append_pair("height", &self.config.viewport_height.to_string())
            .append_pair(
                "deviceScaleFactor",
                &self.config.device_scale_factor.to_string(),
            )
            .append_pair("timeout", &(self.config.timeout_ms / 1000).max(1).to_string())
            .append_pair("delay", &self.config.delay_ms.to_string());
        request
    }
}

#[async_trait]
impl RenderBackend for HttpRenderer {
    async fn render_dashboard(
        &self,
        schedule: &Schedule,
        credentials: &CredentialChain,
    ) -> Result<Vec<u8>, DashReportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DashReportError::Render("renderer has been closed".to_string()));
        }

        let _tmr = timer!(Level::Debug; "HttpRenderer::render_dashboard", "{}", schedule.id);

        let token = credentials.resolve()?;
        let dashboard = build_dashboard_url(&self.base_url, schedule)?;
        debug!("Rendering schedule {} from {}", schedule.id, dashboard);

        let response = self
            .client
            .get(self.render_request(&dashboard))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DashReportError::Render(format!(
                        "render timed out after {} ms",
                        self.config.timeout_ms
                    ))
                } else {
                    DashReportError::Render(format!("render request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DashReportError::AuthenticationPage(format!(
                "render service answered {}",
                status
            )));
        }
        if response.url().path().contains("/login") {
            return Err(DashReportError::AuthenticationPage(
                "render request was redirected to the login page".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(DashReportError::Render(format!(
                "render service answered {}: {}",
                status,
                snippet.trim()
            )));
        }

        let is_html = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        if is_html {
            return Err(DashReportError::AuthenticationPage(
                "render service returned an HTML page".to_string(),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DashReportError::Render(format!("failed to read render output: {}", e)))?
            .to_vec();

        debug!("Schedule {} rendered to {} bytes", schedule.id, bytes.len());
        Ok(bytes)
    }

    async fn close(&self) -> Result<(), DashReportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closed renderer for {}", self.base_url);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}
