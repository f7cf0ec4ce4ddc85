mod credentials;
mod dashboard_url;
mod http;
mod inspect;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DashReportError;
use crate::schedules::Schedule;
use crate::settings::Settings;

pub use credentials::{
    CredentialChain, CredentialProvider, RequestTokenProvider, ServiceTokenProvider,
};
pub use http::HttpRenderer;
pub use inspect::inspect_pdf;

#[cfg(test)]
pub use credentials::SERVICE_TOKEN_ENV;
#[cfg(test)]
pub use inspect::test_pdf;

/// Turns a schedule into PDF bytes.
///
/// Instances are expensive to build and are reused across runs of the same
/// tenant until its settings change.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Raw output of the backend, not yet checked with `inspect_pdf`
    async fn render_dashboard(
        &self,
        schedule: &Schedule,
        credentials: &CredentialChain,
    ) -> Result<Vec<u8>, DashReportError>;

    /// Release the session. Safe to call more than once.
    async fn close(&self) -> Result<(), DashReportError>;

    fn name(&self) -> &str;
}

/// Builds a backend from a tenant's settings
pub trait RendererFactory: Send + Sync {
    fn create(&self, settings: &Settings) -> Result<Arc<dyn RenderBackend>, DashReportError>;
}

/// Factory for the built-in backends
pub struct DefaultRendererFactory {
    render_service_url: String,
    default_base_url: String,
}

impl DefaultRendererFactory {
    pub fn new(render_service_url: &str, default_base_url: &str) -> Self {
        DefaultRendererFactory {
            render_service_url: render_service_url.to_string(),
            default_base_url: default_base_url.to_string(),
        }
    }
}

impl RendererFactory for DefaultRendererFactory {
    fn create(&self, settings: &Settings) -> Result<Arc<dyn RenderBackend>, DashReportError> {
        let config = &settings.renderer_config;
        let base_url = if config.base_url.trim().is_empty() {
            self.default_base_url.as_str()
        } else {
            config.base_url.as_str()
        };

        match config.backend.trim() {
            "" | "http" => Ok(Arc::new(HttpRenderer::new(
                &self.render_service_url,
                base_url,
                config,
            )?)),
            other => Err(DashReportError::Configuration(format!(
                "unsupported renderer backend '{}' for org {}",
                other, settings.org_id
            ))),
        }
    }
}
