use std::sync::{Arc, RwLock};

use log::{debug, error};

use crate::error::DashReportError;

pub const SERVICE_TOKEN_ENV: &str = "DASHREPORT_SERVICE_TOKEN";

/// A source of bearer tokens for the dashboard server
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// The current token, or None if this source has nothing to offer
    fn token(&self) -> Option<String>;
}

/// Token handed in by the live request path (the host forwards the caller's
/// token). Empty until something sets it.
#[derive(Default)]
pub struct RequestTokenProvider {
    token: RwLock<Option<String>>,
}

impl RequestTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        let token = token.filter(|t| !t.trim().is_empty());
        match self.token.write() {
            Ok(mut slot) => *slot = token,
            Err(e) => error!("Request token slot is poisoned: {}", e),
        }
    }
}

impl CredentialProvider for RequestTokenProvider {
    fn name(&self) -> &'static str {
        "request"
    }

    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|slot| slot.clone())
    }
}

/// Long-lived token for background jobs, from configuration or the
/// DASHREPORT_SERVICE_TOKEN environment variable
pub struct ServiceTokenProvider {
    token: Option<String>,
}

impl ServiceTokenProvider {
    pub fn new(configured: &str) -> Self {
        let token = Some(configured.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| {
                std::env::var(SERVICE_TOKEN_ENV)
                    .ok()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            });
        ServiceTokenProvider { token }
    }
}

impl CredentialProvider for ServiceTokenProvider {
    fn name(&self) -> &'static str {
        "service"
    }

    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Providers tried in order; the first token wins
#[derive(Clone)]
pub struct CredentialChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        CredentialChain { providers }
    }

    pub fn resolve(&self) -> Result<String, DashReportError> {
        for provider in &self.providers {
            if let Some(token) = provider.token() {
                debug!("Using bearer token from the {} provider", provider.name());
                return Ok(token);
            }
        }

        let tried: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        Err(DashReportError::NoCredentials(format!(
            "no provider returned a token (tried: {}); set [auth] service_token in config.toml or {}",
            if tried.is_empty() {
                "none".to_string()
            } else {
                tried.join(", ")
            },
            SERVICE_TOKEN_ENV
        )))
    }
}
