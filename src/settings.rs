use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::DashReportError;
use crate::timestamps;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub use_tls: bool,
    pub skip_tls_verify: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            use_tls: true,
            skip_tls_verify: false,
        }
    }
}

impl SmtpConfig {
    /// A host is the minimum needed to attempt delivery
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Rendering backend name; "http" is the built-in one
    pub backend: String,
    /// Dashboard server base URL, may include a subpath
    #[serde(alias = "grafana_url")]
    pub base_url: String,
    pub timeout_ms: u64,
    /// Settle time the render service waits after load
    pub delay_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f64,
    pub skip_tls_verify: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub browser_path: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            backend: "http".to_string(),
            base_url: String::new(),
            timeout_ms: 60_000,
            delay_ms: 5_000,
            viewport_width: 1920,
            viewport_height: 1080,
            device_scale_factor: 2.0,
            skip_tls_verify: true,
            browser_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_recipients: usize,
    pub max_attachment_size_mb: u64,
    pub max_concurrent_renders: usize,
    /// Days of run history to keep; 0 keeps everything
    pub retention_days: u32,
    /// Empty allows every domain. Entries are exact domains or "*.domain".
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_recipients: 50,
            max_attachment_size_mb: 25,
            max_concurrent_renders: 5,
            retention_days: 30,
            allowed_domains: Vec::new(),
        }
    }
}

impl Limits {
    pub fn max_attachment_bytes(&self) -> u64 {
        self.max_attachment_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Per-tenant configuration, one row per org
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub smtp_config: Option<SmtpConfig>,
    #[serde(default)]
    pub renderer_config: RendererConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Settings {
    pub fn defaults(org_id: i64) -> Self {
        Settings {
            id: 0,
            org_id,
            smtp_config: None,
            renderer_config: RendererConfig::default(),
            limits: Limits::default(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    /// SMTP settings, if delivery is possible at all
    pub fn smtp(&self) -> Option<&SmtpConfig> {
        self.smtp_config.as_ref().filter(|smtp| smtp.is_configured())
    }

    /// Fill in an empty SMTP block so editors start from port 587 with TLS
    pub fn with_display_defaults(mut self) -> Self {
        if self.smtp_config.is_none() {
            self.smtp_config = Some(SmtpConfig::default());
        }
        self
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        fn json<T: serde::de::DeserializeOwned>(
            idx: usize,
            text: &str,
        ) -> Result<T, rusqlite::Error> {
            serde_json::from_str(text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        }

        let smtp_config = match row.get::<_, Option<String>>(2)? {
            Some(text) if !text.trim().is_empty() && text.trim() != "null" => {
                Some(json::<SmtpConfig>(2, &text)?)
            }
            _ => None,
        };
        let renderer_config: String = row.get(3)?;
        let limits: String = row.get(4)?;

        Ok(Settings {
            id: row.get(0)?,
            org_id: row.get(1)?,
            smtp_config,
            renderer_config: json(3, &renderer_config)?,
            limits: json(4, &limits)?,
            created_at: timestamps::opt_from_db(row.get(5)?).unwrap_or_default(),
            updated_at: timestamps::opt_from_db(row.get(6)?).unwrap_or_default(),
        })
    }

    // ========================================
    // Database operations
    // ========================================

    pub fn get(conn: &Connection, org_id: i64) -> Result<Option<Self>, DashReportError> {
        conn.query_row(
            "SELECT id, org_id, smtp_config, renderer_config, limits, created_at, updated_at
             FROM settings WHERE org_id = ?",
            [org_id],
            Self::from_row,
        )
        .optional()
        .map_err(DashReportError::DatabaseError)
    }

    /// Insert the tenant's row or replace its contents
    pub fn upsert(conn: &Connection, settings: &Settings) -> Result<Self, DashReportError> {
        let now = timestamps::to_db(&Utc::now());
        let smtp_config = settings
            .smtp_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO settings (org_id, smtp_config, renderer_config, limits, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id) DO UPDATE SET
                smtp_config = excluded.smtp_config,
                renderer_config = excluded.renderer_config,
                limits = excluded.limits,
                updated_at = excluded.updated_at",
            params![
                settings.org_id,
                smtp_config,
                serde_json::to_string(&settings.renderer_config)?,
                serde_json::to_string(&settings.limits)?,
                now,
                now,
            ],
        )?;

        Self::get(conn, settings.org_id)?
            .ok_or_else(|| DashReportError::NotFound(format!("Settings for org {}", settings.org_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::defaults(7);
        assert_eq!(settings.renderer_config.timeout_ms, 60_000);
        assert_eq!(settings.renderer_config.viewport_width, 1920);
        assert!(settings.renderer_config.skip_tls_verify);
        assert_eq!(settings.limits.max_recipients, 50);
        assert_eq!(settings.limits.max_attachment_bytes(), 25 * 1024 * 1024);
        assert!(settings.smtp().is_none());

        let display = settings.with_display_defaults();
        let smtp = display.smtp_config.unwrap();
        assert_eq!((smtp.port, smtp.use_tls), (587, true));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"renderer_config":{"grafana_url":"https://grafana.local/sub"},"limits":{"retention_days":7}}"#,
        )
        .unwrap();
        assert_eq!(settings.renderer_config.base_url, "https://grafana.local/sub");
        assert_eq!(settings.renderer_config.delay_ms, 5_000);
        assert_eq!(settings.limits.retention_days, 7);
        assert_eq!(settings.limits.max_recipients, 50);
    }

    #[test]
    fn test_upsert_inserts_then_updates_one_row() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("settings.db")).unwrap();
        let conn = db.get_connection().unwrap();

        assert_eq!(Settings::get(&conn, 3).unwrap(), None);

        let mut settings = Settings::defaults(3);
        let first = Settings::upsert(&conn, &settings).unwrap();

        settings.smtp_config = Some(SmtpConfig {
            host: "smtp.example.com".into(),
            from: "reports@example.com".into(),
            ..SmtpConfig::default()
        });
        settings.limits.allowed_domains = vec!["*.example.com".into()];
        let second = Settings::upsert(&conn, &settings).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.limits.allowed_domains, vec!["*.example.com".to_string()]);
        assert_eq!(
            second.smtp().map(|s| s.host.as_str()),
            Some("smtp.example.com")
        );

        let count: i64 = conn
            .query_row("SELECT count(*) FROM settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
