use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "DASHREPORT_";

const ENV_KEYS: [&str; 11] = [
    "server.host",
    "server.port",
    "database.path",
    "scheduler.tick_seconds",
    "scheduler.max_concurrent",
    "scheduler.max_attempts",
    "scheduler.max_pending",
    "scheduler.queue_capacity",
    "renderer.default_base_url",
    "renderer.render_service_url",
    "auth.service_token",
];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub dashreport: String,
    pub lopdf: String,
    pub lettre: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DASHREPORT_LEVEL: &str = "info";
    const LOPDF_LEVEL: &str = "error";
    const LETTRE_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            dashreport: Self::DASHREPORT_LEVEL.to_string(),
            lopdf: Self::LOPDF_LEVEL.to_string(),
            lettre: Self::LETTRE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level(&mut self.dashreport, "dashreport", Self::DASHREPORT_LEVEL);
        Self::ensure_level(&mut self.lopdf, "lopdf", Self::LOPDF_LEVEL);
        Self::ensure_level(&mut self.lettre, "lettre", Self::LETTRE_LEVEL);
    }

    fn ensure_level(level: &mut String, name: &str, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, original, default
            );
            *level = default.to_owned();
        }
    }

    /// Log specification understood by flexi_logger
    pub fn log_spec(&self) -> String {
        format!(
            "{}, lopdf={}, lettre={}",
            self.dashreport, self.lopdf, self.lettre
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Path to the SQLite file. Empty means "dashreport.db" in the data directory.
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub max_pending: usize,
    pub queue_capacity: usize,
}

impl SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_seconds: 60,
            max_concurrent: 5,
            max_attempts: 3,
            max_pending: 100,
            queue_capacity: 100,
        }
    }

    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        if self.tick_seconds == 0 {
            eprintln!(
                "Config error: scheduler.tick_seconds must be positive - using default of {}",
                defaults.tick_seconds
            );
            self.tick_seconds = defaults.tick_seconds;
        }
        if self.max_concurrent == 0 {
            eprintln!(
                "Config error: scheduler.max_concurrent must be positive - using default of {}",
                defaults.max_concurrent
            );
            self.max_concurrent = defaults.max_concurrent;
        }
        if self.max_attempts == 0 {
            eprintln!(
                "Config error: scheduler.max_attempts must be positive - using default of {}",
                defaults.max_attempts
            );
            self.max_attempts = defaults.max_attempts;
        }
        if self.queue_capacity == 0 {
            eprintln!(
                "Config error: scheduler.queue_capacity must be positive - using default of {}",
                defaults.queue_capacity
            );
            self.queue_capacity = defaults.queue_capacity;
        }
        if self.max_pending < self.max_concurrent {
            eprintln!(
                "Config error: scheduler.max_pending ({}) is below max_concurrent - using {}",
                self.max_pending, self.max_concurrent
            );
            self.max_pending = self.max_concurrent;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RendererDefaults {
    /// Dashboard base URL used when a tenant's settings leave it empty
    pub default_base_url: String,
    /// Remote render service used by the "http" backend
    pub render_service_url: String,
}

impl RendererDefaults {
    fn default() -> Self {
        RendererDefaults {
            default_base_url: "http://localhost:3000".to_string(),
            render_service_url: "http://localhost:8081".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AuthConfig {
    /// Background service token. Empty falls back to DASHREPORT_SERVICE_TOKEN.
    pub service_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub renderer: RendererDefaults,
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig {
                path: String::new(),
            },
            scheduler: SchedulerConfig::default(),
            renderer: RendererDefaults::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn get_config_path(project_dirs: &ProjectDirs) -> PathBuf {
        project_dirs.data_local_dir().join("config.toml")
    }

    /// Loads the configuration from config.toml in the app's data directory,
    /// with DASHREPORT_* environment variables layered on top.
    /// If the file is missing it is written with defaults. Parse failures fall
    /// back to defaults.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = Self::get_config_path(project_dirs);
        let default_config = Config::default();

        if !config_path.exists() {
            Self::write_default(&config_path, &default_config);
        }

        let mut config = Self::extract(
            Figment::from(Serialized::defaults(default_config.clone()))
                .merge(Toml::file(&config_path))
                .merge(Self::env_provider()),
        )
        .unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        if config.database.path.is_empty() {
            config.database.path = project_dirs
                .data_local_dir()
                .join("dashreport.db")
                .to_string_lossy()
                .into_owned();
        }

        config.ensure_valid();
        config
    }

    /// DASHREPORT_<SECTION>_<FIELD>. Only the section is split off, so field
    /// names keep their underscores.
    fn env_provider() -> Env {
        Env::prefixed(ENV_PREFIX)
            .map(|key| match key.as_str().split_once('_') {
                Some((section, field)) => {
                    format!("{}.{}", section, field).to_ascii_lowercase().into()
                }
                None => key.as_str().to_ascii_lowercase().into(),
            })
            .only(&ENV_KEYS)
    }

    fn extract(figment: Figment) -> Result<Config, figment::Error> {
        figment.extract()
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.scheduler.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load_from(jail_toml: &str) -> Config {
        let mut config = Config::extract(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::string(jail_toml))
                .merge(Config::env_provider()),
        )
        .unwrap();
        config.ensure_valid();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.tick_seconds, 60);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.logging.log_spec(), "info, lopdf=error, lettre=warn");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        Jail::expect_with(|_jail| {
            let config = load_from(
                r#"
                [scheduler]
                max_concurrent = 9
                [logging]
                dashreport = " DEBUG "
                "#,
            );
            assert_eq!(config.scheduler.max_concurrent, 9);
            assert_eq!(config.scheduler.tick_seconds, 60);
            assert_eq!(config.logging.dashreport, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.set_env("DASHREPORT_SCHEDULER_MAX_CONCURRENT", "2");
            jail.set_env("DASHREPORT_AUTH_SERVICE_TOKEN", "glsa_abc");
            let config = load_from("[scheduler]\nmax_concurrent = 9\n");
            assert_eq!(config.scheduler.max_concurrent, 2);
            assert_eq!(config.auth.service_token, "glsa_abc");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_repaired() {
        Jail::expect_with(|_jail| {
            let config = load_from(
                r#"
                [scheduler]
                max_concurrent = 0
                max_pending = 1
                [logging]
                lopdf = "loud"
                "#,
            );
            assert_eq!(config.scheduler.max_concurrent, 5);
            assert_eq!(config.scheduler.max_pending, 5);
            assert_eq!(config.logging.lopdf, "error");
            Ok(())
        });
    }
}
