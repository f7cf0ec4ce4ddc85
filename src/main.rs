mod api;
mod cli;
mod config;
mod database;
mod dispatcher;
mod error;
mod mail;
mod next_run;
mod render;
mod runs;
mod schedules;
mod schema;
mod server;
mod settings;
mod store;
mod tenant_cache;
mod timestamps;
mod validation;
mod write_queue;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use error::DashReportError;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{error, info};
use std::process;

fn main() {
    if let Err(err) = run() {
        error!("{}", err);
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn run() -> Result<(), DashReportError> {
    let project_dirs = ProjectDirs::from("", "", "dashreport").ok_or_else(|| {
        DashReportError::Error("Could not determine the data directory".to_string())
    })?;

    let config = Config::load_config(&project_dirs);
    let _logger = setup_logging(&config, &project_dirs)?;

    info!("dashReport {} starting", env!("CARGO_PKG_VERSION"));

    CONFIG
        .set(config)
        .map_err(|_| DashReportError::Error("Configuration already initialized".to_string()))?;

    Cli::handle_command_line()
}

/// Log to a rotating file in the data directory; warnings and errors are
/// echoed to stderr
fn setup_logging(
    config: &Config,
    project_dirs: &ProjectDirs,
) -> Result<LoggerHandle, DashReportError> {
    let log_dir = project_dirs.data_local_dir().join("logs");

    Logger::try_with_str(config.logging.log_spec())
        .and_then(|logger| {
            logger
                .log_to_file(FileSpec::default().directory(log_dir).basename("dashreport"))
                .duplicate_to_stderr(Duplicate::Warn)
                .format_for_files(flexi_logger::detailed_format)
                .rotate(
                    Criterion::Size(10 * 1024 * 1024),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(7),
                )
                .start()
        })
        .map_err(|e| DashReportError::Error(format!("Failed to start logger: {}", e)))
}
