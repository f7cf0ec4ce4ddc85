use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::info;

use crate::api::state::AppState;
use crate::config::CONFIG;
use crate::database::Database;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::DashReportError;
use crate::mail::SmtpMailer;
use crate::next_run::{load_timezone, next_run_for};
use crate::render::{
    CredentialChain, CredentialProvider, DefaultRendererFactory, RequestTokenProvider,
    ServiceTokenProvider,
};
use crate::schedules::IntervalType;
use crate::server::WebServer;
use crate::store::Store;
use crate::tenant_cache::TenantCache;
use crate::validation::validate_cron_expression;

#[derive(Parser)]
#[command(
    name = "dashreport",
    version,
    about = "dashReport: scheduled dashboard PDF reports, delivered by email"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the scheduler and HTTP server (default if no command specified)
    Serve,

    /// Print the next firing time of a cron expression
    NextRun {
        /// Five-field cron expression. Derived from --interval when omitted.
        #[arg(long)]
        cron: Option<String>,

        /// IANA timezone the expression is evaluated in
        #[arg(long, default_value = "UTC")]
        tz: String,

        /// daily, weekly or monthly
        #[arg(long, default_value = "daily")]
        interval: String,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), DashReportError> {
        let args = Cli::parse();

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(),
            Command::NextRun { cron, tz, interval } => {
                println!("{}", Self::describe_next_run(cron.as_deref(), &tz, &interval)?);
                Ok(())
            }
        }
    }

    fn describe_next_run(
        cron: Option<&str>,
        tz: &str,
        interval: &str,
    ) -> Result<String, DashReportError> {
        let expr = match cron.map(str::trim).filter(|c| !c.is_empty()) {
            Some(expr) => expr,
            None => {
                interval.parse::<IntervalType>()?;
                IntervalType::derived_cron(interval)
            }
        };
        validate_cron_expression(expr)?;

        let next = next_run_for(expr, tz, Utc::now());
        let zone = load_timezone(tz);
        Ok(format!(
            "{}  (UTC)\n{}  ({})",
            next.to_rfc3339(),
            next.with_timezone(&zone).to_rfc3339(),
            zone.name()
        ))
    }

    fn start_server() -> Result<(), DashReportError> {
        let config = CONFIG
            .get()
            .ok_or_else(|| DashReportError::Error("Configuration not initialized".to_string()))?;

        info!(
            "Starting server on {}:{}",
            config.server.host, config.server.port
        );

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| DashReportError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let db = Database::open(Path::new(&config.database.path))?;
            let store = Arc::new(Store::new(db, config.scheduler.queue_capacity));

            let factory = Arc::new(DefaultRendererFactory::new(
                &config.renderer.render_service_url,
                &config.renderer.default_base_url,
            ));
            let cache = Arc::new(TenantCache::new(store.clone(), factory));

            let request_tokens = Arc::new(RequestTokenProvider::new());
            let providers: Vec<Arc<dyn CredentialProvider>> = vec![
                request_tokens.clone(),
                Arc::new(ServiceTokenProvider::new(&config.auth.service_token)),
            ];

            let dispatcher = Arc::new(Dispatcher::new(
                store,
                cache,
                Arc::new(SmtpMailer::new()),
                CredentialChain::new(providers),
                DispatcherConfig::from_config(&config.scheduler),
            ));
            dispatcher.start().await;

            let web_server = WebServer::new(config.server.host.clone(), config.server.port);
            web_server
                .start(AppState::new(dispatcher, request_tokens))
                .await
        })
    }
}
