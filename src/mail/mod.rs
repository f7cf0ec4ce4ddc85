mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DashReportError;
use crate::schedules::{Recipients, Schedule};
use crate::settings::SmtpConfig;

pub use smtp::SmtpMailer;

pub const DEFAULT_SUBJECT: &str = "{{schedule.name}}: {{dashboard.title}}";
pub const DEFAULT_BODY: &str =
    "Attached is the {{dashboard.title}} report for {{timerange}}, generated {{run.started_at}}.";

/// Delivers a finished report. Failures are recorded on the run, never fatal to it.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_report(
        &self,
        smtp: &SmtpConfig,
        recipients: &Recipients,
        subject: &str,
        body: &str,
        attachment: &[u8],
        filename: &str,
    ) -> Result<(), DashReportError>;
}

/// The time range as shown to readers, e.g. "now-7d to now"
pub fn timerange(schedule: &Schedule) -> String {
    format!("{} to {}", schedule.range_from, schedule.range_to)
}

/// Fill the run-specific placeholders in a subject or body template
pub fn interpolate_template(
    template: &str,
    schedule: &Schedule,
    started_at: DateTime<Utc>,
) -> String {
    let title = if schedule.dashboard_title.trim().is_empty() {
        schedule.dashboard_uid.as_str()
    } else {
        schedule.dashboard_title.as_str()
    };

    template
        .replace("{{schedule.name}}", &schedule.name)
        .replace("{{dashboard.title}}", title)
        .replace("{{timerange}}", &timerange(schedule))
        .replace("{{run.started_at}}", &started_at.to_rfc2822())
}

/// Subject and body for a run, falling back to the stock templates when blank
pub fn compose(schedule: &Schedule, started_at: DateTime<Utc>) -> (String, String) {
    let subject = if schedule.email_subject.trim().is_empty() {
        DEFAULT_SUBJECT
    } else {
        schedule.email_subject.as_str()
    };
    let body = if schedule.email_body.trim().is_empty() {
        DEFAULT_BODY
    } else {
        schedule.email_body.as_str()
    };
    (
        interpolate_template(subject, schedule, started_at),
        interpolate_template(body, schedule, started_at),
    )
}

pub fn report_filename(schedule: &Schedule, started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}.pdf",
        schedule.name.trim().replace(' ', "_"),
        started_at.format("%Y-%m-%d-%H%M%S")
    )
}
