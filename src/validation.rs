use crate::error::DashReportError;
use crate::next_run::parse_cron;
use crate::schedules::{Recipients, Schedule};
use crate::settings::Limits;

/// Lower-cased domain part of an address with exactly one '@'
fn extract_domain(email: &str) -> Option<String> {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(domain), None) => {
            let domain = domain.trim().to_ascii_lowercase();
            (!domain.is_empty()).then_some(domain)
        }
        _ => None,
    }
}

/// Exact match, or "*.base" matching base itself and any subdomain of it
pub fn is_domain_allowed(domain: &str, allowed_domains: &[String]) -> bool {
    let domain = domain.to_ascii_lowercase();
    allowed_domains.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        if domain == allowed {
            return true;
        }
        match allowed.strip_prefix("*.") {
            Some(base) => domain == base || domain.ends_with(&format!(".{}", base)),
            None => false,
        }
    })
}

/// Check every recipient against the tenant's domain whitelist. An empty
/// whitelist allows everything.
pub fn validate_recipient_domains(
    recipients: &Recipients,
    allowed_domains: &[String],
) -> Result<(), DashReportError> {
    if allowed_domains.is_empty() {
        return Ok(());
    }

    for email in recipients.all() {
        let domain = extract_domain(email).ok_or_else(|| {
            DashReportError::Validation(format!("invalid email address format: {}", email))
        })?;
        if !is_domain_allowed(&domain, allowed_domains) {
            return Err(DashReportError::Validation(format!(
                "email domain '{}' is not allowed (email: {}). Allowed domains: {}",
                domain,
                email,
                allowed_domains.join(", ")
            )));
        }
    }
    Ok(())
}

pub fn validate_cron_expression(cron_expr: &str) -> Result<(), DashReportError> {
    parse_cron(cron_expr).map(|_| ())
}

/// Checks applied when a schedule is created or edited
pub fn validate_schedule(schedule: &Schedule, limits: &Limits) -> Result<(), DashReportError> {
    if schedule.name.trim().is_empty() {
        return Err(DashReportError::Validation("schedule name is required".into()));
    }
    if schedule.dashboard_uid.trim().is_empty() {
        return Err(DashReportError::Validation("dashboard_uid is required".into()));
    }
    if schedule.recipients.to.iter().all(|to| to.trim().is_empty()) {
        return Err(DashReportError::Validation(
            "at least one 'to' recipient is required".into(),
        ));
    }
    let count = schedule.recipients.count();
    if limits.max_recipients > 0 && count > limits.max_recipients {
        return Err(DashReportError::Validation(format!(
            "{} recipients exceeds the limit of {}",
            count, limits.max_recipients
        )));
    }
    validate_recipient_domains(&schedule.recipients, &limits.allowed_domains)?;
    if !schedule.cron_expr.trim().is_empty() {
        validate_cron_expression(&schedule.cron_expr)?;
    }
    Ok(())
}
