use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info};

use super::Mailer;
use crate::error::DashReportError;
use crate::schedules::Recipients;
use crate::settings::SmtpConfig;

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);
const IMPLICIT_TLS_PORT: u16 = 465;

/// Sends reports over SMTP. A transport is built per message from the
/// tenant's current settings.
#[derive(Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        SmtpMailer
    }
}

fn mailbox(address: &str) -> Result<Mailbox, DashReportError> {
    address
        .trim()
        .parse()
        .map_err(|e| DashReportError::Delivery(format!("invalid address '{}': {}", address, e)))
}

pub(crate) fn build_message(
    smtp: &SmtpConfig,
    recipients: &Recipients,
    subject: &str,
    body: &str,
    attachment: &[u8],
    filename: &str,
) -> Result<Message, DashReportError> {
    let from = if smtp.from.trim().is_empty() {
        smtp.username.as_str()
    } else {
        smtp.from.as_str()
    };
    let mut builder = Message::builder().from(mailbox(from)?).subject(subject);
    for to in recipients.to.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.to(mailbox(to)?);
    }
    for cc in recipients.cc.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in recipients.bcc.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.bcc(mailbox(bcc)?);
    }

    let pdf = ContentType::parse("application/pdf")
        .map_err(|e| DashReportError::Delivery(format!("content type: {}", e)))?;
    builder
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body.to_string()))
                .singlepart(Attachment::new(filename.to_string()).body(attachment.to_vec(), pdf)),
        )
        .map_err(|e| DashReportError::Delivery(format!("failed to build message: {}", e)))
}

fn build_transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, DashReportError> {
    let host = smtp.host.trim();
    let relay_error = |e: lettre::transport::smtp::Error| {
        DashReportError::Delivery(format!("SMTP relay {}: {}", host, e))
    };

    let mut builder = if !smtp.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
    } else if smtp.port == IMPLICIT_TLS_PORT {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(relay_error)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(relay_error)?
    };

    if smtp.use_tls && smtp.skip_tls_verify {
        let params = TlsParameters::builder(host.to_string())
            .dangerous_accept_invalid_certs(true)
            .build()
            .map_err(relay_error)?;
        builder = builder.tls(if smtp.port == IMPLICIT_TLS_PORT {
            Tls::Wrapper(params)
        } else {
            Tls::Required(params)
        });
    }

    builder = builder.port(smtp.port).timeout(Some(SMTP_TIMEOUT));
    if !smtp.username.trim().is_empty() {
        builder = builder.credentials(Credentials::new(
            smtp.username.clone(),
            smtp.password.clone(),
        ));
    }
    Ok(builder.build())
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_report(
        &self,
        smtp: &SmtpConfig,
        recipients: &Recipients,
        subject: &str,
        body: &str,
        attachment: &[u8],
        filename: &str,
    ) -> Result<(), DashReportError> {
        if !smtp.is_configured() {
            return Err(DashReportError::Configuration(
                "SMTP not configured".to_string(),
            ));
        }

        let message = build_message(smtp, recipients, subject, body, attachment, filename)?;
        let transport = build_transport(smtp)?;

        debug!(
            "Sending '{}' to {} recipients via {}:{}",
            subject,
            recipients.count(),
            smtp.host,
            smtp.port
        );
        transport
            .send(message)
            .await
            .map_err(|e| DashReportError::Delivery(format!("SMTP send failed: {}", e)))?;

        info!("Delivered {} to {} recipients", filename, recipients.count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            from: "Reports <reports@example.com>".into(),
            ..SmtpConfig::default()
        }
    }

    #[test]
    fn test_message_carries_recipients_and_attachment() {
        let recipients = Recipients {
            to: vec!["ops@example.com".into(), " ".into()],
            cc: vec!["lead@example.com".into()],
            bcc: Vec::new(),
        };
        let message = build_message(
            &smtp(),
            &recipients,
            "Weekly ops",
            "See attached",
            b"%PDF-1.5",
            "weekly.pdf",
        )
        .unwrap();

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("To: ops@example.com"));
        assert!(raw.contains("Cc: lead@example.com"));
        assert!(raw.contains("Subject: Weekly ops"));
        assert!(raw.contains("application/pdf"));
        assert!(raw.contains("weekly.pdf"));
    }

    #[test]
    fn test_invalid_address_is_a_delivery_error() {
        let recipients = Recipients {
            to: vec!["not an address".into()],
            ..Recipients::default()
        };
        let err = build_message(&smtp(), &recipients, "s", "b", b"", "r.pdf").unwrap_err();
        assert!(matches!(err, DashReportError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_smtp_is_refused() {
        let err = SmtpMailer::new()
            .send_report(
                &SmtpConfig::default(),
                &Recipients::default(),
                "s",
                "b",
                b"",
                "r.pdf",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DashReportError::Configuration(_)));
    }
}
