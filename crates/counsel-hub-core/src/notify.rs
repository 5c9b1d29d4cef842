//! High-risk alert email over an SMTP relay. Best effort: no retry, no queue.

use crate::config::SmtpConfig;
use crate::record::{CounselingRecord, RiskLevel};
use crate::redaction::is_redacted;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};

const EXCERPT_CHARS: usize = 600;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("alert mail is not configured")]
    Unconfigured,
    #[error("bad mail address {0:?}")]
    Address(String),
    #[error("alert message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("mail relay: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}

impl AlertMessage {
    /// Templated alert for a saved record. Confidential records never carry text excerpts.
    pub fn for_record(record: &CounselingRecord) -> Self {
        let subject = format!(
            "【高風險通報】學生 {} - {}",
            record.student_id,
            record.category.label()
        );
        let confidential = is_redacted(&record.raw_observation);
        let excerpt = if confidential {
            "（本紀錄標記為機密，內容請至輔導室查閱）".to_string()
        } else {
            record.generated_text.chars().take(EXCERPT_CHARS).collect()
        };
        let body = format!(
            "輔導紀錄系統偵測到一筆高風險紀錄，請儘速追蹤。\n\n\
             時間：{}\n學生代號：{}\n對象：{}\n類別：{}\n風險等級：{}\n\n\
             紀錄摘要：\n{}\n",
            record.timestamp,
            record.student_id,
            record.target_type.label(),
            record.category.label(),
            record.risk_level,
            excerpt
        );
        Self { subject, body }
    }
}

pub fn needs_alert(record: &CounselingRecord) -> bool {
    record.risk_level == RiskLevel::High
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, alert: &AlertMessage) -> Result<(), NotifyError>;
}

pub struct SmtpAlertMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

fn mailbox(addr: &str) -> Result<Mailbox, NotifyError> {
    addr.trim()
        .parse()
        .map_err(|_| NotifyError::Address(addr.to_string()))
}

impl SmtpAlertMailer {
    /// Port 465 uses implicit TLS, anything else STARTTLS.
    pub fn from_config(cfg: &SmtpConfig) -> Result<Self, NotifyError> {
        let builder = if cfg.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
        };
        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();
        let to = cfg
            .to
            .iter()
            .map(|a| mailbox(a))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Unconfigured);
        }
        Ok(Self {
            transport,
            from: mailbox(&cfg.from)?,
            to,
        })
    }

    fn build(&self, alert: &AlertMessage) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(alert.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for rcpt in &self.to {
            builder = builder.to(rcpt.clone());
        }
        Ok(builder.body(alert.body.clone())?)
    }
}

#[async_trait]
impl AlertNotifier for SmtpAlertMailer {
    async fn send_alert(&self, alert: &AlertMessage) -> Result<(), NotifyError> {
        let message = self.build(alert)?;
        self.transport.send(message).await?;
        tracing::info!("[HUB] alert mail sent to {} recipient(s)", self.to.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Category, TargetType};
    use crate::redaction::REDACTED_PLACEHOLDER;

    fn high(raw: &str) -> CounselingRecord {
        CounselingRecord {
            timestamp: "2026-03-02 09:30:00".into(),
            student_id: "S2048".into(),
            target_type: TargetType::Student,
            category: Category::SelfHarmRisk,
            risk_level: RiskLevel::High,
            raw_observation: raw.into(),
            generated_text: "風險等級：高\n學生表示近期有自傷念頭".into(),
        }
    }

    #[test]
    fn alert_carries_record_fields() {
        let a = AlertMessage::for_record(&high("open text"));
        assert!(a.subject.contains("S2048"));
        assert!(a.subject.contains("自傷風險"));
        assert!(a.body.contains("學生表示近期有自傷念頭"));
        assert!(needs_alert(&high("x")));
    }

    #[test]
    fn confidential_alert_has_no_excerpt() {
        let a = AlertMessage::for_record(&high(REDACTED_PLACEHOLDER));
        assert!(!a.body.contains("自傷念頭"));
    }

    #[test]
    fn mailer_rejects_bad_recipient() {
        let cfg = SmtpConfig {
            host: "smtp.school.edu".into(),
            port: 587,
            username: "relay".into(),
            password: "pw".into(),
            from: "hub@school.edu".into(),
            to: vec!["not an address".into()],
        };
        assert!(matches!(
            SmtpAlertMailer::from_config(&cfg),
            Err(NotifyError::Address(_))
        ));
    }
}
