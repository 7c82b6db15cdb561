//! Alert delivery: Telegram, SMTP and the daemon log.

use crate::config::Config;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

/// Upper bound on a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {0} from notification endpoint")]
    HttpStatus(u16),
    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Email(#[from] lettre::error::Error),
    #[error("{failed} of {total} notification sinks failed")]
    Partial { failed: usize, total: usize },
}

/// What a sink is told when an alert fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub label: String,
    pub message: String,
    /// Empty when the snapshot could not be written.
    pub evidence_path: String,
}

/// Outbound alert transport (chat, email, ...). Called from a blocking
/// worker, so implementations may block on network I/O.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Emits alerts into the daemon log. Used when no transport is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        tracing::warn!(
            label = %alert.label,
            evidence = %alert.evidence_path,
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Posts alerts to a chat through the Telegram Bot API `sendMessage` call.
pub struct TelegramSink {
    client: reqwest::Client,
    url: String,
    chat_id: String,
    runtime: Handle,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: impl Into<String>, runtime: Handle) -> Result<Self, NotifyError> {
        Self::with_api_base(TELEGRAM_API, token, chat_id, runtime)
    }

    pub fn with_api_base(
        api_base: &str,
        token: &str,
        chat_id: impl Into<String>,
        runtime: Handle,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/')),
            chat_id: chat_id.into(),
            runtime,
        })
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": alert.message,
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus(status.as_u16()));
        }
        tracing::debug!(label = %alert.label, "telegram alert sent");
        Ok(())
    }
}

impl NotificationSink for TelegramSink {
    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.runtime.block_on(self.send(alert))
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

/// Connection details for [`SmtpSink`].
#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

/// Mails alerts over STARTTLS SMTP.
pub struct SmtpSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    runtime: Handle,
}

impl SmtpSink {
    pub fn new(settings: &SmtpSettings, runtime: Handle) -> Result<Self, NotifyError> {
        let from: Mailbox = settings.from.parse()?;
        let to = settings
            .to
            .iter()
            .map(|addr| addr.parse())
            .collect::<Result<Vec<Mailbox>, _>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            .port(settings.port)
            .timeout(Some(REQUEST_TIMEOUT));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            runtime,
        })
    }

    /// Plain-text mail for `alert`, addressed to every recipient.
    pub fn message(&self, alert: &Alert) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("Camera alert: {} detected", alert.label))
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        Ok(builder.body(alert.message.clone())?)
    }
}

impl NotificationSink for SmtpSink {
    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let email = self.message(alert)?;
        self.runtime.block_on(self.transport.send(email))?;
        tracing::debug!(label = %alert.label, recipients = self.to.len(), "alert email sent");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

/// Delivers every alert to each inner sink in turn. One sink failing does not
/// stop the others; the alert counts as failed if any of them failed.
pub struct FanoutSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Build the configured transports, or a [`LogSink`] when there are none.
    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self, NotifyError> {
        let mut sinks: Vec<Box<dyn NotificationSink>> = Vec::new();
        if let (Some(token), Some(chat_id)) = (&config.telegram_bot_token, &config.telegram_chat_id) {
            sinks.push(Box::new(TelegramSink::new(token, chat_id.clone(), runtime.clone())?));
        }
        if let (Some(host), Some(from)) = (&config.smtp_host, config.smtp_sender()) {
            let settings = SmtpSettings {
                host: host.clone(),
                port: config.smtp_port,
                username: config.smtp_username.clone(),
                password: config.smtp_password.clone(),
                from: from.to_string(),
                to: config.smtp_to.clone(),
            };
            sinks.push(Box::new(SmtpSink::new(&settings, runtime)?));
        }
        if sinks.is_empty() {
            sinks.push(Box::new(LogSink));
        }
        Ok(Self::new(sinks))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert) {
                failed += 1;
                tracing::warn!(sink = sink.name(), label = %alert.label, error = %e, "alert delivery failed");
            }
        }
        if failed == 0 {
            Ok(())
        } else {
            Err(NotifyError::Partial {
                failed,
                total: self.sinks.len(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

/// Human-readable alert text.
pub fn alert_message(label: &str, timestamp: &str, evidence_path: &str) -> String {
    format!("{label} detected at {timestamp}. Snapshot saved: {evidence_path}")
}
