// src/mailer.rs

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, msg: MailMessage) -> Result<(), String>;
}

/// Writes outgoing mail to the log instead of an SMTP relay.
pub struct LogMailer {
    pub from: String,
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, msg: MailMessage) -> Result<(), String> {
        log::info!(
            "mail from={} to={} subject={:?}\n{}",
            self.from,
            msg.to,
            msg.subject,
            msg.body
        );
        Ok(())
    }
}
