//! Mail-sending collaborator.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Every delivery failure is treated as retryable by the queue processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("mail delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivers one email, or says why it could not.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError>;
}

/// Mailer that records deliveries in the log instead of talking SMTP.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        tracing::info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "LogMailer: delivering email ({} bytes)",
            email.body.len()
        );
        Ok(())
    }
}
