//! Fan-out of new alerts to notification subscriptions.

use super::webhook::{AlertEvent, WebhookDelivery};
use crate::db::{Alert, Channel, DbError, NewEmail, NotifySubscription, Store};

use std::sync::Arc;
use tokio::sync::mpsc;

/// What a dispatch did with each enabled subscription.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub emails_queued: usize,
    pub webhooks_handed_off: usize,
    pub skipped: usize,
}

/// Turns a newly created alert into queued deliverables.
///
/// Dispatch only appends queue rows and hands webhook payloads to a channel;
/// it never waits on delivery.
pub struct Dispatcher {
    store: Arc<Store>,
    webhooks: Option<mpsc::Sender<WebhookDelivery>>,
    fallback_webhook_url: Option<String>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            webhooks: None,
            fallback_webhook_url: None,
        }
    }

    /// Hand webhook deliveries to `tx`, using `fallback_url` for subscriptions without an endpoint.
    pub fn with_webhooks(
        mut self,
        tx: mpsc::Sender<WebhookDelivery>,
        fallback_url: Option<String>,
    ) -> Self {
        self.webhooks = Some(tx);
        self.fallback_webhook_url = fallback_url;
        self
    }

    pub fn dispatch(&self, alert: &Alert) -> Result<DispatchReport, DbError> {
        let subscriptions = self.store.list_enabled_subscriptions()?;
        let mut report = DispatchReport::default();

        for sub in &subscriptions {
            let handed_off = match sub.channel {
                Channel::Email => self.enqueue_email(sub, alert),
                Channel::Webhook => self.hand_off_webhook(sub, alert),
            };
            match (handed_off, sub.channel) {
                (true, Channel::Email) => report.emails_queued += 1,
                (true, Channel::Webhook) => report.webhooks_handed_off += 1,
                (false, _) => report.skipped += 1,
            }
        }

        tracing::info!(
            "Dispatcher: alert {} -> {} email(s), {} webhook(s), {} skipped",
            alert.id,
            report.emails_queued,
            report.webhooks_handed_off,
            report.skipped
        );
        Ok(report)
    }

    fn enqueue_email(&self, sub: &NotifySubscription, alert: &Alert) -> bool {
        let (subject, body) = render_alert_email(alert);
        let email = NewEmail {
            alert_id: Some(alert.id),
            to_addr: sub.endpoint.clone(),
            subject,
            body,
        };

        match self.store.enqueue_email(&email) {
            Ok(row) => {
                tracing::debug!("Dispatcher: queued email {} to {}", row.id, row.to_addr);
                true
            }
            Err(e) => {
                tracing::error!(
                    "Dispatcher: could not queue email for subscription {}: {}",
                    sub.id,
                    e
                );
                false
            }
        }
    }

    fn hand_off_webhook(&self, sub: &NotifySubscription, alert: &Alert) -> bool {
        let Some(tx) = &self.webhooks else {
            tracing::warn!(
                "Dispatcher: webhook subscription {} ignored, no webhook worker",
                sub.id
            );
            return false;
        };

        let url = if sub.endpoint.is_empty() {
            match &self.fallback_webhook_url {
                Some(url) => url.clone(),
                None => {
                    tracing::warn!(
                        "Dispatcher: webhook subscription {} has no endpoint and no default URL is configured",
                        sub.id
                    );
                    return false;
                }
            }
        } else {
            sub.endpoint.clone()
        };

        let delivery = WebhookDelivery {
            url,
            event: AlertEvent::created(alert),
        };
        match tx.try_send(delivery) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Dispatcher: webhook hand-off for subscription {} failed: {}",
                    sub.id,
                    e
                );
                false
            }
        }
    }
}

/// Render the subject and plain-text body of an alert email.
pub fn render_alert_email(alert: &Alert) -> (String, String) {
    let subject = format!(
        "[{}] {}",
        alert.severity.as_str().to_uppercase(),
        alert.title
    );
    let body = format!(
        "{}\n\nSource: {}\nSeverity: {}\nRaised at: {}\nAlert ID: {}\n\n{}\n",
        alert.title,
        alert.source,
        alert.severity,
        alert.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        alert.id,
        alert.message
    );
    (subject, body)
}
