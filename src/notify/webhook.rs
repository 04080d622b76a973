//! Webhook hand-off for alert notifications.

use crate::db::Alert;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// JSON body posted to webhook endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub event: &'static str,
    pub alert: Alert,
}

impl AlertEvent {
    pub fn created(alert: &Alert) -> Self {
        Self {
            event: "alert.created",
            alert: alert.clone(),
        }
    }
}

/// One payload bound for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
    pub url: String,
    pub event: AlertEvent,
}

/// Pushes alert events to a webhook endpoint.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &str, event: &AlertEvent) -> Result<(), SenderError>;
}

/// Posts events as JSON over HTTP.
pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self, SenderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, url: &str, event: &AlertEvent) -> Result<(), SenderError> {
        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(event)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Webhook returned non-success status: {}. Body: {}",
                status, error_body
            )));
        }

        Ok(())
    }
}

/// Start the background task that drains webhook deliveries.
///
/// Returns the sending half used by the dispatcher; the task ends once every
/// sender is dropped.
pub fn spawn_webhook_worker(
    sender: Arc<dyn WebhookSender>,
    capacity: usize,
) -> (mpsc::Sender<WebhookDelivery>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WebhookDelivery>(capacity);

    let handle = tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            match sender.send(&delivery.url, &delivery.event).await {
                Ok(()) => tracing::info!(
                    "Webhook: delivered alert {} to {}",
                    delivery.event.alert.id,
                    delivery.url
                ),
                Err(e) => tracing::error!(
                    "Webhook: delivery of alert {} to {} failed: {}",
                    delivery.event.alert.id,
                    delivery.url,
                    e
                ),
            }
        }
        tracing::debug!("Webhook: worker stopped");
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Severity;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;
    use tokio::sync::Mutex;

    fn alert() -> Alert {
        Alert {
            id: 9,
            application_id: Some(1),
            source: "api".to_string(),
            severity: Severity::High,
            title: "api is down".to_string(),
            message: "connection refused".to_string(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    #[tokio::test]
    async fn test_http_sender_posts_json() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        seen.lock().await.push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let sender = HttpWebhookSender::new(Duration::from_secs(2)).unwrap();
        let event = AlertEvent::created(&alert());

        sender
            .send(&format!("http://127.0.0.1:{}/hook", port), &event)
            .await
            .unwrap();
        let bodies = received.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["event"], "alert.created");
        assert_eq!(bodies[0]["alert"]["severity"], "high");

        let err = sender
            .send(&format!("http://127.0.0.1:{}/broken", port), &event)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::SendFailed(_)));
    }
}
