//! Probe module for application health checks.
//!
//! Supports HTTP and bare TCP checks. Probes never retry and never fail:
//! every error is folded into the returned [`Verdict`].

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use crate::db::{HealthType, ProbeTarget};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub ok: bool,
    pub latency_ms: u64,
    /// HTTP status received, if the check got that far.
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl Verdict {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            ok: true,
            latency_ms,
            status_code: None,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn failed(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms,
            status_code: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }

    fn with_status(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }
}

/// Anything that can turn a probe target into a verdict.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> Verdict;
}

/// Probes over the real network.
#[derive(Clone)]
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nexboard/", env!("CARGO_PKG_VERSION")))
            // A redirect is a non-2xx answer from the health endpoint.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> Verdict {
        let start = Instant::now();
        let (result, status) = match target.health_type {
            HealthType::Http => match run_http_probe(&self.client, &target.url(), timeout).await {
                Ok(status) => (Ok(()), Some(status)),
                Err(ProbeError::Status(status)) => (Err(ProbeError::Status(status)), Some(status)),
                Err(e) => (Err(e), None),
            },
            HealthType::Tcp => (run_tcp_probe(&target.socket_addr(), timeout).await, None),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => Verdict::healthy(latency_ms).with_status(status),
            Err(e) => Verdict::failed(latency_ms, e.to_string()).with_status(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Protocol;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn target(health_type: HealthType, port: u16, health_path: &str) -> ProbeTarget {
        ProbeTarget {
            health_type,
            protocol: Protocol::Http,
            host: "127.0.0.1".to_string(),
            port,
            health_path: health_path.to_string(),
        }
    }

    /// A port that was just free; nothing listens on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_http_probe_2xx_is_ok() {
        let port = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let prober = NetworkProber::new().unwrap();

        let verdict = prober
            .probe(&target(HealthType::Http, port, "/health"), Duration::from_secs(2))
            .await;
        assert!(verdict.ok, "{:?}", verdict);
        assert_eq!(verdict.status_code, Some(200));
        assert!(verdict.error.is_none());
    }

    #[tokio::test]
    async fn test_http_probe_non_2xx_fails() {
        let port = serve(Router::new().route(
            "/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;
        let prober = NetworkProber::new().unwrap();

        let verdict = prober
            .probe(&target(HealthType::Http, port, "/health"), Duration::from_secs(2))
            .await;
        assert!(!verdict.ok);
        assert_eq!(verdict.status_code, Some(503));
        assert!(verdict.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_http_probe_redirect_is_not_followed() {
        let router = Router::new()
            .route(
                "/health",
                get(|| async { axum::response::Redirect::temporary("/elsewhere") }),
            )
            .route("/elsewhere", get(|| async { "ok" }));
        let port = serve(router).await;
        let prober = NetworkProber::new().unwrap();

        let verdict = prober
            .probe(&target(HealthType::Http, port, "/health"), Duration::from_secs(2))
            .await;
        assert!(!verdict.ok);
        assert_eq!(verdict.status_code, Some(307));
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let port = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let prober = NetworkProber::new().unwrap();

        let verdict = prober
            .probe(&target(HealthType::Http, port, "/slow"), Duration::from_millis(100))
            .await;
        assert!(!verdict.ok);
        assert!(verdict.error.unwrap().contains("timed out"));
        assert!(verdict.latency_ms < 5000);
    }

    #[tokio::test]
    async fn test_connection_refused_is_data() {
        let port = closed_port().await;
        let prober = NetworkProber::new().unwrap();

        for health_type in [HealthType::Http, HealthType::Tcp] {
            let verdict = prober
                .probe(&target(health_type, port, "/health"), Duration::from_secs(1))
                .await;
            assert!(!verdict.ok);
            assert!(verdict.error.is_some());
            assert_eq!(verdict.status_code, None);
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = NetworkProber::new().unwrap();

        let verdict = prober
            .probe(&target(HealthType::Tcp, port, "/"), Duration::from_secs(1))
            .await;
        assert!(verdict.ok, "{:?}", verdict);
        drop(listener);
    }
}
