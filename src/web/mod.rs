//! Web server module: the JSON API over the monitoring core.

mod handlers;

pub use handlers::*;

use crate::service::Monitor;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

/// Web server for the nexboard API.
pub struct Server {
    http_port: u16,
    state: AppState,
}

impl Server {
    pub fn new(http_port: u16, monitor: Arc<Monitor>) -> Self {
        Self {
            http_port,
            state: AppState { monitor },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        let api = Router::new()
            .route(
                "/applications",
                get(handlers::handle_list_applications).post(handlers::handle_create_application),
            )
            .route(
                "/applications/{id}",
                get(handlers::handle_get_application)
                    .put(handlers::handle_update_application)
                    .delete(handlers::handle_delete_application),
            )
            .route("/applications/{id}/interval", put(handlers::handle_reschedule))
            .route("/applications/{id}/health", get(handlers::handle_application_health))
            .route("/health", get(handlers::handle_health_overview))
            .route("/check", post(handlers::handle_check))
            .route("/alerts", get(handlers::handle_list_alerts))
            .route("/alerts/ack-all", post(handlers::handle_acknowledge_all))
            .route("/alerts/{id}/ack", post(handlers::handle_acknowledge_alert))
            .route(
                "/subscriptions",
                get(handlers::handle_list_subscriptions).post(handlers::handle_create_subscription),
            )
            .route(
                "/subscriptions/{id}",
                get(handlers::handle_get_subscription)
                    .put(handlers::handle_update_subscription)
                    .delete(handlers::handle_delete_subscription),
            )
            .route("/email-queue", get(handlers::handle_list_emails))
            .route("/email-queue/{id}", get(handlers::handle_get_email));

        Router::new()
            .nest("/api/v1", api)
            .route("/status", get(handlers::handle_status))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
