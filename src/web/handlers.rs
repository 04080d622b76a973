//! HTTP request handlers.

use super::AppState;
use crate::db::{
    Alert, Application, EmailQueueCounts, EmailQueueItem, NewApplication, NewSubscription,
    NotifySubscription, ProbeTarget,
};
use crate::error::MonitorError;
use crate::probe::Verdict;
use crate::service::ApplicationHealth;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<Json<T>, MonitorError>;

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, field) = match &self {
            MonitorError::Validation(e) => (StatusCode::BAD_REQUEST, Some(e.field)),
            MonitorError::NotFound { .. } => (StatusCode::NOT_FOUND, None),
            MonitorError::Storage(e) => {
                tracing::error!("API: storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "field": field,
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// API: Applications
// ============================================================================

pub async fn handle_list_applications(
    State(state): State<AppState>,
) -> ApiResult<Vec<Application>> {
    Ok(Json(state.monitor.list_applications()?))
}

pub async fn handle_get_application(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Application> {
    Ok(Json(state.monitor.get_application(id)?))
}

pub async fn handle_create_application(
    State(state): State<AppState>,
    Json(req): Json<NewApplication>,
) -> Result<(StatusCode, Json<Application>), MonitorError> {
    let app = state.monitor.register_application(&req).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn handle_update_application(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<NewApplication>,
) -> ApiResult<Application> {
    Ok(Json(state.monitor.update_application(id, &req).await?))
}

pub async fn handle_delete_application(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, MonitorError> {
    state.monitor.remove_application(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub check_interval_secs: u64,
}

pub async fn handle_reschedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<IntervalRequest>,
) -> ApiResult<Application> {
    Ok(Json(state.monitor.reschedule(id, req.check_interval_secs).await?))
}

// ============================================================================
// API: Health
// ============================================================================

pub async fn handle_health_overview(
    State(state): State<AppState>,
) -> ApiResult<Vec<ApplicationHealth>> {
    Ok(Json(state.monitor.health_overview()?))
}

pub async fn handle_application_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ApplicationHealth> {
    Ok(Json(state.monitor.application_health(id)?))
}

/// Ad hoc check of any target, as used by the "test connection" button.
pub async fn handle_check(
    State(state): State<AppState>,
    Json(target): Json<ProbeTarget>,
) -> ApiResult<Verdict> {
    Ok(Json(state.monitor.check_target(&target).await?))
}

// ============================================================================
// API: Alerts
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub open: bool,
}

pub async fn handle_list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Vec<Alert>> {
    let alerts = if query.open {
        state.monitor.list_open_alerts()?
    } else {
        state.monitor.list_alerts()?
    };
    Ok(Json(alerts))
}

pub async fn handle_acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Alert> {
    Ok(Json(state.monitor.acknowledge_alert(id)?))
}

#[derive(Debug, Serialize)]
pub struct AcknowledgedResponse {
    pub acknowledged: usize,
}

pub async fn handle_acknowledge_all(
    State(state): State<AppState>,
) -> ApiResult<AcknowledgedResponse> {
    let acknowledged = state.monitor.acknowledge_all_alerts()?;
    Ok(Json(AcknowledgedResponse { acknowledged }))
}

// ============================================================================
// API: Subscriptions
// ============================================================================

pub async fn handle_list_subscriptions(
    State(state): State<AppState>,
) -> ApiResult<Vec<NotifySubscription>> {
    Ok(Json(state.monitor.list_subscriptions()?))
}

pub async fn handle_get_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<NotifySubscription> {
    Ok(Json(state.monitor.get_subscription(id)?))
}

pub async fn handle_create_subscription(
    State(state): State<AppState>,
    Json(req): Json<NewSubscription>,
) -> Result<(StatusCode, Json<NotifySubscription>), MonitorError> {
    let sub = state.monitor.create_subscription(&req)?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn handle_update_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<NewSubscription>,
) -> ApiResult<NotifySubscription> {
    Ok(Json(state.monitor.update_subscription(id, &req)?))
}

pub async fn handle_delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, MonitorError> {
    state.monitor.delete_subscription(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// API: Email queue
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct EmailQueueQuery {
    /// Only rows eligible for delivery right now.
    #[serde(default)]
    pub due: bool,
}

pub async fn handle_list_emails(
    State(state): State<AppState>,
    Query(query): Query<EmailQueueQuery>,
) -> ApiResult<Vec<EmailQueueItem>> {
    let emails = if query.due {
        state.monitor.list_due_emails()?
    } else {
        state.monitor.list_email_queue()?
    };
    Ok(Json(emails))
}

pub async fn handle_get_email(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<EmailQueueItem> {
    Ok(Json(state.monitor.get_email(id)?))
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub applications: usize,
    pub scheduled: usize,
    pub open_alerts: usize,
    pub email_queue: EmailQueueCounts,
}

pub async fn handle_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let applications = state.monitor.list_applications()?.len();
    let open_alerts = state.monitor.list_open_alerts()?.len();
    let email_queue = state.monitor.email_queue_counts()?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        applications,
        scheduled: state.monitor.scheduler().active_count().await,
        open_alerts,
        email_queue,
    }))
}
