//! The monitoring core as seen by the HTTP layer.

use crate::alerts::AlertManager;
use crate::config::{AlertPolicy, ScheduleSettings, Thresholds};
use crate::db::{
    validate_check_interval, Alert, Application, EmailQueueCounts, EmailQueueItem,
    NewApplication, NewSubscription, NotifySubscription, ProbeTarget, Store, ValidationError,
};
use crate::error::MonitorError;
use crate::health::{HealthState, HealthTracker};
use crate::notify::Dispatcher;
use crate::probe::{Prober, Verdict};
use crate::scheduler::{HealthPipeline, Scheduler};

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// An application with its live health and open alert.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationHealth {
    pub application: Application,
    pub health: HealthState,
    pub open_alert_id: Option<i64>,
}

/// Keeps the store and the scheduler's live timers in step.
pub struct Monitor {
    store: Arc<Store>,
    tracker: Arc<HealthTracker>,
    alerts: Arc<AlertManager>,
    scheduler: Arc<Scheduler>,
    prober: Arc<dyn Prober>,
}

impl Monitor {
    pub fn new(
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        dispatcher: Arc<Dispatcher>,
        settings: ScheduleSettings,
        thresholds: Thresholds,
        policy: AlertPolicy,
    ) -> Self {
        let tracker = Arc::new(HealthTracker::new(thresholds));
        let alerts = Arc::new(AlertManager::new(store.clone(), dispatcher, policy));
        let pipeline = Arc::new(HealthPipeline::new(tracker.clone(), alerts.clone()));
        let scheduler = Arc::new(Scheduler::new(pipeline, prober.clone(), settings));

        Self {
            store,
            tracker,
            alerts,
            scheduler,
            prober,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register every stored application. Health starts over as `unknown`.
    pub async fn start(&self) -> Result<usize, MonitorError> {
        let apps = self.store.list_applications()?;
        tracing::info!("Monitor: starting with {} application(s)", apps.len());

        let count = apps.len();
        for app in apps {
            self.scheduler.register(app).await;
        }
        Ok(count)
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop_all().await;
        tracing::info!("Monitor: all probe loops stopped");
    }

    // --- Applications ---

    pub async fn register_application(
        &self,
        req: &NewApplication,
    ) -> Result<Application, MonitorError> {
        let default_secs = self.scheduler.settings().default_interval.as_secs();
        let app = self.store.create_application(req, default_secs)?;
        self.scheduler.register(app.clone()).await;
        Ok(app)
    }

    /// Store the edit and re-arm the application's timer.
    ///
    /// Health counters survive edits that keep the probe target, and start
    /// over when the target changes.
    pub async fn update_application(
        &self,
        id: i64,
        req: &NewApplication,
    ) -> Result<Application, MonitorError> {
        let before = self.get_application(id)?;
        let updated = self
            .store
            .update_application(id, req)
            .map_err(|e| MonitorError::from_db(e, "application", id))?;

        if before.probe_target() != updated.probe_target() {
            self.scheduler.unregister(id).await;
        }
        self.scheduler.register(updated.clone()).await;
        Ok(updated)
    }

    /// Delete an application and stop probing it. Its alerts stay as history.
    pub async fn remove_application(&self, id: i64) -> Result<(), MonitorError> {
        self.store
            .delete_application(id)
            .map_err(|e| MonitorError::from_db(e, "application", id))?;
        self.scheduler.unregister(id).await;
        Ok(())
    }

    pub async fn reschedule(
        &self,
        id: i64,
        check_interval_secs: u64,
    ) -> Result<Application, MonitorError> {
        validate_check_interval(check_interval_secs)?;
        let app = self
            .store
            .set_check_interval(id, check_interval_secs)
            .map_err(|e| MonitorError::from_db(e, "application", id))?;
        if !self.scheduler.reschedule(id, check_interval_secs).await {
            self.scheduler.register(app.clone()).await;
        }
        Ok(app)
    }

    pub fn get_application(&self, id: i64) -> Result<Application, MonitorError> {
        self.store
            .get_application(id)
            .map_err(|e| MonitorError::from_db(e, "application", id))
    }

    pub fn list_applications(&self) -> Result<Vec<Application>, MonitorError> {
        Ok(self.store.list_applications()?)
    }

    // --- Health ---

    pub fn application_health(&self, id: i64) -> Result<ApplicationHealth, MonitorError> {
        let application = self.get_application(id)?;
        let open_alert_id = self.store.open_alert_for_application(id)?.map(|a| a.id);
        Ok(ApplicationHealth {
            health: self.tracker.snapshot(id),
            application,
            open_alert_id,
        })
    }

    /// Current health of every stored application.
    pub fn health_overview(&self) -> Result<Vec<ApplicationHealth>, MonitorError> {
        let open: HashMap<i64, i64> = self
            .store
            .list_open_alerts()?
            .into_iter()
            .filter_map(|alert| alert.application_id.map(|app_id| (app_id, alert.id)))
            .collect();
        let mut states = self.tracker.snapshot_all();

        let overview = self
            .store
            .list_applications()?
            .into_iter()
            .map(|application| ApplicationHealth {
                health: states.remove(&application.id).unwrap_or_default(),
                open_alert_id: open.get(&application.id).copied(),
                application,
            })
            .collect();
        Ok(overview)
    }

    /// Probe a target once, outside the scheduler. Health state is not touched.
    pub async fn check_target(&self, target: &ProbeTarget) -> Result<Verdict, MonitorError> {
        if target.host.trim().is_empty() {
            return Err(ValidationError::new("host", "must not be empty").into());
        }
        if target.port == 0 {
            return Err(ValidationError::new("port", "0 is outside 1-65535").into());
        }
        let timeout = self.scheduler.settings().probe_timeout;
        Ok(self.prober.probe(target, timeout).await)
    }

    // --- Alerts ---

    pub fn list_alerts(&self) -> Result<Vec<Alert>, MonitorError> {
        self.alerts.list()
    }

    pub fn list_open_alerts(&self) -> Result<Vec<Alert>, MonitorError> {
        self.alerts.list_open()
    }

    pub fn acknowledge_alert(&self, id: i64) -> Result<Alert, MonitorError> {
        self.alerts.acknowledge(id)
    }

    pub fn acknowledge_all_alerts(&self) -> Result<usize, MonitorError> {
        self.alerts.acknowledge_all()
    }

    // --- Subscriptions ---

    pub fn create_subscription(
        &self,
        req: &NewSubscription,
    ) -> Result<NotifySubscription, MonitorError> {
        let sub = self.store.create_subscription(req)?;
        tracing::info!("Monitor: added {} subscription {}", sub.channel, sub.id);
        Ok(sub)
    }

    pub fn get_subscription(&self, id: i64) -> Result<NotifySubscription, MonitorError> {
        self.store
            .get_subscription(id)
            .map_err(|e| MonitorError::from_db(e, "subscription", id))
    }

    pub fn list_subscriptions(&self) -> Result<Vec<NotifySubscription>, MonitorError> {
        Ok(self.store.list_subscriptions()?)
    }

    pub fn update_subscription(
        &self,
        id: i64,
        req: &NewSubscription,
    ) -> Result<NotifySubscription, MonitorError> {
        self.store
            .update_subscription(id, req)
            .map_err(|e| MonitorError::from_db(e, "subscription", id))
    }

    pub fn delete_subscription(&self, id: i64) -> Result<(), MonitorError> {
        self.store
            .delete_subscription(id)
            .map_err(|e| MonitorError::from_db(e, "subscription", id))
    }

    // --- Email queue ---

    pub fn list_email_queue(&self) -> Result<Vec<EmailQueueItem>, MonitorError> {
        Ok(self.store.list_emails()?)
    }

    /// Rows the queue processor would pick up right now.
    pub fn list_due_emails(&self) -> Result<Vec<EmailQueueItem>, MonitorError> {
        Ok(self.store.list_pending_emails(Utc::now())?)
    }

    pub fn email_queue_counts(&self) -> Result<EmailQueueCounts, MonitorError> {
        Ok(self.store.count_emails_by_state()?)
    }

    pub fn get_email(&self, id: i64) -> Result<EmailQueueItem, MonitorError> {
        self.store
            .get_email(id)
            .map_err(|e| MonitorError::from_db(e, "email", id))
    }
}
