//! What happens to a verdict once a probe returns.

use crate::alerts::AlertManager;
use crate::db::Application;
use crate::health::{HealthTracker, StateTransition};
use crate::probe::Verdict;

use std::sync::Arc;

/// Tracker followed by alert manager, run once per completed probe.
pub struct HealthPipeline {
    tracker: Arc<HealthTracker>,
    alerts: Arc<AlertManager>,
}

impl HealthPipeline {
    pub fn new(tracker: Arc<HealthTracker>, alerts: Arc<AlertManager>) -> Self {
        Self { tracker, alerts }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    /// Feed one verdict through the tracker and, on a transition, the alert manager.
    ///
    /// If the alert manager fails the status change is rolled back, so the
    /// next tick in the same direction fires the transition again.
    pub fn process(&self, app: &Application, verdict: &Verdict) -> Option<StateTransition> {
        let transition = self.tracker.record(app.id, verdict)?;
        tracing::info!(
            "Scheduler: {} went {} -> {}",
            app.name,
            transition.from,
            transition.to
        );

        if let Err(e) = self.alerts.handle_transition(app, &transition) {
            tracing::error!(
                "Scheduler: handling transition of {} failed, will retry next tick: {}",
                app.name,
                e
            );
            self.tracker.rollback(&transition);
        }
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertPolicy, Thresholds};
    use crate::db::{HealthType, NewApplication, Protocol, Store};
    use crate::health::HealthStatus;
    use crate::notify::Dispatcher;

    fn request() -> NewApplication {
        NewApplication {
            name: "api".to_string(),
            protocol: Protocol::Https,
            host: "api.example.com".to_string(),
            port: 443,
            path: "/".to_string(),
            health_path: "/health".to_string(),
            health_type: HealthType::Http,
            check_interval_secs: None,
        }
    }

    fn pipeline_for(store: &Arc<Store>) -> HealthPipeline {
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));
        let alerts = Arc::new(AlertManager::new(
            store.clone(),
            dispatcher,
            AlertPolicy::default(),
        ));
        let tracker = Arc::new(HealthTracker::new(Thresholds::default()));
        HealthPipeline::new(tracker, alerts)
    }

    fn setup() -> (Arc<Store>, HealthPipeline, Application) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let app = store.create_application(&request(), 30).unwrap();
        let pipeline = pipeline_for(&store);
        (store, pipeline, app)
    }

    #[test]
    fn test_ok_fail_fail_raises_one_alert() {
        let (store, pipeline, app) = setup();

        assert!(pipeline.process(&app, &Verdict::healthy(3)).is_none());
        assert_eq!(pipeline.tracker().snapshot(app.id).status, HealthStatus::Unknown);

        assert!(pipeline.process(&app, &Verdict::failed(3, "boom")).is_none());
        let state = pipeline.tracker().snapshot(app.id);
        assert_eq!(state.status, HealthStatus::Unknown);
        assert_eq!(state.consecutive_failures, 1);
        assert!(store.list_alerts().unwrap().is_empty());

        let transition = pipeline.process(&app, &Verdict::failed(3, "boom")).unwrap();
        assert_eq!(transition.to, HealthStatus::Unhealthy);
        assert_eq!(store.list_alerts().unwrap().len(), 1);

        // Staying down does not raise more alerts.
        assert!(pipeline.process(&app, &Verdict::failed(3, "boom")).is_none());
        assert_eq!(store.list_alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_alert_storage_rolls_back_transition() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let app = store.create_application(&request(), 30).unwrap();
        let pipeline = pipeline_for(&store);

        // A second connection hides the alerts table from the store.
        let side = rusqlite::Connection::open(tmp.path()).unwrap();
        side.execute_batch("ALTER TABLE alerts RENAME TO alerts_hidden").unwrap();

        pipeline.process(&app, &Verdict::failed(3, "boom"));
        pipeline.process(&app, &Verdict::failed(3, "boom"));
        let state = pipeline.tracker().snapshot(app.id);
        assert_eq!(state.status, HealthStatus::Unknown);
        assert_eq!(state.consecutive_failures, 2);

        side.execute_batch("ALTER TABLE alerts_hidden RENAME TO alerts").unwrap();

        // The next failing tick fires the transition again.
        let transition = pipeline.process(&app, &Verdict::failed(3, "boom")).unwrap();
        assert_eq!(transition.to, HealthStatus::Unhealthy);
        assert_eq!(store.list_open_alerts().unwrap().len(), 1);
    }
}
