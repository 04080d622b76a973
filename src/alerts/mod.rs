//! Alert lifecycle: creation on health transitions, deduplication and acknowledgement.

use crate::config::{AlertPolicy, RecoveryPolicy};
use crate::db::{Alert, Application, NewAlert, Store};
use crate::error::MonitorError;
use crate::health::{HealthStatus, StateTransition};
use crate::notify::Dispatcher;

use std::sync::Arc;

/// Creates and acknowledges alerts.
///
/// An application never has more than one unacknowledged alert. The check
/// and the insert happen in one store call, so concurrent transitions for
/// different applications cannot break the rule either.
pub struct AlertManager {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    policy: AlertPolicy,
}

impl AlertManager {
    pub fn new(store: Arc<Store>, dispatcher: Arc<Dispatcher>, policy: AlertPolicy) -> Self {
        Self {
            store,
            dispatcher,
            policy,
        }
    }

    /// React to a debounced health transition.
    ///
    /// Returns the alert that was created, if any. Only store failures are
    /// errors; notification problems are logged and do not undo the alert.
    pub fn handle_transition(
        &self,
        app: &Application,
        transition: &StateTransition,
    ) -> Result<Option<Alert>, MonitorError> {
        match transition.to {
            HealthStatus::Unhealthy => self.raise_for(app, transition),
            HealthStatus::Healthy if transition.from == HealthStatus::Unhealthy => {
                self.on_recovery(app)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn raise_for(
        &self,
        app: &Application,
        transition: &StateTransition,
    ) -> Result<Option<Alert>, MonitorError> {
        let reason = transition
            .verdict
            .error
            .as_deref()
            .unwrap_or("health check failed");
        let new_alert = NewAlert {
            application_id: Some(app.id),
            source: app.name.clone(),
            severity: self.policy.severity,
            title: format!("{} is down", app.name),
            message: format!(
                "Health check of {} failed: {}",
                app.probe_target(),
                reason
            ),
        };

        let Some(alert) = self.store.create_alert_if_none_open(&new_alert)? else {
            tracing::info!(
                "AlertManager: {} already has an open alert, not raising another",
                app.name
            );
            return Ok(None);
        };

        tracing::warn!(
            "AlertManager: raised {} alert {} for {}",
            alert.severity,
            alert.id,
            app.name
        );
        if let Err(e) = self.dispatcher.dispatch(&alert) {
            tracing::error!("AlertManager: notifying for alert {} failed: {}", alert.id, e);
        }
        Ok(Some(alert))
    }

    fn on_recovery(&self, app: &Application) -> Result<(), MonitorError> {
        match self.policy.recovery {
            RecoveryPolicy::KeepOpen => {
                tracing::info!("AlertManager: {} recovered", app.name);
            }
            RecoveryPolicy::AutoAcknowledge => {
                let n = self.store.acknowledge_alerts_for_application(app.id)?;
                tracing::info!(
                    "AlertManager: {} recovered, auto-acknowledged {} alert(s)",
                    app.name,
                    n
                );
            }
        }
        Ok(())
    }

    pub fn acknowledge(&self, alert_id: i64) -> Result<Alert, MonitorError> {
        let alert = self
            .store
            .acknowledge_alert(alert_id)
            .map_err(|e| MonitorError::from_db(e, "alert", alert_id))?;
        tracing::info!("AlertManager: alert {} acknowledged", alert_id);
        Ok(alert)
    }

    /// Acknowledge every open alert; returns how many were open.
    pub fn acknowledge_all(&self) -> Result<usize, MonitorError> {
        let n = self.store.acknowledge_all_alerts()?;
        tracing::info!("AlertManager: acknowledged {} alert(s)", n);
        Ok(n)
    }

    pub fn list(&self) -> Result<Vec<Alert>, MonitorError> {
        Ok(self.store.list_alerts()?)
    }

    pub fn list_open(&self) -> Result<Vec<Alert>, MonitorError> {
        Ok(self.store.list_open_alerts()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Channel, HealthType, NewApplication, NewSubscription, Protocol, Severity};
    use crate::probe::Verdict;
    use HealthStatus::{Healthy, Unhealthy, Unknown};

    fn setup(policy: AlertPolicy) -> (Arc<Store>, AlertManager, Application) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let app = store
            .create_application(
                &NewApplication {
                    name: "billing".to_string(),
                    protocol: Protocol::Http,
                    host: "billing.internal".to_string(),
                    port: 8080,
                    path: "/".to_string(),
                    health_path: "/health".to_string(),
                    health_type: HealthType::Http,
                    check_interval_secs: None,
                },
                30,
            )
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));
        let manager = AlertManager::new(store.clone(), dispatcher, policy);
        (store, manager, app)
    }

    fn transition(app: &Application, from: HealthStatus, to: HealthStatus) -> StateTransition {
        StateTransition {
            application_id: app.id,
            from,
            to,
            verdict: if to == HealthStatus::Healthy {
                Verdict::healthy(5)
            } else {
                Verdict::failed(5, "connection refused")
            },
        }
    }

    #[test]
    fn test_unhealthy_transition_raises_alert_and_notifies() {
        let (store, manager, app) = setup(AlertPolicy::default());
        store
            .create_subscription(&NewSubscription {
                channel: Channel::Email,
                endpoint: "ops@example.com".to_string(),
                enabled: true,
            })
            .unwrap();

        let alert = manager
            .handle_transition(&app, &transition(&app, Healthy, Unhealthy))
            .unwrap()
            .unwrap();
        assert_eq!(alert.application_id, Some(app.id));
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.source, "billing");
        assert!(alert.message.contains("connection refused"));

        let emails = store.list_emails().unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].alert_id, Some(alert.id));
    }

    #[test]
    fn test_open_alert_is_not_duplicated() {
        let (store, manager, app) = setup(AlertPolicy::default());
        let down = transition(&app, HealthStatus::Healthy, HealthStatus::Unhealthy);

        assert!(manager.handle_transition(&app, &down).unwrap().is_some());
        assert!(manager.handle_transition(&app, &down).unwrap().is_none());
        assert_eq!(store.list_open_alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_recovery_keeps_alert_open_by_default() {
        let (store, manager, app) = setup(AlertPolicy::default());
        manager
            .handle_transition(&app, &transition(&app, Unknown, Unhealthy))
            .unwrap();

        let up = transition(&app, HealthStatus::Unhealthy, HealthStatus::Healthy);
        assert!(manager.handle_transition(&app, &up).unwrap().is_none());
        assert_eq!(store.list_open_alerts().unwrap().len(), 1);
        assert_eq!(store.list_alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_recovery_auto_acknowledge_policy() {
        let (store, manager, app) = setup(AlertPolicy {
            severity: Severity::Medium,
            recovery: RecoveryPolicy::AutoAcknowledge,
        });
        let alert = manager
            .handle_transition(&app, &transition(&app, Healthy, Unhealthy))
            .unwrap()
            .unwrap();
        assert_eq!(alert.severity, Severity::Medium);

        manager
            .handle_transition(&app, &transition(&app, Unhealthy, Healthy))
            .unwrap();
        assert!(store.list_open_alerts().unwrap().is_empty());
        assert!(store.get_alert(alert.id).unwrap().acknowledged);
    }

    #[test]
    fn test_acknowledge() {
        let (_, manager, app) = setup(AlertPolicy::default());
        let alert = manager
            .handle_transition(&app, &transition(&app, Healthy, Unhealthy))
            .unwrap()
            .unwrap();

        assert!(manager.acknowledge(alert.id).unwrap().acknowledged);
        assert!(matches!(
            manager.acknowledge(12345),
            Err(MonitorError::NotFound { entity: "alert", id: 12345 })
        ));

        // A new failure after acknowledgement opens a fresh alert.
        let again = manager
            .handle_transition(&app, &transition(&app, Healthy, Unhealthy))
            .unwrap();
        assert!(again.is_some());
        assert_eq!(manager.acknowledge_all().unwrap(), 1);
        assert!(manager.list_open().unwrap().is_empty());
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_transitions_across_applications() {
        let (store, manager, _) = setup(AlertPolicy::default());
        let manager = Arc::new(manager);

        let apps: Vec<Application> = (0..8)
            .map(|i| {
                store
                    .create_application(
                        &NewApplication {
                            name: format!("app-{}", i),
                            protocol: Protocol::Http,
                            host: "localhost".to_string(),
                            port: 9000 + i,
                            path: "/".to_string(),
                            health_path: "/health".to_string(),
                            health_type: HealthType::Tcp,
                            check_interval_secs: None,
                        },
                        30,
                    )
                    .unwrap()
            })
            .collect();

        std::thread::scope(|scope| {
            for app in &apps {
                for _ in 0..3 {
                    let manager = manager.clone();
                    scope.spawn(move || {
                        let down = transition(app, HealthStatus::Healthy, HealthStatus::Unhealthy);
                        manager.handle_transition(app, &down).unwrap();
                    });
                }
            }
        });

        let open = store.list_open_alerts().unwrap();
        assert_eq!(open.len(), apps.len());
        for app in &apps {
            assert_eq!(
                open.iter().filter(|a| a.application_id == Some(app.id)).count(),
                1
            );
        }
    }
}
