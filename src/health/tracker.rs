//! Per-application health state with debounced transitions.

use crate::config::Thresholds;
use crate::probe::Verdict;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Health of one application as seen by its probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_latency_ms: None,
            last_status_code: None,
            last_error: None,
        }
    }
}

impl HealthState {
    /// Fold one verdict into the state.
    ///
    /// Returns `(from, to)` when the verdict completes a streak long enough to
    /// change the status.
    pub fn apply(
        &mut self,
        verdict: &Verdict,
        thresholds: Thresholds,
    ) -> Option<(HealthStatus, HealthStatus)> {
        self.last_probe_at = Some(verdict.checked_at);
        self.last_latency_ms = Some(verdict.latency_ms);
        self.last_status_code = verdict.status_code;
        self.last_error = verdict.error.clone();

        let from = self.status;
        if verdict.ok {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            let reached = self.consecutive_successes >= thresholds.success.max(1);
            if from != HealthStatus::Healthy && reached {
                self.status = HealthStatus::Healthy;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            let reached = self.consecutive_failures >= thresholds.failure.max(1);
            if from != HealthStatus::Unhealthy && reached {
                self.status = HealthStatus::Unhealthy;
            }
        }

        (self.status != from).then_some((from, self.status))
    }
}

/// A debounced status change, handed to the alert manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub application_id: i64,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub verdict: Verdict,
}

/// Owns the health state of every monitored application.
///
/// Callers must not feed verdicts for the same application concurrently;
/// the scheduler guarantees one probe in flight per application. The map
/// lock only guards the registry itself and is never held across an await.
pub struct HealthTracker {
    thresholds: Thresholds,
    states: Mutex<HashMap<i64, HealthState>>,
}

impl HealthTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn states(&self) -> MutexGuard<'_, HashMap<i64, HealthState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a verdict for an application, returning the transition it caused.
    pub fn record(&self, application_id: i64, verdict: &Verdict) -> Option<StateTransition> {
        let mut states = self.states();
        let state = states.entry(application_id).or_default();
        let (from, to) = state.apply(verdict, self.thresholds)?;

        Some(StateTransition {
            application_id,
            from,
            to,
            verdict: verdict.clone(),
        })
    }

    /// Undo the status change of a transition whose side effects failed.
    ///
    /// The streak counters are kept, so the next verdict in the same
    /// direction fires the transition again.
    pub fn rollback(&self, transition: &StateTransition) {
        if let Some(state) = self.states().get_mut(&transition.application_id) {
            if state.status == transition.to {
                state.status = transition.from;
            }
        }
    }

    /// Current state of an application; `unknown` if never probed.
    pub fn snapshot(&self, application_id: i64) -> HealthState {
        self.states()
            .get(&application_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot_all(&self) -> HashMap<i64, HealthState> {
        self.states().clone()
    }

    /// Drop an application's state, e.g. after it was removed.
    pub fn forget(&self, application_id: i64) {
        self.states().remove(&application_id);
    }
}
