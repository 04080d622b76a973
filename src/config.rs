//! Configuration module for nexboard.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::db::{Severity, MAX_CHECK_INTERVAL_SECS};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What happens to an application's open alert when it recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// The alert stays open until someone acknowledges it.
    KeepOpen,
    /// The alert is acknowledged automatically on `unhealthy -> healthy`.
    AutoAcknowledge,
}

impl FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_open" => Ok(Self::KeepOpen),
            "auto_acknowledge" => Ok(Self::AutoAcknowledge),
            other => Err(format!("unknown recovery policy: {}", other)),
        }
    }
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    /// Interval used when an application does not set its own.
    pub default_interval: Duration,
    /// Floor applied to every application's interval.
    pub min_interval: Duration,
    /// Per-probe timeout, independent of the interval.
    pub probe_timeout: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ScheduleSettings {
    /// The interval an application actually runs at.
    pub fn effective_interval(&self, check_interval_secs: u64) -> Duration {
        Duration::from_secs(check_interval_secs).max(self.min_interval)
    }
}

/// Debounce thresholds for health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub success: u32,
    pub failure: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            success: 2,
            failure: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub severity: Severity,
    pub recovery: RecoveryPolicy,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            severity: Severity::High,
            recovery: RecoveryPolicy::KeepOpen,
        }
    }
}

/// Email queue processor settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub workers: usize,
    pub send_timeout: Duration,
    pub from_addr: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
            workers: 4,
            send_timeout: Duration::from_secs(10),
            from_addr: "nexboard@localhost".to_string(),
        }
    }
}

/// Full configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "nexboard.db")
    pub db_path: String,
    pub schedule: ScheduleSettings,
    pub thresholds: Thresholds,
    pub alerts: AlertPolicy,
    pub queue: QueueSettings,
    /// Used for webhook subscriptions that have no endpoint of their own.
    pub webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "nexboard.db".to_string(),
            schedule: ScheduleSettings::default(),
            thresholds: Thresholds::default(),
            alerts: AlertPolicy::default(),
            queue: QueueSettings::default(),
            webhook_url: None,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparseable values are logged and the
    /// default is kept. Variables are prefixed `NEXBOARD_`, e.g.
    /// `NEXBOARD_HTTP_PORT`, `NEXBOARD_DB_PATH`, `NEXBOARD_FAIL_THRESHOLD`,
    /// `NEXBOARD_EMAIL_MAX_ATTEMPTS`.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(&format!("NEXBOARD_{}", key));

        set_parsed(&mut cfg.http_port, &get, "HTTP_PORT");
        if let Some(db_path) = get("DB_PATH") {
            cfg.db_path = db_path;
        }

        set_secs(&mut cfg.schedule.default_interval, &get, "DEFAULT_CHECK_INTERVAL_SECS");
        set_secs(&mut cfg.schedule.min_interval, &get, "MIN_CHECK_INTERVAL_SECS");
        set_secs(&mut cfg.schedule.probe_timeout, &get, "PROBE_TIMEOUT_SECS");

        set_parsed(&mut cfg.thresholds.success, &get, "SUCCESS_THRESHOLD");
        set_parsed(&mut cfg.thresholds.failure, &get, "FAIL_THRESHOLD");
        cfg.thresholds.success = cfg.thresholds.success.max(1);
        cfg.thresholds.failure = cfg.thresholds.failure.max(1);

        set_parsed(&mut cfg.alerts.severity, &get, "ALERT_SEVERITY");
        set_parsed(&mut cfg.alerts.recovery, &get, "RECOVERY_POLICY");

        set_secs(&mut cfg.queue.poll_interval, &get, "EMAIL_POLL_INTERVAL_SECS");
        set_parsed(&mut cfg.queue.max_attempts, &get, "EMAIL_MAX_ATTEMPTS");
        set_secs(&mut cfg.queue.backoff_base, &get, "EMAIL_BACKOFF_BASE_SECS");
        set_secs(&mut cfg.queue.backoff_max, &get, "EMAIL_BACKOFF_MAX_SECS");
        set_parsed(&mut cfg.queue.workers, &get, "EMAIL_WORKERS");
        set_secs(&mut cfg.queue.send_timeout, &get, "MAIL_TIMEOUT_SECS");
        if let Some(from) = get("MAIL_FROM") {
            cfg.queue.from_addr = from;
        }
        cfg.queue.max_attempts = cfg.queue.max_attempts.max(1);
        // Timers panic on a zero period.
        cfg.schedule.min_interval = cfg.schedule.min_interval.max(Duration::from_secs(1));
        cfg.queue.poll_interval = cfg.queue.poll_interval.max(Duration::from_millis(100));
        cfg.queue.workers = cfg.queue.workers.max(1);
        // The default is stored on every application that does not set its own.
        cfg.schedule.default_interval = cfg.schedule.default_interval.clamp(
            Duration::from_secs(1),
            Duration::from_secs(MAX_CHECK_INTERVAL_SECS),
        );

        cfg.webhook_url = get("WEBHOOK_URL").filter(|url| !url.trim().is_empty());

        cfg
    }
}

fn set_parsed<T>(slot: &mut T, get: &impl Fn(&str) -> Option<String>, key: &str)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => tracing::warn!("Ignoring NEXBOARD_{}={:?}: {}", key, raw, e),
        }
    }
}

fn set_secs(slot: &mut Duration, get: &impl Fn(&str) -> Option<String>, key: &str) {
    let mut secs = slot.as_secs();
    set_parsed(&mut secs, get, key);
    *slot = Duration::from_secs(secs);
}
