//! Database model types.

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// A record field failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Declares a closed string enum that round-trips through serde, `FromStr`
/// and SQLite text columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ValidationError::new($field, format!("unknown value '{}'", other))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ValidationError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(
    /// URL scheme used when probing an application over HTTP.
    Protocol, "protocol", { Http => "http", Https => "https" }
);

text_enum!(
    /// How an application's health is checked.
    HealthType, "health_type", { Http => "http", Tcp => "tcp" }
);

text_enum!(Severity, "severity", { Low => "low", Medium => "medium", High => "high" });

text_enum!(Channel, "channel", { Email => "email", Webhook => "webhook" });

text_enum!(
    /// Lifecycle of one queued email: `pending -> sending -> (sent | error)`.
    EmailState, "state", {
        Pending => "pending",
        Sending => "sending",
        Sent => "sent",
        Error => "error",
    }
);

// ============================================================================
// Applications
// ============================================================================

/// A monitored application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub health_path: String,
    pub health_type: HealthType,
    pub check_interval_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Application {
    /// The endpoint the probe executor checks for this application.
    pub fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            health_type: self.health_type,
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            health_path: self.health_path.clone(),
        }
    }
}

/// Everything a single health probe needs to know about its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub health_type: HealthType,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl ProbeTarget {
    /// URL requested by HTTP health checks.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}://{}:{}{}", self.protocol, host, self.port, path)
    }

    /// `host:port` for bare TCP checks.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.health_type {
            HealthType::Http => f.write_str(&self.url()),
            HealthType::Tcp => write!(f, "tcp://{}", self.socket_addr()),
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// User-submitted application fields, validated before they reach the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: i64,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_type")]
    pub health_type: HealthType,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
}

fn default_health_type() -> HealthType {
    HealthType::Http
}

/// Longest check interval an application may ask for: one day.
pub const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Intervals must be positive and at most [`MAX_CHECK_INTERVAL_SECS`].
pub fn validate_check_interval(secs: u64) -> Result<(), ValidationError> {
    match secs {
        0 => Err(ValidationError::new("check_interval_secs", "must be positive")),
        s if s > MAX_CHECK_INTERVAL_SECS => Err(ValidationError::new(
            "check_interval_secs",
            format!("{} exceeds the maximum of {}", s, MAX_CHECK_INTERVAL_SECS),
        )),
        _ => Ok(()),
    }
}

impl NewApplication {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::new("host", "must not be empty"));
        }
        self.valid_port()?;
        if let Some(secs) = self.check_interval_secs {
            validate_check_interval(secs)?;
        }
        Ok(())
    }

    /// Port as a `u16`, rejecting anything outside 1-65535.
    pub fn valid_port(&self) -> Result<u16, ValidationError> {
        match u16::try_from(self.port) {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ValidationError::new(
                "port",
                format!("{} is outside 1-65535", self.port),
            )),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// An alert raised for an application (or any other source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub application_id: Option<i64>,
    pub source: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub application_id: Option<i64>,
    pub source: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl NewAlert {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("title", "must not be empty"));
        }
        if self.message.trim().is_empty() {
            return Err(ValidationError::new("message", "must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Notification subscriptions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySubscription {
    pub id: i64,
    pub channel: Channel,
    pub endpoint: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub channel: Channel,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewSubscription {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.channel {
            Channel::Email if self.endpoint.trim().is_empty() => {
                Err(ValidationError::new("endpoint", "email subscriptions need an address"))
            }
            Channel::Email if !is_valid_email(&self.endpoint) => Err(ValidationError::new(
                "endpoint",
                format!("'{}' is not an email address", self.endpoint),
            )),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Email queue
// ============================================================================

/// One queued email delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailQueueItem {
    pub id: i64,
    pub alert_id: Option<i64>,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
    pub state: EmailState,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Number of queue rows in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmailQueueCounts {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEmail {
    pub alert_id: Option<i64>,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
}

impl NewEmail {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_email(&self.to_addr) {
            return Err(ValidationError::new(
                "to_addr",
                format!("'{}' is not an email address", self.to_addr),
            ));
        }
        if self.subject.trim().is_empty() {
            return Err(ValidationError::new("subject", "must not be empty"));
        }
        Ok(())
    }
}

/// Syntactic address check; deliverability is the mailer's problem.
pub fn is_valid_email(addr: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)+$")
                .expect("email regex is valid")
        })
        .is_match(addr)
}
