//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
///
/// Every method is a single atomic call; no transaction spans two calls.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const APPLICATION_COLUMNS: &str =
    "id, name, protocol, host, port, path, health_path, health_type, check_interval_secs, created_at";
const ALERT_COLUMNS: &str =
    "id, application_id, source, severity, title, message, created_at, acknowledged, acknowledged_at";
const SUBSCRIPTION_COLUMNS: &str = "id, channel, endpoint, enabled, created_at";
const EMAIL_COLUMNS: &str =
    "id, alert_id, to_addr, subject, body, state, created_at, sent_at, last_error, attempts, next_attempt_at";

/// Rows a processor may claim at `?1`: fresh rows, and failed rows whose backoff has elapsed.
const ELIGIBLE_EMAIL: &str =
    "state = 'pending' OR (state = 'error' AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?1)";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Applications ---

    /// Insert a validated application and return the stored record.
    pub fn create_application(
        &self,
        req: &NewApplication,
        default_interval_secs: u64,
    ) -> Result<Application, DbError> {
        req.validate()?;
        let port = req.valid_port()?;
        let interval = req.check_interval_secs.unwrap_or(default_interval_secs);
        let interval_column = interval_to_column(interval)?;
        let created_at = Utc::now();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO applications (name, protocol, host, port, path, health_path, health_type, check_interval_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                req.name.trim(),
                req.protocol,
                req.host.trim(),
                port,
                req.path,
                req.health_path,
                req.health_type,
                interval_column,
                format_db_time(created_at),
            ],
        )?;

        Ok(Application {
            id: conn.last_insert_rowid(),
            name: req.name.trim().to_string(),
            protocol: req.protocol,
            host: req.host.trim().to_string(),
            port,
            path: req.path.clone(),
            health_path: req.health_path.clone(),
            health_type: req.health_type,
            check_interval_secs: interval,
            created_at,
        })
    }

    /// Get an application by ID.
    pub fn get_application(&self, id: i64) -> Result<Application, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM applications WHERE id = ?1", APPLICATION_COLUMNS),
            params![id],
            application_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get all applications.
    pub fn list_applications(&self) -> Result<Vec<Application>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM applications ORDER BY id",
            APPLICATION_COLUMNS
        ))?;
        let apps = stmt
            .query_map([], application_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(apps)
    }

    /// Replace an application's editable fields and return the updated record.
    pub fn update_application(
        &self,
        id: i64,
        req: &NewApplication,
    ) -> Result<Application, DbError> {
        req.validate()?;
        let port = req.valid_port()?;
        let interval = req.check_interval_secs.map(interval_to_column).transpose()?;

        let conn = self.conn()?;
        let updated = conn
            .query_row(
                &format!(
                    "UPDATE applications SET name = ?1, protocol = ?2, host = ?3, port = ?4, path = ?5,
                         health_path = ?6, health_type = ?7,
                         check_interval_secs = COALESCE(?8, check_interval_secs)
                     WHERE id = ?9 RETURNING {}",
                    APPLICATION_COLUMNS
                ),
                params![
                    req.name.trim(),
                    req.protocol,
                    req.host.trim(),
                    port,
                    req.path,
                    req.health_path,
                    req.health_type,
                    interval,
                    id,
                ],
                application_from_row,
            )
            .optional()?;
        updated.ok_or(DbError::NotFound)
    }

    /// Change only the check interval of an application.
    pub fn set_check_interval(&self, id: i64, secs: u64) -> Result<Application, DbError> {
        let secs = interval_to_column(secs)?;
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "UPDATE applications SET check_interval_secs = ?1 WHERE id = ?2 RETURNING {}",
                APPLICATION_COLUMNS
            ),
            params![secs, id],
            application_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete an application. Its alerts are kept as history.
    pub fn delete_application(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM applications WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Alerts ---

    /// Insert an alert unconditionally.
    pub fn create_alert(&self, alert: &NewAlert) -> Result<Alert, DbError> {
        alert.validate()?;
        let conn = self.conn()?;
        let created = conn.query_row(
            &format!(
                "INSERT INTO alerts (application_id, source, severity, title, message, created_at, acknowledged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0) RETURNING {}",
                ALERT_COLUMNS
            ),
            params![
                alert.application_id,
                alert.source,
                alert.severity,
                alert.title,
                alert.message,
                format_db_time(Utc::now()),
            ],
            alert_from_row,
        )?;
        Ok(created)
    }

    /// Insert an alert unless its application already has an unacknowledged one.
    ///
    /// Returns `None` when the insert was suppressed. The check and the insert
    /// are a single statement guarded by the one-open-alert unique index.
    pub fn create_alert_if_none_open(&self, alert: &NewAlert) -> Result<Option<Alert>, DbError> {
        alert.validate()?;
        let conn = self.conn()?;
        let created = conn
            .query_row(
                &format!(
                    "INSERT INTO alerts (application_id, source, severity, title, message, created_at, acknowledged)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                     ON CONFLICT DO NOTHING RETURNING {}",
                    ALERT_COLUMNS
                ),
                params![
                    alert.application_id,
                    alert.source,
                    alert.severity,
                    alert.title,
                    alert.message,
                    format_db_time(Utc::now()),
                ],
                alert_from_row,
            )
            .optional()?;
        Ok(created)
    }

    pub fn get_alert(&self, id: i64) -> Result<Alert, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
            params![id],
            alert_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All alerts, newest first.
    pub fn list_alerts(&self) -> Result<Vec<Alert>, DbError> {
        self.query_alerts("SELECT {} FROM alerts ORDER BY id DESC")
    }

    /// Unacknowledged alerts, newest first.
    pub fn list_open_alerts(&self) -> Result<Vec<Alert>, DbError> {
        self.query_alerts("SELECT {} FROM alerts WHERE acknowledged = 0 ORDER BY id DESC")
    }

    fn query_alerts(&self, template: &str) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&template.replace("{}", ALERT_COLUMNS))?;
        let alerts = stmt
            .query_map([], alert_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    /// The unacknowledged alert for an application, if any.
    pub fn open_alert_for_application(
        &self,
        application_id: i64,
    ) -> Result<Option<Alert>, DbError> {
        let conn = self.conn()?;
        let alert = conn
            .query_row(
                &format!(
                    "SELECT {} FROM alerts WHERE application_id = ?1 AND acknowledged = 0",
                    ALERT_COLUMNS
                ),
                params![application_id],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    /// Mark one alert acknowledged. Acknowledging twice is a no-op.
    pub fn acknowledge_alert(&self, id: i64) -> Result<Alert, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "UPDATE alerts SET acknowledged = 1, acknowledged_at = COALESCE(acknowledged_at, ?1)
                 WHERE id = ?2 RETURNING {}",
                ALERT_COLUMNS
            ),
            params![format_db_time(Utc::now()), id],
            alert_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Acknowledge every open alert in one statement; returns how many changed.
    pub fn acknowledge_all_alerts(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alerts SET acknowledged = 1, acknowledged_at = ?1 WHERE acknowledged = 0",
            params![format_db_time(Utc::now())],
        )?;
        Ok(n)
    }

    /// Acknowledge the open alerts raised for one application.
    pub fn acknowledge_alerts_for_application(
        &self,
        application_id: i64,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alerts SET acknowledged = 1, acknowledged_at = ?1
             WHERE acknowledged = 0 AND application_id = ?2",
            params![format_db_time(Utc::now()), application_id],
        )?;
        Ok(n)
    }

    // --- Notification subscriptions ---

    pub fn create_subscription(
        &self,
        sub: &NewSubscription,
    ) -> Result<NotifySubscription, DbError> {
        sub.validate()?;
        let conn = self.conn()?;
        let created = conn.query_row(
            &format!(
                "INSERT INTO notify_subscriptions (channel, endpoint, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                SUBSCRIPTION_COLUMNS
            ),
            params![
                sub.channel,
                sub.endpoint.trim(),
                sub.enabled,
                format_db_time(Utc::now()),
            ],
            subscription_from_row,
        )?;
        Ok(created)
    }

    pub fn get_subscription(&self, id: i64) -> Result<NotifySubscription, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM notify_subscriptions WHERE id = ?1", SUBSCRIPTION_COLUMNS),
            params![id],
            subscription_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn list_subscriptions(&self) -> Result<Vec<NotifySubscription>, DbError> {
        self.query_subscriptions("SELECT {} FROM notify_subscriptions ORDER BY id")
    }

    pub fn list_enabled_subscriptions(&self) -> Result<Vec<NotifySubscription>, DbError> {
        self.query_subscriptions(
            "SELECT {} FROM notify_subscriptions WHERE enabled = 1 ORDER BY id",
        )
    }

    fn query_subscriptions(&self, template: &str) -> Result<Vec<NotifySubscription>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&template.replace("{}", SUBSCRIPTION_COLUMNS))?;
        let subs = stmt
            .query_map([], subscription_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(subs)
    }

    pub fn update_subscription(
        &self,
        id: i64,
        sub: &NewSubscription,
    ) -> Result<NotifySubscription, DbError> {
        sub.validate()?;
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "UPDATE notify_subscriptions SET channel = ?1, endpoint = ?2, enabled = ?3
                 WHERE id = ?4 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            ),
            params![sub.channel, sub.endpoint.trim(), sub.enabled, id],
            subscription_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn delete_subscription(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM notify_subscriptions WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Email queue ---

    /// Validate and append a `pending` row.
    pub fn enqueue_email(&self, email: &NewEmail) -> Result<EmailQueueItem, DbError> {
        email.validate()?;
        let conn = self.conn()?;
        let created = conn.query_row(
            &format!(
                "INSERT INTO email_queue (alert_id, to_addr, subject, body, state, created_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0) RETURNING {}",
                EMAIL_COLUMNS
            ),
            params![
                email.alert_id,
                email.to_addr.trim(),
                email.subject,
                email.body,
                format_db_time(Utc::now()),
            ],
            email_from_row,
        )?;
        Ok(created)
    }

    pub fn get_email(&self, id: i64) -> Result<EmailQueueItem, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM email_queue WHERE id = ?1", EMAIL_COLUMNS),
            params![id],
            email_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All queue rows, newest first.
    pub fn list_emails(&self) -> Result<Vec<EmailQueueItem>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM email_queue ORDER BY id DESC",
            EMAIL_COLUMNS
        ))?;
        let emails = stmt
            .query_map([], email_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(emails)
    }

    /// Per-state row counts, computed by SQLite.
    pub fn count_emails_by_state(&self) -> Result<EmailQueueCounts, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM email_queue GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, EmailState>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut counts = EmailQueueCounts::default();
        for (state, n) in rows {
            let n = usize::try_from(n).unwrap_or_default();
            match state {
                EmailState::Pending => counts.pending = n,
                EmailState::Sending => counts.sending = n,
                EmailState::Sent => counts.sent = n,
                EmailState::Error => counts.error = n,
            }
        }
        Ok(counts)
    }

    /// Rows eligible for delivery at `now`, oldest first.
    pub fn list_pending_emails(&self, now: DateTime<Utc>) -> Result<Vec<EmailQueueItem>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM email_queue WHERE {} ORDER BY id",
            EMAIL_COLUMNS, ELIGIBLE_EMAIL
        ))?;
        let emails = stmt
            .query_map(params![format_db_time(now)], email_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(emails)
    }

    /// Claim the oldest eligible row by moving it to `sending`.
    ///
    /// The update only applies while the row is still in an eligible state, so
    /// two claimers never receive the same row. The returned row carries the
    /// incremented attempt count.
    pub fn claim_next_email(&self, now: DateTime<Utc>) -> Result<Option<EmailQueueItem>, DbError> {
        let conn = self.conn()?;
        let claimed = conn
            .query_row(
                &format!(
                    "UPDATE email_queue SET state = 'sending', attempts = attempts + 1, next_attempt_at = NULL
                     WHERE id = (SELECT id FROM email_queue WHERE {eligible} ORDER BY id LIMIT 1)
                       AND ({eligible})
                     RETURNING {columns}",
                    eligible = ELIGIBLE_EMAIL,
                    columns = EMAIL_COLUMNS
                ),
                params![format_db_time(now)],
                email_from_row,
            )
            .optional()?;
        Ok(claimed)
    }

    /// Set a row's state directly. `sent` stamps the sent time and `error`
    /// keeps or fills in an error text so the row stays consistent.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn update_email_status(&self, id: i64, state: EmailState) -> Result<(), DbError> {
        let conn = self.conn()?;
        let now = format_db_time(Utc::now());
        let n = match state {
            EmailState::Sent => conn.execute(
                "UPDATE email_queue SET state = 'sent', sent_at = COALESCE(sent_at, ?1) WHERE id = ?2",
                params![now, id],
            )?,
            EmailState::Error => conn.execute(
                "UPDATE email_queue SET state = 'error', last_error = COALESCE(last_error, 'marked as failed') WHERE id = ?1",
                params![id],
            )?,
            other => conn.execute(
                "UPDATE email_queue SET state = ?1 WHERE id = ?2",
                params![other, id],
            )?,
        };
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn mark_email_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE email_queue SET state = 'sent', sent_at = ?1, last_error = NULL, next_attempt_at = NULL
             WHERE id = ?2",
            params![format_db_time(sent_at), id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Record a failed attempt. `retry_at = None` leaves the row terminal.
    pub fn mark_email_error(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE email_queue SET state = 'error', last_error = ?1, next_attempt_at = ?2 WHERE id = ?3",
            params![error, retry_at.map(format_db_time), id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Return rows left in `sending` by a crashed process to `pending`.
    pub fn requeue_stale_sending(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE email_queue SET state = 'pending' WHERE state = 'sending'",
            [],
        )?;
        Ok(n)
    }
}

fn application_from_row(row: &Row<'_>) -> SqlResult<Application> {
    Ok(Application {
        id: row.get(0)?,
        name: row.get(1)?,
        protocol: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        path: row.get(5)?,
        health_path: row.get(6)?,
        health_type: row.get(7)?,
        check_interval_secs: interval_from_column(row, 8)?,
        created_at: time_column(row, 9)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> SqlResult<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        application_id: row.get(1)?,
        source: row.get(2)?,
        severity: row.get(3)?,
        title: row.get(4)?,
        message: row.get(5)?,
        created_at: time_column(row, 6)?,
        acknowledged: row.get(7)?,
        acknowledged_at: optional_time_column(row, 8)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> SqlResult<NotifySubscription> {
    Ok(NotifySubscription {
        id: row.get(0)?,
        channel: row.get(1)?,
        endpoint: row.get(2)?,
        enabled: row.get(3)?,
        created_at: time_column(row, 4)?,
    })
}

fn email_from_row(row: &Row<'_>) -> SqlResult<EmailQueueItem> {
    Ok(EmailQueueItem {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        to_addr: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        state: row.get(5)?,
        created_at: time_column(row, 6)?,
        sent_at: optional_time_column(row, 7)?,
        last_error: row.get(8)?,
        attempts: row.get(9)?,
        next_attempt_at: optional_time_column(row, 10)?,
    })
}

fn interval_to_column(secs: u64) -> Result<i64, ValidationError> {
    validate_check_interval(secs)?;
    i64::try_from(secs).map_err(|_| ValidationError::new("check_interval_secs", "out of range"))
}

fn interval_from_column(row: &Row<'_>, idx: usize) -> SqlResult<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| bad_time(idx, raw))
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_db_time(&raw).map(Some).ok_or_else(|| bad_time(idx, raw)),
        None => Ok(None),
    }
}

fn bad_time(idx: usize, raw: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unparseable timestamp '{}'", raw).into(),
    )
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Timestamps are stored as fixed-width UTC text so they also compare correctly as strings.
fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
