//! Background delivery of queued emails with retry and backoff.

use crate::config::QueueSettings;
use crate::db::{EmailQueueItem, Store};
use crate::notify::{DeliveryError, Mailer, OutgoingEmail};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Delay before retrying after the `attempt`-th failed delivery.
///
/// Doubles from `base` on every attempt and never exceeds `cap`.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(cap).min(cap)
}

/// Polls the email queue and delivers rows through a [`Mailer`].
///
/// Rows are claimed one at a time with an atomic state change, so several
/// processors (or several workers of one processor) never deliver the same
/// row twice.
#[derive(Clone)]
pub struct EmailQueueProcessor {
    store: Arc<Store>,
    mailer: Arc<dyn Mailer>,
    settings: QueueSettings,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl EmailQueueProcessor {
    pub fn new(store: Arc<Store>, mailer: Arc<dyn Mailer>, settings: QueueSettings) -> Self {
        Self {
            store,
            mailer,
            settings,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the polling loop in the background.
    ///
    /// Rows left in `sending` by an earlier process are put back to `pending`
    /// first.
    pub async fn start(&self) -> JoinHandle<()> {
        match self.store.requeue_stale_sending() {
            Ok(0) => {}
            Ok(n) => tracing::warn!("EmailQueue: requeued {} email(s) interrupted mid-delivery", n),
            Err(e) => tracing::error!("EmailQueue: failed to requeue stale emails: {}", e),
        }

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let processor = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "EmailQueue: started with {} worker(s), polling every {:?}",
                processor.settings.workers,
                processor.settings.poll_interval
            );
            let mut interval = tokio::time::interval(processor.settings.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let n = processor.process_available().await;
                        if n > 0 {
                            tracing::debug!("EmailQueue: processed {} email(s)", n);
                        }
                    }
                }
            }
            tracing::info!("EmailQueue: stopped");
        })
    }

    /// Stop the polling loop. Deliveries already running are finished first.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Claim and deliver every row eligible right now.
    ///
    /// At most `workers` deliveries run at once. Returns the number of rows
    /// claimed.
    pub async fn process_available(&self) -> usize {
        let permits = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut deliveries = JoinSet::new();
        let mut claimed = 0;

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let item = match self.store.claim_next_email(Utc::now()) {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("EmailQueue: failed to claim email: {}", e);
                    break;
                }
            };
            claimed += 1;

            let processor = self.clone();
            deliveries.spawn(async move {
                let _permit = permit;
                processor.deliver(item).await;
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                tracing::error!("EmailQueue: delivery task failed: {}", e);
            }
        }
        claimed
    }

    async fn deliver(&self, item: EmailQueueItem) {
        let email = OutgoingEmail {
            from: self.settings.from_addr.clone(),
            to: item.to_addr.clone(),
            subject: item.subject.clone(),
            body: item.body.clone(),
        };

        let timeout = self.settings.send_timeout;
        let result = match tokio::time::timeout(timeout, self.mailer.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        };

        let now = Utc::now();
        let recorded = match result {
            Ok(()) => {
                tracing::info!(
                    "EmailQueue: sent email {} to {} (attempt {})",
                    item.id,
                    item.to_addr,
                    item.attempts
                );
                self.store.mark_email_sent(item.id, now)
            }
            Err(e) if item.attempts >= self.settings.max_attempts => {
                tracing::warn!(
                    "EmailQueue: giving up on email {} to {} after {} attempt(s): {}",
                    item.id,
                    item.to_addr,
                    item.attempts,
                    e
                );
                self.store.mark_email_error(item.id, &e.to_string(), None)
            }
            Err(e) => {
                let delay = backoff(
                    item.attempts,
                    self.settings.backoff_base,
                    self.settings.backoff_max,
                );
                let retry_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                tracing::warn!(
                    "EmailQueue: email {} to {} failed (attempt {}), retrying in {:?}: {}",
                    item.id,
                    item.to_addr,
                    item.attempts,
                    delay,
                    e
                );
                self.store.mark_email_error(item.id, &e.to_string(), Some(retry_at))
            }
        };

        // The row stays in `sending` and is requeued on the next start.
        if let Err(e) = recorded {
            tracing::error!("EmailQueue: failed to record outcome of email {}: {}", item.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Alert, Channel, EmailState, NewAlert, NewEmail, NewSubscription, Severity};
    use crate::notify::Dispatcher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Fails the first `failures` sends, then succeeds.
    #[derive(Default)]
    struct ScriptedMailer {
        failures: AtomicU32,
        calls: AtomicU32,
        delivered: std::sync::Mutex<Vec<OutgoingEmail>>,
    }

    impl ScriptedMailer {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Mailer for ScriptedMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::Transport("connection reset".to_string()));
            }
            self.delivered.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    struct SlowMailer;

    #[async_trait]
    impl Mailer for SlowMailer {
        async fn send(&self, _email: &OutgoingEmail) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            poll_interval: Duration::from_millis(20),
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            workers: 2,
            send_timeout: Duration::from_secs(2),
            from_addr: "nexboard@example.com".to_string(),
        }
    }

    fn enqueue(store: &Store, to: &str) -> EmailQueueItem {
        store
            .enqueue_email(&NewEmail {
                alert_id: None,
                to_addr: to.to_string(),
                subject: "[HIGH] api is down".to_string(),
                body: "connection refused".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff(1, base, cap), Duration::from_secs(30));
        assert_eq!(backoff(2, base, cap), Duration::from_secs(60));
        assert_eq!(backoff(3, base, cap), Duration::from_secs(120));
        assert_eq!(backoff(4, base, cap), Duration::from_secs(240));
        assert_eq!(backoff(5, base, cap), cap);
        assert_eq!(backoff(200, base, cap), cap);
        assert_eq!(backoff(0, base, cap), base);
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        let mailer = ScriptedMailer::failing(0);
        let processor = EmailQueueProcessor::new(store.clone(), mailer.clone(), settings());

        assert_eq!(processor.process_available().await, 1);

        let row = store.get_email(row.id).unwrap();
        assert_eq!(row.state, EmailState::Sent);
        assert_eq!(row.attempts, 1);
        assert!(row.sent_at.is_some());
        assert!(row.last_error.is_none());

        let delivered = mailer.delivered.lock().unwrap();
        assert_eq!(delivered[0].from, "nexboard@example.com");
        assert_eq!(delivered[0].to, "ops@example.com");
    }

    #[tokio::test]
    async fn test_always_failing_ends_terminal() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        let mailer = ScriptedMailer::failing(u32::MAX);
        let processor = EmailQueueProcessor::new(store.clone(), mailer.clone(), settings());

        // Zero backoff makes each retry eligible on the very next pass.
        for _ in 0..3 {
            assert_eq!(processor.process_available().await, 1);
        }

        let row = store.get_email(row.id).unwrap();
        assert_eq!(row.state, EmailState::Error);
        assert_eq!(row.attempts, 3);
        assert_eq!(row.last_error.as_deref(), Some("mail transport failed: connection reset"));
        assert!(row.next_attempt_at.is_none());
        assert!(row.sent_at.is_none());
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);

        // Terminal rows are never claimed again.
        assert_eq!(processor.process_available().await, 0);
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        let processor =
            EmailQueueProcessor::new(store.clone(), ScriptedMailer::failing(1), settings());

        assert_eq!(processor.process_available().await, 1);
        assert_eq!(store.get_email(row.id).unwrap().state, EmailState::Error);
        assert_eq!(processor.process_available().await, 1);

        let row = store.get_email(row.id).unwrap();
        assert_eq!(row.state, EmailState::Sent);
        assert_eq!(row.attempts, 2);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        let processor = EmailQueueProcessor::new(
            store.clone(),
            ScriptedMailer::failing(1),
            QueueSettings {
                backoff_base: Duration::from_secs(60),
                backoff_max: Duration::from_secs(600),
                ..settings()
            },
        );

        let before = Utc::now();
        assert_eq!(processor.process_available().await, 1);

        let row = store.get_email(row.id).unwrap();
        assert_eq!(row.state, EmailState::Error);
        assert_eq!(row.attempts, 1);
        assert!(row.last_error.is_some());
        let retry_at = row.next_attempt_at.unwrap();
        assert!(retry_at >= before + chrono::Duration::seconds(60));

        // Not eligible until the deadline passes.
        assert_eq!(processor.process_available().await, 0);
        assert!(store.list_pending_emails(Utc::now()).unwrap().is_empty());
        assert_eq!(store.list_pending_emails(retry_at).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mailer_timeout_counts_as_failure() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        let processor = EmailQueueProcessor::new(
            store.clone(),
            Arc::new(SlowMailer),
            QueueSettings {
                max_attempts: 1,
                send_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        processor.process_available().await;

        let row = store.get_email(row.id).unwrap();
        assert_eq!(row.state, EmailState::Error);
        assert!(row.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrent_processors_deliver_each_row_once() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for i in 0..20 {
            enqueue(&store, &format!("user{}@example.com", i));
        }
        let mailer = ScriptedMailer::failing(0);
        let a = EmailQueueProcessor::new(store.clone(), mailer.clone(), settings());
        let b = EmailQueueProcessor::new(store.clone(), mailer.clone(), settings());

        let (claimed_a, claimed_b) = tokio::join!(a.process_available(), b.process_available());
        assert_eq!(claimed_a + claimed_b, 20);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 20);

        let mut recipients: Vec<String> = mailer
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.to.clone())
            .collect();
        recipients.sort();
        recipients.dedup();
        assert_eq!(recipients.len(), 20);
        assert!(store
            .list_emails()
            .unwrap()
            .iter()
            .all(|e| e.state == EmailState::Sent && e.attempts == 1));
    }

    #[tokio::test]
    async fn test_start_requeues_stale_rows_and_delivers() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let row = enqueue(&store, "ops@example.com");
        // Simulate a crash after the claim.
        assert_ok!(store.update_email_status(row.id, EmailState::Sending));

        let processor =
            EmailQueueProcessor::new(store.clone(), ScriptedMailer::failing(0), settings());
        let handle = processor.start().await;

        let sent = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.get_email(row.id).unwrap().state == EmailState::Sent {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert_ok!(sent);

        processor.stop().await;
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), handle).await);
    }

    #[tokio::test]
    async fn test_two_subscriptions_both_delivered() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for (endpoint, enabled) in [
            ("ops@example.com", true),
            ("oncall@example.com", true),
            ("muted@example.com", false),
        ] {
            store
                .create_subscription(&NewSubscription {
                    channel: Channel::Email,
                    endpoint: endpoint.to_string(),
                    enabled,
                })
                .unwrap();
        }
        let alert: Alert = store
            .create_alert(&NewAlert {
                application_id: Some(1),
                source: "api".to_string(),
                severity: Severity::High,
                title: "api is down".to_string(),
                message: "connection refused".to_string(),
            })
            .unwrap();
        Dispatcher::new(store.clone()).dispatch(&alert).unwrap();

        let processor =
            EmailQueueProcessor::new(store.clone(), ScriptedMailer::failing(0), settings());
        assert_eq!(processor.process_available().await, 2);

        let emails = store.list_emails().unwrap();
        assert_eq!(emails.len(), 2);
        for email in &emails {
            assert_eq!(email.state, EmailState::Sent);
            assert_eq!(email.alert_id, Some(alert.id));
            assert!(email.sent_at.is_some());
        }
    }

    #[test]
    fn test_empty_subject_never_queued() {
        let store = Store::open_in_memory().unwrap();
        assert_err!(store.enqueue_email(&NewEmail {
            alert_id: None,
            to_addr: "ops@example.com".to_string(),
            subject: "".to_string(),
            body: "body".to_string(),
        }));
        assert!(store.list_emails().unwrap().is_empty());
    }
}
