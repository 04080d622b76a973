//! Scheduler module: one probe loop per monitored application.

mod pipeline;

pub use pipeline::*;

use crate::config::ScheduleSettings;
use crate::db::Application;
use crate::probe::Prober;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

/// A registered application and the handles of its probe loop.
struct Slot {
    application: Application,
    /// Distinguishes this loop from earlier loops of the same application.
    generation: u64,
    stop_tx: broadcast::Sender<()>,
    /// Held for the whole probe-and-record step. Survives re-arming, so an
    /// old loop finishing its last probe never overlaps with the new one.
    guard: Arc<Mutex<()>>,
}

/// Runs the probe loops of all registered applications.
///
/// Each application gets its own task, so a slow probe only delays its own
/// next tick. Within one application probes never overlap; ticks that fall
/// due while a probe is still running are skipped.
pub struct Scheduler {
    pipeline: Arc<HealthPipeline>,
    prober: Arc<dyn Prober>,
    settings: ScheduleSettings,
    slots: Arc<RwLock<HashMap<i64, Slot>>>,
    generations: AtomicU64,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<HealthPipeline>,
        prober: Arc<dyn Prober>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            pipeline,
            prober,
            settings,
            slots: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Start probing an application.
    ///
    /// Registering the same configuration twice is a no-op. A changed
    /// configuration replaces the running loop. Returns whether a loop was
    /// (re)started.
    pub async fn register(&self, app: Application) -> bool {
        let mut slots = self.slots.write().await;
        self.arm(&mut slots, app)
    }

    /// Stop probing an application and drop its health state.
    ///
    /// Waits for a probe in flight to finish; its verdict is discarded.
    pub async fn unregister(&self, id: i64) -> bool {
        let Some(slot) = self.slots.write().await.remove(&id) else {
            return false;
        };
        let _ = slot.stop_tx.send(());
        tracing::info!("Scheduler: removed {}", slot.application.name);

        let _idle = slot.guard.lock().await;
        self.pipeline.tracker().forget(id);
        true
    }

    /// Change an application's interval. Returns false if it is not registered.
    pub async fn reschedule(&self, id: i64, check_interval_secs: u64) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get(&id) else {
            return false;
        };
        let mut app = slot.application.clone();
        app.check_interval_secs = check_interval_secs;
        self.arm(&mut slots, app);
        true
    }

    /// Stop every loop, e.g. on shutdown.
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (_, slot) in slots.drain() {
            let _ = slot.stop_tx.send(());
        }
    }

    pub async fn active_count(&self) -> usize {
        self.slots.read().await.len()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn is_registered(&self, id: i64) -> bool {
        self.slots.read().await.contains_key(&id)
    }

    /// The configuration an application is currently probed with.
    pub async fn registered(&self, id: i64) -> Option<Application> {
        self.slots
            .read()
            .await
            .get(&id)
            .map(|slot| slot.application.clone())
    }

    fn arm(&self, slots: &mut HashMap<i64, Slot>, app: Application) -> bool {
        let guard = match slots.get(&app.id) {
            Some(slot) if slot.application == app => return false,
            Some(slot) => {
                let _ = slot.stop_tx.send(());
                slot.guard.clone()
            }
            None => Arc::new(Mutex::new(())),
        };

        let interval = self.settings.effective_interval(app.check_interval_secs);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        slots.insert(
            app.id,
            Slot {
                application: app.clone(),
                generation,
                stop_tx,
                guard: guard.clone(),
            },
        );
        tracing::info!(
            "Scheduler: probing {} ({}) every {:?}",
            app.name,
            app.probe_target(),
            interval
        );

        let probe_loop = ProbeLoop {
            application: app,
            generation,
            slots: self.slots.clone(),
            interval,
            timeout: self.settings.probe_timeout,
            prober: self.prober.clone(),
            pipeline: self.pipeline.clone(),
            guard,
        };
        tokio::spawn(probe_loop.run(stop_rx));
        true
    }
}

struct ProbeLoop {
    application: Application,
    generation: u64,
    slots: Arc<RwLock<HashMap<i64, Slot>>>,
    interval: Duration,
    timeout: Duration,
    prober: Arc<dyn Prober>,
    pipeline: Arc<HealthPipeline>,
    guard: Arc<Mutex<()>>,
}

impl ProbeLoop {
    async fn run(self, mut stop_rx: broadcast::Receiver<()>) {
        let target = self.application.probe_target();

        // Spread first probes so a restart does not fire every check at once.
        let spread = self.interval.min(Duration::from_secs(1)).as_millis() as u64;
        let jitter = Duration::from_millis(rand::random::<u64>() % spread.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + jitter, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            let _running = self.guard.lock().await;
            if stopped(&mut stop_rx) {
                break;
            }

            let verdict = self.prober.probe(&target, self.timeout).await;

            // Removal takes the write lock, so the slot cannot go away while
            // the verdict is being recorded.
            let slots = self.slots.read().await;
            if !self.is_current(&slots) {
                tracing::debug!(
                    "Scheduler: discarding verdict for {}, no longer scheduled",
                    self.application.name
                );
                break;
            }

            if !verdict.ok {
                tracing::debug!(
                    "Scheduler: probe of {} failed: {}",
                    self.application.name,
                    verdict.error.as_deref().unwrap_or("unknown error")
                );
            }
            self.pipeline.process(&self.application, &verdict);
        }
    }

    fn is_current(&self, slots: &HashMap<i64, Slot>) -> bool {
        slots
            .get(&self.application.id)
            .is_some_and(|slot| slot.generation == self.generation)
    }
}

/// True once a stop was sent or the slot was dropped.
fn stopped(stop_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}
