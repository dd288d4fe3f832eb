// =============================================================================
// Core — owns every subsystem and drives the scheduler's state machine
// =============================================================================
//
// Constructed once in `main` from a resolved `Config`; no subsystem here is a
// global singleton (per the re-architecture guidance this codebase follows).
// Detection cycles, retention sweeps, and graceful shutdown are all methods
// on this value.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::detector::ConfluenceDetector;
use crate::emitter::AlertEmitter;
use crate::fetcher::MarketSnapshotFetcher;
use crate::store::AlertStore;
use crate::timeseries::TimeSeriesStore;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-wide lifecycle state, advanced by [`Core::mark_running`] and
/// [`Core::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Draining,
    Stopped,
}

/// Owns every subsystem; the only thing resembling process-wide state is the
/// `Config` it was built from.
pub struct Core {
    config: Config,
    fetcher: MarketSnapshotFetcher,
    store_handle: TimeSeriesStore,
    detector: ConfluenceDetector,
    emitter: AlertEmitter,
    alert_store: Arc<RwLock<Option<AlertStore>>>,
    state: Arc<RwLock<RunState>>,
    draining: Arc<AtomicBool>,
    cycle_running: Arc<AtomicBool>,
}

impl Core {
    pub fn new(config: Config) -> Self {
        let fetcher = MarketSnapshotFetcher::new(&config);
        let store_handle = TimeSeriesStore::new(
            config.lookback_days,
            config.min_history_days,
            config.point_in_past_tolerance_ms,
        );
        let detector = ConfluenceDetector::new(&config);
        let alert_store = Arc::new(RwLock::new(None));
        let emitter = AlertEmitter::new(config.alert_cooldown_secs, alert_store.clone());

        Self {
            config,
            fetcher,
            store_handle,
            detector,
            emitter,
            alert_store,
            state: Arc::new(RwLock::new(RunState::Init)),
            draining: Arc::new(AtomicBool::new(false)),
            cycle_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    pub fn mark_running(&self) {
        *self.state.write() = RunState::Running;
    }

    pub fn alert_store_handle(&self) -> Arc<RwLock<Option<AlertStore>>> {
        self.alert_store.clone()
    }

    /// Connects the persistent store if `DATABASE_URL` is configured. A
    /// connection failure here is logged and non-fatal: the HTTP listener
    /// and Fetcher still start, per §4.6's "persistence is not a startup
    /// gate" rule. The caller is expected to spawn [`Core::reconnect_loop`]
    /// afterward regardless of the outcome.
    #[instrument(skip(self))]
    pub async fn connect_store(&self) {
        let Some(url) = self.config.database_url.clone() else {
            warn!("DATABASE_URL not set, alerts will not be persisted");
            return;
        };

        match AlertStore::connect(&url, self.config.require_db_tls).await {
            Ok(store) => {
                *self.alert_store.write() = Some(store);
                info!("persistent alert store connected");
            }
            Err(e) => {
                warn!(error = %e, "persistent alert store unreachable at startup, will retry in background");
            }
        }
    }

    /// Background reconnect with exponential back-off capped at 30 s. Runs
    /// until the store is connected or the process enters DRAINING.
    pub async fn reconnect_loop(&self) {
        if self.alert_store.read().is_some() {
            return;
        }
        let Some(url) = self.config.database_url.clone() else {
            return;
        };

        let mut backoff_secs = 1u64;
        loop {
            if self.draining.load(Ordering::Relaxed) || self.alert_store.read().is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;

            match AlertStore::connect(&url, self.config.require_db_tls).await {
                Ok(store) => {
                    *self.alert_store.write() = Some(store);
                    info!("persistent alert store reconnected");
                    return;
                }
                Err(e) => {
                    backoff_secs = (backoff_secs * 2).min(30);
                    warn!(error = %e, next_retry_secs = backoff_secs, "reconnect attempt failed");
                }
            }
        }
    }

    /// One detection cycle: fetch, append, evict, detect, submit. Skips
    /// entirely (rather than queueing) if the previous cycle is still
    /// in-flight, per §4.6's "missed ticks do not pile up" rule.
    #[instrument(skip(self))]
    pub async fn detection_cycle(&self) {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous detection cycle still running, skipping this tick");
            return;
        }

        let now = now_ms();
        let observations = self.fetcher.snapshot(now).await;
        for obs in &observations {
            self.store_handle.append(&obs.symbol, obs.observation);
        }

        let candidates = self.detector.evaluate(&observations, &self.store_handle, &self.emitter, now);
        for candidate in candidates {
            self.emitter.submit(candidate, now).await;
        }

        self.cycle_running.store(false, Ordering::SeqCst);
    }

    #[instrument(skip(self))]
    pub async fn retention_sweep(&self) {
        let now = now_ms();
        self.store_handle.evict(now);

        let cutoff = now - self.config.retention_hours * 3600 * 1000;
        if let Some(store) = self.alert_store.read().clone() {
            if let Err(e) = store.prune(cutoff).await {
                error!(error = %e, "retention sweep failed");
            }
        }
    }

    /// Spawns the detection-cycle and retention-sweep timers. Returns the
    /// join handles so the caller can await them during shutdown.
    pub fn spawn_timers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let detect_handle = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(core.config.detect_interval_secs));
                loop {
                    interval.tick().await;
                    if core.draining.load(Ordering::Relaxed) {
                        return;
                    }
                    core.detection_cycle().await;
                }
            })
        };

        let prune_handle = {
            let core = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(core.config.prune_interval_secs));
                loop {
                    interval.tick().await;
                    if core.draining.load(Ordering::Relaxed) {
                        return;
                    }
                    core.retention_sweep().await;
                }
            })
        };

        vec![detect_handle, prune_handle]
    }

    /// Enters DRAINING: stop accepting new ticks, wait up to the configured
    /// grace period for any in-flight cycle, then close the store.
    pub async fn shutdown(&self) {
        info!("entering draining state");
        *self.state.write() = RunState::Draining;
        self.draining.store(true, Ordering::SeqCst);

        let grace = std::time::Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.cycle_running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        if let Some(store) = self.alert_store.read().clone() {
            store.close().await;
        }
        *self.state.write() = RunState::Stopped;
        info!("stopped");
    }

    pub fn time_series(&self) -> &TimeSeriesStore {
        &self.store_handle
    }
}
