//! Retrain trigger coordination
//!
//! Evaluates three trigger conditions in strict priority order: detected
//! feature drift, the wall-clock schedule, then accumulated event volume.
//! The first condition that fires wins and the rest are not evaluated.
//! At most one training run is in flight; a successful run resets the
//! event counter, stamps the retrain time and refreshes the drift
//! baseline.

use crate::drift_monitor::DriftMonitor;
use crate::metrics;
use crate::trainer::{ModelTrainer, TrainMode, TrainReport};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// P-value below which drift forces a retrain
pub const DEFAULT_DRIFT_P_THRESHOLD: f64 = 0.05;

/// Default schedule interval: one week
pub const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 168 * 3600;

/// Events since last retrain that force an incremental run
pub const DEFAULT_VOLUME_THRESHOLD: u64 = 10_000;

/// Ceiling on a single training run
pub const DEFAULT_TRAINER_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainReason {
    DataDrift,
    Scheduled,
    DataVolume,
    Manual,
}

impl RetrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrainReason::DataDrift => "data_drift",
            RetrainReason::Scheduled => "scheduled",
            RetrainReason::DataVolume => "data_volume",
            RetrainReason::Manual => "manual",
        }
    }
}

/// Trigger evaluation policy
#[derive(Debug, Clone)]
pub struct RetrainPolicy {
    pub drift_p_threshold: f64,
    /// `None` disables scheduled retraining
    pub schedule_interval: Option<Duration>,
    pub volume_threshold: u64,
    pub trainer_timeout: Duration,
}

impl Default for RetrainPolicy {
    fn default() -> Self {
        Self {
            drift_p_threshold: DEFAULT_DRIFT_P_THRESHOLD,
            schedule_interval: Some(Duration::from_secs(DEFAULT_SCHEDULE_INTERVAL_SECS)),
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            trainer_timeout: Duration::from_secs(DEFAULT_TRAINER_TIMEOUT_SECS),
        }
    }
}

/// Result of one trigger evaluation
#[derive(Debug)]
pub enum TriggerOutcome {
    NotNeeded,
    AlreadyRunning,
    Triggered {
        reason: RetrainReason,
        report: TrainReport,
    },
    Failed {
        reason: RetrainReason,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainStatus {
    pub retrain_in_progress: bool,
    pub events_since_retrain: u64,
    pub last_retrain_at: Option<DateTime<Utc>>,
    pub drift_triggers: u64,
    pub scheduled_triggers: u64,
    pub volume_triggers: u64,
    pub manual_triggers: u64,
    pub failed_runs: u64,
    pub drift_p_threshold: f64,
    pub schedule_interval_secs: Option<u64>,
    pub volume_threshold: u64,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetrainCoordinator {
    trainer: Arc<dyn ModelTrainer>,
    drift: Arc<DriftMonitor>,
    policy: RetrainPolicy,
    events_since_retrain: AtomicU64,
    last_retrain_at: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
    drift_triggers: AtomicU64,
    scheduled_triggers: AtomicU64,
    volume_triggers: AtomicU64,
    manual_triggers: AtomicU64,
    failed_runs: AtomicU64,
}

impl RetrainCoordinator {
    pub fn new(
        trainer: Arc<dyn ModelTrainer>,
        drift: Arc<DriftMonitor>,
        policy: RetrainPolicy,
    ) -> Self {
        Self {
            trainer,
            drift,
            policy,
            events_since_retrain: AtomicU64::new(0),
            last_retrain_at: RwLock::new(None),
            in_progress: AtomicBool::new(false),
            drift_triggers: AtomicU64::new(0),
            scheduled_triggers: AtomicU64::new(0),
            volume_triggers: AtomicU64::new(0),
            manual_triggers: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
        }
    }

    /// Counts one ingested event toward the volume trigger.
    pub fn record_event(&self) {
        self.events_since_retrain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events(&self, n: u64) {
        self.events_since_retrain.fetch_add(n, Ordering::Relaxed);
    }

    pub fn events_since_retrain(&self) -> u64 {
        self.events_since_retrain.load(Ordering::Relaxed)
    }

    pub fn retrain_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Picks the highest-priority trigger that currently applies.
    fn evaluate(&self) -> Option<(RetrainReason, TrainMode)> {
        if let Some(p) = self.drift.min_feature_p_value() {
            if p < self.policy.drift_p_threshold {
                return Some((RetrainReason::DataDrift, TrainMode::Full));
            }
        }

        if let Some(interval) = self.policy.schedule_interval {
            match *self.last_retrain_at.read() {
                // A coordinator that has never retrained is immediately due
                None => return Some((RetrainReason::Scheduled, TrainMode::Full)),
                Some(last) => {
                    let elapsed = Utc::now().signed_duration_since(last);
                    if elapsed.num_milliseconds() >= interval.as_millis() as i64 {
                        return Some((RetrainReason::Scheduled, TrainMode::Full));
                    }
                }
            }
        }

        if self.events_since_retrain.load(Ordering::Relaxed) > self.policy.volume_threshold {
            return Some((RetrainReason::DataVolume, TrainMode::Incremental));
        }

        None
    }

    /// Evaluates triggers and runs the trainer when one fires.
    pub async fn check_and_trigger(&self) -> Result<TriggerOutcome> {
        let Some((reason, mode)) = self.evaluate() else {
            return Ok(TriggerOutcome::NotNeeded);
        };
        self.run(reason, mode).await
    }

    /// Bypasses trigger evaluation, still honoring the single-flight gate.
    pub async fn trigger_manual(&self, mode: TrainMode) -> Result<TriggerOutcome> {
        self.run(RetrainReason::Manual, mode).await
    }

    async fn run(&self, reason: RetrainReason, mode: TrainMode) -> Result<TriggerOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TriggerOutcome::AlreadyRunning);
        }
        let _guard = FlightGuard(&self.in_progress);

        info!(reason = reason.as_str(), mode = mode.as_str(), "retrain triggered");
        let result =
            tokio::time::timeout(self.policy.trainer_timeout, self.trainer.train(mode)).await;

        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                self.failed_runs.fetch_add(1, Ordering::Relaxed);
                metrics::RETRAIN_FAILURES_TOTAL.inc();
                warn!(reason = reason.as_str(), error = %e, "trainer run failed");
                return Ok(TriggerOutcome::Failed {
                    reason,
                    error: e.to_string(),
                });
            }
            Err(_) => {
                self.failed_runs.fetch_add(1, Ordering::Relaxed);
                metrics::RETRAIN_FAILURES_TOTAL.inc();
                warn!(
                    reason = reason.as_str(),
                    timeout_secs = self.policy.trainer_timeout.as_secs(),
                    "trainer run timed out"
                );
                return Ok(TriggerOutcome::Failed {
                    reason,
                    error: format!(
                        "trainer timed out after {}s",
                        self.policy.trainer_timeout.as_secs()
                    ),
                });
            }
        };

        self.events_since_retrain.store(0, Ordering::Relaxed);
        *self.last_retrain_at.write() = Some(Utc::now());
        self.drift.refresh_baseline();
        self.count_trigger(reason);
        metrics::RETRAIN_TRIGGERS_TOTAL.inc();
        metrics::RETRAIN_DURATION_SECONDS.observe(report.duration_ms / 1000.0);
        info!(
            reason = reason.as_str(),
            duration_ms = report.duration_ms,
            "retrain completed"
        );
        Ok(TriggerOutcome::Triggered { reason, report })
    }

    fn count_trigger(&self, reason: RetrainReason) {
        let counter = match reason {
            RetrainReason::DataDrift => &self.drift_triggers,
            RetrainReason::Scheduled => &self.scheduled_triggers,
            RetrainReason::DataVolume => &self.volume_triggers,
            RetrainReason::Manual => &self.manual_triggers,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> RetrainStatus {
        RetrainStatus {
            retrain_in_progress: self.retrain_in_progress(),
            events_since_retrain: self.events_since_retrain(),
            last_retrain_at: *self.last_retrain_at.read(),
            drift_triggers: self.drift_triggers.load(Ordering::Relaxed),
            scheduled_triggers: self.scheduled_triggers.load(Ordering::Relaxed),
            volume_triggers: self.volume_triggers.load(Ordering::Relaxed),
            manual_triggers: self.manual_triggers.load(Ordering::Relaxed),
            failed_runs: self.failed_runs.load(Ordering::Relaxed),
            drift_p_threshold: self.policy.drift_p_threshold,
            schedule_interval_secs: self.policy.schedule_interval.map(|d| d.as_secs()),
            volume_threshold: self.policy.volume_threshold,
        }
    }

    /// Spawns the periodic trigger check. The task stops when the
    /// shutdown channel fires.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        check_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            info!(
                interval_secs = check_interval.as_secs_f64(),
                "retrain monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match coordinator.check_and_trigger().await {
                            Ok(TriggerOutcome::Triggered { reason, .. }) => {
                                info!(reason = reason.as_str(), "monitor triggered retrain");
                            }
                            Ok(TriggerOutcome::Failed { reason, error }) => {
                                warn!(reason = reason.as_str(), error, "monitor retrain failed");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "retrain check errored"),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("retrain monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}
