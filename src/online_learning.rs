//! Online learning coordination: buffered interactions, checkpointed
//! incremental updates, rollback on failure
//!
//! The gradient mechanics live behind [`IncrementalLearner`]; this module
//! owns the discipline around them. Each update attempt walks
//! Idle → CheckpointCreated → Updating → Committed | RolledBack, with a
//! checkpoint always taken before the model is touched. At most one update
//! is in flight; concurrent triggers observe a no-op rejection.

use crate::events::InteractionEvent;
use crate::metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

/// Buffer capacity; reaching it auto-triggers an update
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Minimum buffered interactions for a non-forced update
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Checkpoints retained after successful updates
pub const DEFAULT_CHECKPOINT_RETENTION: usize = 10;

/// Default learning rate for the shipped reward accumulator
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;

/// Model mutation seam. Implementations decide what an "incremental
/// update" means for their model family; the coordinator only requires
/// that state can be snapshotted and restored byte-for-byte.
pub trait IncrementalLearner: Send + Sync {
    /// Serializes current model state into an opaque payload.
    fn checkpoint(&self) -> Result<Vec<u8>>;

    /// Applies one batch of interactions, mutating the model.
    fn apply_batch(&mut self, events: &[InteractionEvent]) -> Result<()>;

    /// Restores model state from a checkpoint payload.
    fn restore(&mut self, payload: &[u8]) -> Result<()>;

    fn version(&self) -> String;
}

/// Snapshot of model state taken before each update attempt
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Phase of the most recent update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    CheckpointCreated,
    Updating,
    Committed,
    RolledBack,
}

/// Result of a trigger. Rejections are outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Committed { processed: usize, duration_ms: f64 },
    AlreadyInProgress,
    InsufficientBuffer { buffered: usize, required: usize },
    RolledBack { error: String },
}

impl UpdateOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, UpdateOutcome::Committed { .. })
    }
}

/// Status surface for queries
#[derive(Debug, Clone, Serialize)]
pub struct LearningStatus {
    pub buffered: usize,
    pub buffer_capacity: usize,
    pub buffer_utilization: f64,
    pub batch_size: usize,
    pub update_in_flight: bool,
    pub total_updates: u64,
    pub failed_updates: u64,
    pub interactions_processed: u64,
    pub avg_update_ms: f64,
    pub last_phase: UpdatePhase,
    pub checkpoints_retained: usize,
    pub model_version: String,
    pub last_update_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag on every exit path, including panics.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinates buffered interactions and checkpointed model updates.
pub struct OnlineLearningCoordinator {
    learner: Mutex<Box<dyn IncrementalLearner>>,
    buffer: Mutex<VecDeque<InteractionEvent>>,
    buffer_capacity: usize,
    batch_size: usize,
    checkpoint_retention: usize,
    checkpoints: Mutex<VecDeque<Checkpoint>>,
    checkpoint_seq: AtomicU64,
    in_flight: AtomicBool,
    total_updates: AtomicU64,
    failed_updates: AtomicU64,
    interactions_processed: AtomicU64,
    avg_update_ms: Mutex<f64>,
    last_phase: RwLock<UpdatePhase>,
    last_update_at: RwLock<Option<DateTime<Utc>>>,
}

impl OnlineLearningCoordinator {
    pub fn new(
        learner: Box<dyn IncrementalLearner>,
        buffer_capacity: usize,
        batch_size: usize,
        checkpoint_retention: usize,
    ) -> Self {
        Self {
            learner: Mutex::new(learner),
            buffer: Mutex::new(VecDeque::with_capacity(buffer_capacity.min(4096))),
            buffer_capacity,
            batch_size,
            checkpoint_retention,
            checkpoints: Mutex::new(VecDeque::new()),
            checkpoint_seq: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            total_updates: AtomicU64::new(0),
            failed_updates: AtomicU64::new(0),
            interactions_processed: AtomicU64::new(0),
            avg_update_ms: Mutex::new(0.0),
            last_phase: RwLock::new(UpdatePhase::Idle),
            last_update_at: RwLock::new(None),
        }
    }

    pub fn with_defaults(learner: Box<dyn IncrementalLearner>) -> Self {
        Self::new(
            learner,
            DEFAULT_BUFFER_CAPACITY,
            DEFAULT_BATCH_SIZE,
            DEFAULT_CHECKPOINT_RETENTION,
        )
    }

    /// Buffers one interaction. When the buffer reaches capacity an update
    /// is triggered automatically; the outcome of that update is returned.
    pub async fn add_interaction(
        &self,
        event: InteractionEvent,
    ) -> Result<Option<UpdateOutcome>> {
        let buffered = {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.buffer_capacity {
                buffer.pop_front();
            }
            buffer.push_back(event);
            buffer.len()
        };
        metrics::LEARNING_BUFFER_UTILIZATION
            .set(buffered as f64 / self.buffer_capacity.max(1) as f64);

        if buffered >= self.buffer_capacity {
            let outcome = self.trigger_update(false).await?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// Runs one checkpointed update attempt.
    ///
    /// Without `force`, at least `batch_size` interactions must be
    /// buffered. A concurrent call while an update is running returns
    /// [`UpdateOutcome::AlreadyInProgress`] and leaves the buffer alone.
    pub async fn trigger_update(&self, force: bool) -> Result<UpdateOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::LEARNING_UPDATES_REJECTED_TOTAL.inc();
            return Ok(UpdateOutcome::AlreadyInProgress);
        }
        let _guard = FlightGuard(&self.in_flight);

        let batch: Vec<InteractionEvent> = {
            let mut buffer = self.buffer.lock();
            if !force && buffer.len() < self.batch_size {
                return Ok(UpdateOutcome::InsufficientBuffer {
                    buffered: buffer.len(),
                    required: self.batch_size,
                });
            }
            buffer.drain(..).collect()
        };

        let mut learner = self.learner.lock();

        // Checkpoint before any mutation
        let payload = learner
            .checkpoint()
            .context("checkpoint creation failed; model untouched")?;
        self.store_checkpoint(payload.clone());
        *self.last_phase.write() = UpdatePhase::CheckpointCreated;

        *self.last_phase.write() = UpdatePhase::Updating;
        let started = Instant::now();
        match learner.apply_batch(&batch) {
            Ok(()) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                *self.last_phase.write() = UpdatePhase::Committed;
                self.total_updates.fetch_add(1, Ordering::Relaxed);
                self.interactions_processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                *self.last_update_at.write() = Some(Utc::now());
                {
                    let mut avg = self.avg_update_ms.lock();
                    *avg = *avg * 0.9 + duration_ms * 0.1;
                }
                metrics::LEARNING_UPDATES_TOTAL.inc();
                metrics::LEARNING_UPDATE_LATENCY_SECONDS.observe(duration_ms / 1000.0);
                info!(
                    processed = batch.len(),
                    duration_ms, "incremental update committed"
                );
                Ok(UpdateOutcome::Committed {
                    processed: batch.len(),
                    duration_ms,
                })
            }
            Err(e) => {
                *self.last_phase.write() = UpdatePhase::RolledBack;
                self.failed_updates.fetch_add(1, Ordering::Relaxed);
                metrics::LEARNING_UPDATE_FAILURES_TOTAL.inc();
                warn!(error = %e, "incremental update failed; restoring checkpoint");
                if let Err(restore_err) = learner.restore(&payload) {
                    error!(error = %restore_err, "checkpoint restore failed");
                    return Err(restore_err.context("rollback failed after update error"));
                }
                Ok(UpdateOutcome::RolledBack {
                    error: e.to_string(),
                })
            }
        }
    }

    fn store_checkpoint(&self, payload: Vec<u8>) {
        let id = self.checkpoint_seq.fetch_add(1, Ordering::Relaxed);
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.push_back(Checkpoint {
            id,
            created_at: Utc::now(),
            payload,
        });
        while checkpoints.len() > self.checkpoint_retention {
            checkpoints.pop_front();
        }
    }

    pub fn update_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn status(&self) -> LearningStatus {
        let buffered = self.buffered();
        LearningStatus {
            buffered,
            buffer_capacity: self.buffer_capacity,
            buffer_utilization: buffered as f64 / self.buffer_capacity.max(1) as f64,
            batch_size: self.batch_size,
            update_in_flight: self.update_in_flight(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            failed_updates: self.failed_updates.load(Ordering::Relaxed),
            interactions_processed: self.interactions_processed.load(Ordering::Relaxed),
            avg_update_ms: *self.avg_update_ms.lock(),
            last_phase: *self.last_phase.read(),
            checkpoints_retained: self.checkpoint_count(),
            model_version: self.learner.lock().version(),
            last_update_at: *self.last_update_at.read(),
        }
    }
}

// ============================================================================
// Shipped learner: per-item reward accumulator
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct AccumulatorState {
    scores: HashMap<String, f64>,
    updates_applied: u64,
}

/// Deterministic default learner: accumulates reward-weighted item scores.
/// Good enough to exercise the checkpoint/rollback discipline and to back
/// the simulation binary; real deployments plug in their own learner.
pub struct RewardAccumulator {
    scores: HashMap<String, f64>,
    learning_rate: f64,
    updates_applied: u64,
}

impl RewardAccumulator {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            scores: HashMap::new(),
            learning_rate,
            updates_applied: 0,
        }
    }

    pub fn item_score(&self, item_id: &str) -> f64 {
        self.scores.get(item_id).copied().unwrap_or(0.0)
    }

    pub fn item_count(&self) -> usize {
        self.scores.len()
    }
}

impl Default for RewardAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_LEARNING_RATE)
    }
}

impl IncrementalLearner for RewardAccumulator {
    fn checkpoint(&self) -> Result<Vec<u8>> {
        bincode::serialize(&AccumulatorState {
            scores: self.scores.clone(),
            updates_applied: self.updates_applied,
        })
        .context("encode accumulator checkpoint")
    }

    fn apply_batch(&mut self, events: &[InteractionEvent]) -> Result<()> {
        for event in events {
            let reward = event.kind.reward_score();
            if reward == 0.0 {
                continue;
            }
            *self.scores.entry(event.item_id.clone()).or_insert(0.0) +=
                self.learning_rate * reward;
        }
        self.updates_applied += 1;
        Ok(())
    }

    fn restore(&mut self, payload: &[u8]) -> Result<()> {
        let state: AccumulatorState =
            bincode::deserialize(payload).context("decode accumulator checkpoint")?;
        self.scores = state.scores;
        self.updates_applied = state.updates_applied;
        Ok(())
    }

    fn version(&self) -> String {
        format!("reward-accum-v{}", self.updates_applied)
    }
}
