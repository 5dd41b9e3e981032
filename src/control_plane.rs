//! Control plane wiring every subsystem together
//!
//! One [`ControlPlane`] owns the feature cache, user stats, drift
//! monitor, online learning coordinator, experiment allocator and
//! retrain coordinator. Event ingestion fans out to all of them; the
//! serving path routes through experiments before scoring. Subsystem
//! failures on the ingest fan-out degrade to warnings so that one sick
//! arm cannot reject the event stream.

use crate::config::RecfluxConfig;
use crate::drift_monitor::{DriftMonitor, DriftMonitorConfig, DriftReport, DriftStatus};
use crate::events::{validate_batch, InteractionEvent};
use crate::experiment_log::ExperimentStatsPersister;
use crate::experiments::{
    ExperimentAllocator, ExperimentConfig, ExperimentSummary, WinnerAnalysis,
};
use crate::feature_backend::{BackendHealth, FeatureBackend};
use crate::feature_cache::{FeatureCacheService, FeatureCacheStats};
use crate::latency::LatencySummary;
use crate::metrics;
use crate::online_learning::{
    LearningStatus, OnlineLearningCoordinator, RewardAccumulator, UpdateOutcome,
};
use crate::recommend::{
    ModelScorer, PopularityTracker, RecommendationRequest, RecommendationResponse, Recommender,
    DEFAULT_MODEL_REF,
};
use crate::retrain::{RetrainCoordinator, RetrainPolicy, RetrainStatus, TriggerOutcome};
use crate::trainer::{ModelTrainer, TrainMode};
use crate::user_features::{derive_user_vector, UserStatsRegistry};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Experiment variant chosen for a served request
#[derive(Debug, Clone, Serialize)]
pub struct VariantAssignment {
    pub experiment_id: String,
    pub variant_id: String,
    pub model_ref: String,
}

/// Recommendation plus the experiment context it was served under
#[derive(Debug, Clone, Serialize)]
pub struct RecommendOutcome {
    pub response: RecommendationResponse,
    pub assignment: Option<VariantAssignment>,
}

/// Fan-out result for one ingested event
#[derive(Debug)]
pub struct IngestOutcome {
    pub feature_dimension: usize,
    pub auto_update: Option<UpdateOutcome>,
}

#[derive(Debug)]
pub struct BatchIngestOutcome {
    pub accepted: usize,
    pub auto_updates: usize,
}

/// Aggregated view over every subsystem
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: String,
    pub commit: String,
    pub uptime_secs: u64,
    pub events_ingested: u64,
    pub cache: FeatureCacheStats,
    pub drift: Option<DriftReport>,
    pub drift_checks: u64,
    pub learning: LearningStatus,
    pub retrain: RetrainStatus,
    pub experiments: usize,
    pub tracked_items: usize,
    pub recommendation_latency: LatencySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub backend_healthy: bool,
    pub backend_latency_ms: f64,
    pub update_in_flight: bool,
    pub retrain_in_progress: bool,
    pub uptime_secs: u64,
}

/// Handles for the periodic drift and retrain checks.
pub struct BackgroundMonitors {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundMonitors {
    /// Signals every monitor and waits for them to drain.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background monitor join failed");
            }
        }
    }
}

pub struct ControlPlane {
    config: RecfluxConfig,
    cache: Arc<FeatureCacheService>,
    stats: Arc<UserStatsRegistry>,
    drift: Arc<DriftMonitor>,
    learning: Arc<OnlineLearningCoordinator>,
    allocator: Arc<ExperimentAllocator>,
    experiment_log: Option<Arc<ExperimentStatsPersister>>,
    retrain: Arc<RetrainCoordinator>,
    recommender: Recommender,
    popularity: Arc<PopularityTracker>,
    events_ingested: AtomicU64,
    started_at: Instant,
}

impl ControlPlane {
    pub fn new(
        config: RecfluxConfig,
        backend: Arc<dyn FeatureBackend>,
        scorer: Arc<dyn ModelScorer>,
        trainer: Arc<dyn ModelTrainer>,
    ) -> Result<Self> {
        let cache = Arc::new(FeatureCacheService::new(
            Arc::clone(&backend),
            Duration::from_secs(config.cache.read_ttl_secs),
            config.cache.capacity,
            config.cache.user_dim,
            config.cache.item_dim,
        ));
        let stats = Arc::new(UserStatsRegistry::new());
        let drift = Arc::new(DriftMonitor::new(DriftMonitorConfig {
            reference_window: config.drift.reference_window,
            current_window: config.drift.current_window,
            psi_bins: config.drift.psi_bins,
            warning_threshold: config.drift.warning_threshold,
            critical_threshold: config.drift.critical_threshold,
            monitored_dims: config.drift.monitored_dims,
        }));
        let learning = Arc::new(OnlineLearningCoordinator::new(
            Box::new(RewardAccumulator::new(config.learning.learning_rate)),
            config.learning.buffer_capacity,
            config.learning.batch_size,
            config.learning.checkpoint_retention,
        ));
        let allocator = Arc::new(ExperimentAllocator::new(config.experiments.allocation_seed));
        let experiment_log = match &config.experiments.stats_log {
            Some(path) => Some(Arc::new(
                ExperimentStatsPersister::new(path).context("open experiment stats log")?,
            )),
            None => None,
        };
        let retrain = Arc::new(RetrainCoordinator::new(
            trainer,
            Arc::clone(&drift),
            RetrainPolicy {
                drift_p_threshold: config.retrain.drift_p_threshold,
                schedule_interval: config
                    .retrain
                    .schedule_interval_hours
                    .map(|h| Duration::from_secs(h * 3600)),
                volume_threshold: config.retrain.volume_threshold,
                trainer_timeout: Duration::from_secs(config.retrain.trainer_timeout_secs),
            },
        ));
        let popularity = Arc::new(PopularityTracker::new());
        let recommender = Recommender::new(
            Arc::clone(&cache),
            Arc::clone(&stats),
            Arc::clone(&popularity),
            scorer,
        );

        info!(
            user_dim = config.cache.user_dim,
            item_dim = config.cache.item_dim,
            buffer_capacity = config.learning.buffer_capacity,
            "control plane assembled"
        );
        Ok(Self {
            config,
            cache,
            stats,
            drift,
            learning,
            allocator,
            experiment_log,
            retrain,
            recommender,
            popularity,
            events_ingested: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Validates one event and fans it out to every subsystem.
    ///
    /// The stats, drift, volume and popularity arms cannot fail. The cache
    /// write-through and the learning buffer degrade to warnings so a sick
    /// backend never rejects the stream.
    pub async fn ingest_event(&self, event: InteractionEvent) -> Result<IngestOutcome> {
        event.validate()?;

        let snapshot = self.stats.record(&event);
        let vector = derive_user_vector(&snapshot, event.timestamp, self.config.cache.user_dim);
        self.drift.record_feature_sample(&vector);
        self.retrain.record_event();
        self.popularity.record(&event.item_id);

        let user_vector = crate::feature_backend::FeatureVector::computed(
            crate::feature_backend::EntityKind::User,
            event.user_id.clone(),
            vector,
        );
        let dimension = user_vector.dimension();
        if let Err(e) = self.cache.put(user_vector).await {
            warn!(user_id = %event.user_id, error = %e, "user vector write-through failed");
        }

        let auto_update = match self.learning.add_interaction(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "learning buffer rejected interaction");
                None
            }
        };

        self.events_ingested.fetch_add(1, Ordering::Relaxed);
        metrics::EVENTS_INGESTED_TOTAL.inc();
        Ok(IngestOutcome {
            feature_dimension: dimension,
            auto_update,
        })
    }

    /// Batch ingestion with whole-batch validation: one invalid event
    /// rejects the entire batch before any fan-out happens.
    pub async fn ingest_batch(
        &self,
        events: Vec<InteractionEvent>,
    ) -> Result<BatchIngestOutcome> {
        if let Err(e) = validate_batch(&events) {
            metrics::EVENTS_REJECTED_TOTAL.inc_by(events.len() as f64);
            return Err(e);
        }
        let mut accepted = 0;
        let mut auto_updates = 0;
        for event in events {
            let outcome = self.ingest_event(event).await?;
            accepted += 1;
            if outcome.auto_update.is_some() {
                auto_updates += 1;
            }
        }
        Ok(BatchIngestOutcome {
            accepted,
            auto_updates,
        })
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Serves recommendations, optionally routed through an experiment.
    ///
    /// When the user is admitted into the experiment the variant's model
    /// serves the request and an impression is recorded against it.
    pub async fn recommend(
        &self,
        request: &RecommendationRequest,
        experiment_id: Option<&str>,
    ) -> Result<RecommendOutcome> {
        let assignment = match experiment_id {
            Some(exp_id) => match self.allocator.select_variant(exp_id, &request.user_id)? {
                Some(variant_id) => {
                    let model_ref = self.allocator.model_ref(exp_id, &variant_id)?;
                    Some(VariantAssignment {
                        experiment_id: exp_id.to_string(),
                        variant_id,
                        model_ref,
                    })
                }
                None => None,
            },
            None => None,
        };

        let model_ref = assignment
            .as_ref()
            .map(|a| a.model_ref.as_str())
            .unwrap_or(DEFAULT_MODEL_REF);
        let response = self.recommender.recommend(request, model_ref).await?;

        if !response.cold_start {
            for item in &response.items {
                self.drift.record_prediction_sample(item.score);
            }
        }

        if let Some(assignment) = &assignment {
            self.allocator
                .record_impression(&assignment.experiment_id, &assignment.variant_id)?;
            self.allocator.record_latency(
                &assignment.experiment_id,
                &assignment.variant_id,
                response.latency_ms,
            )?;
            if let Some(log) = &self.experiment_log {
                if let Err(e) = log
                    .log_impression(
                        &assignment.experiment_id,
                        &assignment.variant_id,
                        &request.user_id,
                    )
                    .await
                {
                    warn!(error = %e, "impression log write failed");
                }
            }
        }

        Ok(RecommendOutcome {
            response,
            assignment,
        })
    }

    /// Records a conversion against a served variant.
    pub async fn record_conversion(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        revenue: Option<f64>,
    ) -> Result<()> {
        self.allocator
            .record_conversion(experiment_id, variant_id, revenue)?;
        if let Some(log) = &self.experiment_log {
            if let Err(e) = log
                .log_conversion(experiment_id, variant_id, user_id, revenue)
                .await
            {
                warn!(error = %e, "conversion log write failed");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Experiment administration
    // ========================================================================

    pub fn create_experiment(&self, config: ExperimentConfig) -> Result<String> {
        self.allocator.create_experiment(config)
    }

    pub fn start_experiment(&self, experiment_id: &str) -> Result<()> {
        self.allocator.start_experiment(experiment_id)
    }

    pub fn pause_experiment(&self, experiment_id: &str) -> Result<()> {
        self.allocator.pause_experiment(experiment_id)
    }

    pub fn conclude_experiment(&self, experiment_id: &str) -> Result<ExperimentSummary> {
        self.allocator.conclude_experiment(experiment_id)
    }

    pub fn experiment_summary(&self, experiment_id: &str) -> Result<ExperimentSummary> {
        self.allocator.summary(experiment_id)
    }

    pub fn evaluate_winner(&self, experiment_id: &str) -> Result<Option<WinnerAnalysis>> {
        self.allocator.evaluate_winner(experiment_id)
    }

    pub fn list_experiments(&self) -> Vec<ExperimentSummary> {
        self.allocator.list_experiments()
    }

    // ========================================================================
    // Model lifecycle
    // ========================================================================

    pub async fn trigger_model_update(&self, force: bool) -> Result<UpdateOutcome> {
        self.learning.trigger_update(force).await
    }

    pub async fn trigger_retrain(&self, mode: TrainMode) -> Result<TriggerOutcome> {
        self.retrain.trigger_manual(mode).await
    }

    pub fn check_drift(&self) -> DriftReport {
        self.drift.check_drift()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: env!("GIT_COMMIT_HASH").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            drift: self.drift.last_report(),
            drift_checks: self.drift.check_count(),
            learning: self.learning.status(),
            retrain: self.retrain.status(),
            experiments: self.allocator.experiment_count(),
            tracked_items: self.popularity.tracked_items(),
            recommendation_latency: self.recommender.latency_summary(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let backend = match self.cache.backend().health_check().await {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "backend health check failed");
                BackendHealth {
                    healthy: false,
                    latency_ms: 0.0,
                }
            }
        };
        HealthReport {
            healthy: backend.healthy,
            backend_healthy: backend.healthy,
            backend_latency_ms: backend.latency_ms,
            update_in_flight: self.learning.update_in_flight(),
            retrain_in_progress: self.retrain.retrain_in_progress(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn cache(&self) -> &Arc<FeatureCacheService> {
        &self.cache
    }

    pub fn drift_monitor(&self) -> &Arc<DriftMonitor> {
        &self.drift
    }

    pub fn learning(&self) -> &Arc<OnlineLearningCoordinator> {
        &self.learning
    }

    pub fn retrain_coordinator(&self) -> &Arc<RetrainCoordinator> {
        &self.retrain
    }

    pub fn user_stats(&self) -> &Arc<UserStatsRegistry> {
        &self.stats
    }

    // ========================================================================
    // Background monitors
    // ========================================================================

    /// Spawns the periodic drift check and the retrain trigger loop.
    pub fn spawn_background_monitors(&self) -> BackgroundMonitors {
        let (shutdown_tx, _) = broadcast::channel(4);

        let retrain_handle = self.retrain.spawn_monitor(
            Duration::from_secs(self.config.retrain.check_interval_secs),
            shutdown_tx.subscribe(),
        );

        let drift = Arc::clone(&self.drift);
        let drift_interval = Duration::from_secs(self.config.drift.check_interval_secs);
        let mut drift_shutdown = shutdown_tx.subscribe();
        let drift_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(drift_interval);
            info!(
                interval_secs = drift_interval.as_secs_f64(),
                "drift monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = drift.check_drift();
                        if report.status != DriftStatus::Normal {
                            warn!(
                                status = report.status.as_str(),
                                max_psi = report.max_psi,
                                "distribution drift detected"
                            );
                        }
                    }
                    _ = drift_shutdown.recv() => {
                        info!("drift monitor stopping");
                        break;
                    }
                }
            }
        });

        BackgroundMonitors {
            shutdown_tx,
            handles: vec![retrain_handle, drift_handle],
        }
    }

    /// Flushes durable state ahead of shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(log) = &self.experiment_log {
            log.close().await?;
        }
        info!("control plane shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::experiments::{AllocationStrategy, VariantConfig};
    use crate::feature_backend::{EntityKind, MemoryFeatureBackend};
    use crate::recommend::DotProductScorer;
    use crate::trainer::MockTrainer;

    fn plane() -> ControlPlane {
        let mut config = RecfluxConfig::default();
        config.learning.buffer_capacity = 50;
        config.learning.batch_size = 4;
        config.retrain.schedule_interval_hours = None;
        ControlPlane::new(
            config,
            Arc::new(MemoryFeatureBackend::new()),
            Arc::new(DotProductScorer),
            Arc::new(MockTrainer::default()),
        )
        .unwrap()
    }

    fn event(user: &str, item: &str, kind: EventKind) -> InteractionEvent {
        InteractionEvent::new(user, item, kind)
    }

    fn experiment_config() -> ExperimentConfig {
        ExperimentConfig {
            name: "ranker test".to_string(),
            variants: vec![
                VariantConfig {
                    id: "control".to_string(),
                    name: "control".to_string(),
                    model_ref: "model_v1".to_string(),
                    weight: 0.5,
                },
                VariantConfig {
                    id: "treatment".to_string(),
                    name: "treatment".to_string(),
                    model_ref: "model_v2".to_string(),
                    weight: 0.5,
                },
            ],
            strategy: AllocationStrategy::Fixed,
            traffic_percentage: 1.0,
            min_sample_size: 10,
            epsilon: 0.1,
        }
    }

    #[tokio::test]
    async fn test_ingest_fans_out_to_all_subsystems() {
        let plane = plane();
        for i in 0..10 {
            plane
                .ingest_event(event("user_1", &format!("movie_{i}"), EventKind::Click))
                .await
                .unwrap();
        }

        let status = plane.status();
        assert_eq!(status.events_ingested, 10);
        assert_eq!(status.learning.buffered, 10);
        assert_eq!(status.retrain.events_since_retrain, 10);
        assert_eq!(status.tracked_items, 10);

        // Write-through left a computed user vector behind the cache
        let vector = plane
            .cache()
            .get(EntityKind::User, "user_1")
            .await
            .unwrap();
        assert_eq!(
            vector.provenance,
            crate::feature_backend::Provenance::Computed
        );
        assert!(vector.values[0] > 0.0);
    }

    #[tokio::test]
    async fn test_batch_rejected_wholesale_on_one_bad_event() {
        let plane = plane();
        let mut batch = vec![
            event("user_1", "movie_1", EventKind::View),
            event("user_2", "movie_2", EventKind::Click),
        ];
        batch.push(InteractionEvent::new("", "movie_3", EventKind::View));

        assert!(plane.ingest_batch(batch).await.is_err());
        assert_eq!(plane.status().events_ingested, 0);
        assert_eq!(plane.status().learning.buffered, 0);
    }

    #[tokio::test]
    async fn test_auto_update_reported_from_batch() {
        let plane = plane();
        let batch: Vec<_> = (0..50)
            .map(|i| {
                event(
                    &format!("user_{}", i % 7),
                    &format!("movie_{i}"),
                    EventKind::View,
                )
            })
            .collect();
        let outcome = plane.ingest_batch(batch).await.unwrap();
        assert_eq!(outcome.accepted, 50);
        assert_eq!(outcome.auto_updates, 1);
        assert_eq!(plane.status().learning.total_updates, 1);
    }

    #[tokio::test]
    async fn test_recommend_through_experiment_records_impression() {
        let plane = plane();
        plane
            .ingest_event(event("user_1", "movie_seen", EventKind::View))
            .await
            .unwrap();

        let exp_id = plane.create_experiment(experiment_config()).unwrap();
        plane.start_experiment(&exp_id).unwrap();

        let request = RecommendationRequest {
            user_id: "user_1".to_string(),
            candidate_items: vec!["movie_a".to_string(), "movie_b".to_string()],
            limit: 2,
            exclude_seen: true,
        };
        let outcome = plane.recommend(&request, Some(&exp_id)).await.unwrap();

        let assignment = outcome.assignment.expect("full traffic admits everyone");
        assert_eq!(assignment.experiment_id, exp_id);
        assert!(assignment.model_ref.starts_with("model_v"));
        assert!(!outcome.response.cold_start);

        let summary = plane.experiment_summary(&exp_id).unwrap();
        assert_eq!(summary.total_impressions, 1);

        plane
            .record_conversion(&exp_id, &assignment.variant_id, "user_1", Some(5.0))
            .await
            .unwrap();
        let summary = plane.experiment_summary(&exp_id).unwrap();
        assert_eq!(summary.total_conversions, 1);
    }

    #[tokio::test]
    async fn test_recommend_without_experiment_uses_default_model() {
        let plane = plane();
        let request = RecommendationRequest {
            user_id: "user_unknown".to_string(),
            candidate_items: Vec::new(),
            limit: 3,
            exclude_seen: true,
        };
        let outcome = plane.recommend(&request, None).await.unwrap();
        assert!(outcome.assignment.is_none());
        assert!(outcome.response.cold_start);
        assert_eq!(outcome.response.model_ref, DEFAULT_MODEL_REF);
    }

    #[tokio::test]
    async fn test_health_check_reports_backend() {
        let plane = plane();
        let health = plane.health_check().await;
        assert!(health.healthy);
        assert!(health.backend_healthy);
        assert!(!health.update_in_flight);
        assert!(!health.retrain_in_progress);
    }

    #[tokio::test]
    async fn test_manual_retrain_passthrough() {
        let plane = plane();
        let outcome = plane.trigger_retrain(TrainMode::Full).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Triggered { .. }));
        assert_eq!(plane.status().retrain.manual_triggers, 1);
    }

    #[tokio::test]
    async fn test_background_monitors_stop_cleanly() {
        let plane = plane();
        let monitors = plane.spawn_background_monitors();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), monitors.stop())
            .await
            .expect("monitors did not stop");
    }

    #[tokio::test]
    async fn test_ingest_rejects_non_finite_value() {
        let plane = plane();
        let mut bad = event("user_1", "movie_1", EventKind::Rating);
        bad.value = Some(f64::NAN);
        assert!(plane.ingest_event(bad).await.is_err());
    }
}
