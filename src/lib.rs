//! Adaptive recommendation serving engine
//!
//! Event ingestion fans out to incremental user feature derivation, a
//! TTL'd feature cache over a pluggable backend, PSI-based distribution
//! drift monitoring, a checkpointed online learning coordinator and
//! retrain triggering. Serving routes through A/B experiments with
//! fixed, Thompson sampling and epsilon-greedy allocation.

pub mod config;
pub mod control_plane;
pub mod drift_monitor;
pub mod events;
pub mod experiment_log;
pub mod experiments;
pub mod feature_backend;
pub mod feature_cache;
pub mod latency;
pub mod metrics;
pub mod online_learning;
pub mod recommend;
pub mod retrain;
pub mod trainer;
pub mod user_features;

pub use config::RecfluxConfig;
pub use control_plane::{ControlPlane, EngineStatus, HealthReport, RecommendOutcome};
pub use events::{EventKind, InteractionEvent};
pub use experiments::{AllocationStrategy, ExperimentConfig, ExperimentSummary, VariantConfig};
pub use feature_backend::{
    EntityKind, FeatureBackend, FeatureVector, FileFeatureBackend, MemoryFeatureBackend,
};
pub use recommend::{DotProductScorer, ModelScorer, RecommendationRequest, RecommendationResponse};
pub use trainer::{MockTrainer, ModelTrainer, ProcessTrainer, TrainMode};
