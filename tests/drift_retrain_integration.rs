// Drift detection feeding retrain triggers, end to end: ingestion shapes
// the monitored distributions, the coordinator reacts, a successful run
// refreshes the baseline.

use recflux_engine::config::RecfluxConfig;
use recflux_engine::control_plane::ControlPlane;
use recflux_engine::drift_monitor::DriftStatus;
use recflux_engine::events::{EventKind, InteractionEvent};
use recflux_engine::feature_backend::MemoryFeatureBackend;
use recflux_engine::recommend::DotProductScorer;
use recflux_engine::retrain::{RetrainReason, TriggerOutcome};
use recflux_engine::trainer::{MockTrainer, TrainMode};
use std::sync::Arc;
use std::time::Duration;

fn build_plane(config: RecfluxConfig) -> (Arc<ControlPlane>, Arc<MockTrainer>) {
    let trainer = Arc::new(MockTrainer::new(Duration::from_millis(1)));
    let plane = Arc::new(
        ControlPlane::new(
            config,
            Arc::new(MemoryFeatureBackend::new()),
            Arc::new(DotProductScorer),
            trainer.clone(),
        )
        .unwrap(),
    );
    (plane, trainer)
}

fn volume_config(threshold: u64) -> RecfluxConfig {
    let mut config = RecfluxConfig::default();
    config.retrain.volume_threshold = threshold;
    config.retrain.schedule_interval_hours = None;
    config
}

async fn ingest_views(plane: &ControlPlane, users: usize, events_per_user: usize) {
    for round in 0..events_per_user {
        for user in 0..users {
            plane
                .ingest_event(InteractionEvent::new(
                    format!("viewer_{user}"),
                    format!("movie_{}", (user + round) % 30),
                    EventKind::View,
                ))
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_drift_to_retrain_pipeline() {
    let mut config = RecfluxConfig::default();
    config.drift.reference_window = 400;
    config.drift.current_window = 200;
    config.retrain.schedule_interval_hours = None;
    let (plane, trainer) = build_plane(config);

    // Phase one: browsing-only traffic establishes the baseline. The first
    // check promotes the current window into the empty reference.
    ingest_views(&plane, 25, 12).await;
    let report = plane.check_drift();
    assert!(report.rebaselined);
    assert_eq!(report.status, DriftStatus::Normal);

    // Phase two: a purchase-heavy cohort arrives; engagement-ratio and
    // purchase-count dimensions move hard.
    for user in 0..15 {
        for round in 0..10 {
            plane
                .ingest_event(
                    InteractionEvent::new(
                        format!("buyer_{user}"),
                        format!("movie_{}", (user + round) % 30),
                        EventKind::Purchase,
                    )
                    .with_value(25.0),
                )
                .await
                .unwrap();
        }
    }

    let report = plane.check_drift();
    assert_eq!(report.status, DriftStatus::Critical);
    assert!(report.max_psi > 0.2, "max psi {}", report.max_psi);
    assert!(!report.drifted_dimensions.is_empty());

    // The trigger coordinator sees the same windows and fires a full run
    let outcome = plane
        .retrain_coordinator()
        .check_and_trigger()
        .await
        .unwrap();
    match outcome {
        TriggerOutcome::Triggered { reason, report } => {
            assert_eq!(reason, RetrainReason::DataDrift);
            assert_eq!(report.mode, TrainMode::Full);
        }
        other => panic!("expected a drift-triggered run, got {other:?}"),
    }
    assert_eq!(trainer.calls(), 1);

    let status = plane.status();
    assert_eq!(status.retrain.drift_triggers, 1);
    assert_eq!(status.retrain.events_since_retrain, 0);
    assert!(status.retrain.last_retrain_at.is_some());

    // The successful run consumed the drifted window as the new baseline,
    // so the pressure is gone
    let outcome = plane
        .retrain_coordinator()
        .check_and_trigger()
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::NotNeeded));
    assert_eq!(trainer.calls(), 1);
}

#[tokio::test]
async fn test_volume_trigger_through_plane() {
    let (plane, trainer) = build_plane(volume_config(20));
    ingest_views(&plane, 5, 5).await;

    let outcome = plane
        .retrain_coordinator()
        .check_and_trigger()
        .await
        .unwrap();
    match outcome {
        TriggerOutcome::Triggered { reason, report } => {
            assert_eq!(reason, RetrainReason::DataVolume);
            assert_eq!(report.mode, TrainMode::Incremental);
        }
        other => panic!("expected a volume-triggered run, got {other:?}"),
    }
    assert_eq!(trainer.calls(), 1);

    let status = plane.status().retrain;
    assert_eq!(status.volume_triggers, 1);
    assert_eq!(status.events_since_retrain, 0);
}

#[tokio::test]
async fn test_failed_retrain_keeps_trigger_pressure() {
    let (plane, trainer) = build_plane(volume_config(20));
    trainer.set_failing(true);
    ingest_views(&plane, 5, 5).await;

    let outcome = plane
        .retrain_coordinator()
        .check_and_trigger()
        .await
        .unwrap();
    match outcome {
        TriggerOutcome::Failed { reason, error } => {
            assert_eq!(reason, RetrainReason::DataVolume);
            assert!(error.contains("injected"), "unexpected error {error}");
        }
        other => panic!("expected a failed run, got {other:?}"),
    }
    // Failure leaves the accumulated volume and no retrain timestamp
    let status = plane.status().retrain;
    assert_eq!(status.events_since_retrain, 25);
    assert_eq!(status.failed_runs, 1);
    assert!(status.last_retrain_at.is_none());

    // The next healthy check retries and clears the pressure
    trainer.set_failing(false);
    let outcome = plane
        .retrain_coordinator()
        .check_and_trigger()
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Triggered { .. }));
    assert_eq!(plane.status().retrain.events_since_retrain, 0);
}

#[tokio::test]
async fn test_manual_retrain_resets_volume() {
    let (plane, trainer) = build_plane(volume_config(10_000));
    ingest_views(&plane, 3, 3).await;
    assert_eq!(plane.status().retrain.events_since_retrain, 9);

    let outcome = plane.trigger_retrain(TrainMode::Full).await.unwrap();
    match outcome {
        TriggerOutcome::Triggered { reason, report } => {
            assert_eq!(reason, RetrainReason::Manual);
            assert_eq!(report.mode, TrainMode::Full);
        }
        other => panic!("expected a manual run, got {other:?}"),
    }
    assert_eq!(trainer.calls(), 1);

    let status = plane.status().retrain;
    assert_eq!(status.manual_triggers, 1);
    assert_eq!(status.events_since_retrain, 0);
}

#[tokio::test]
async fn test_background_monitor_fires_on_volume() {
    let mut config = volume_config(5);
    config.retrain.check_interval_secs = 1;
    config.drift.check_interval_secs = 3600;
    let (plane, trainer) = build_plane(config);

    let monitors = plane.spawn_background_monitors();
    ingest_views(&plane, 2, 5).await;

    // The next periodic check sees 10 > 5 accumulated events
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(trainer.calls() >= 1, "monitor never fired");
    assert_eq!(plane.status().retrain.events_since_retrain, 0);

    monitors.stop().await;
}
