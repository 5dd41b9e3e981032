//! Synthetic event replay through the full control plane.
//!
//! Drives a seeded interaction stream into ingestion, serves
//! recommendations through an optional A/B experiment and prints the
//! aggregated engine status at the end. Useful for eyeballing drift
//! detection and experiment analysis without a live deployment.

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recflux_engine::config::{BackendKind, RecfluxConfig};
use recflux_engine::control_plane::ControlPlane;
use recflux_engine::events::{EventKind, InteractionEvent};
use recflux_engine::experiments::{AllocationStrategy, ExperimentConfig, VariantConfig};
use recflux_engine::feature_backend::{
    connect_with_fallback, EntityKind, FeatureBackend, FeatureVector, FileFeatureBackend,
    MemoryFeatureBackend,
};
use recflux_engine::metrics;
use recflux_engine::recommend::{DotProductScorer, RecommendationRequest};
use recflux_engine::trainer::MockTrainer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "recflux_sim")]
#[command(about = "Synthetic event replay through the recommendation control plane")]
struct Args {
    /// Optional config file (YAML or TOML)
    #[arg(long)]
    config: Option<String>,

    /// Number of interaction events to replay
    #[arg(long, default_value_t = 5000)]
    events: usize,

    /// Number of distinct users
    #[arg(long, default_value_t = 200)]
    users: usize,

    /// Number of distinct catalog items
    #[arg(long, default_value_t = 500)]
    items: usize,

    /// RNG seed for the event stream and variant allocation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Run a two-variant experiment over the served recommendations
    #[arg(long, default_value_t = false)]
    with_experiment: bool,

    /// Fraction of the stream after which user behavior shifts
    #[arg(long, default_value_t = 0.0)]
    drift_after: f64,

    /// Print the Prometheus metrics dump at the end
    #[arg(long, default_value_t = false)]
    dump_metrics: bool,
}

fn pick_kind(rng: &mut StdRng) -> EventKind {
    match rng.gen_range(0..100u32) {
        0..=49 => EventKind::View,
        50..=74 => EventKind::Click,
        75..=84 => EventKind::Like,
        85..=89 => EventKind::Purchase,
        90..=94 => EventKind::Dislike,
        _ => EventKind::Share,
    }
}

async fn build_backend(config: &RecfluxConfig) -> Result<Arc<dyn FeatureBackend>> {
    let candidate: Arc<dyn FeatureBackend> = match config.backend.kind {
        BackendKind::Memory => Arc::new(MemoryFeatureBackend::new()),
        BackendKind::File => {
            let path = config
                .backend
                .path
                .as_deref()
                .context("backend.path required for the file backend")?;
            Arc::new(FileFeatureBackend::open(path)?)
        }
    };
    Ok(connect_with_fallback(
        candidate,
        config.backend.connect_attempts,
        Duration::from_millis(100),
        Duration::from_secs(2),
    )
    .await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "recflux_engine=info,recflux_sim=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let mut config = RecfluxConfig::load(args.config.as_deref())?;
    config.experiments.allocation_seed = Some(args.seed);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_HASH"),
        features = env!("CARGO_FEATURES"),
        "starting simulation"
    );

    let backend = build_backend(&config).await?;
    let item_dim = config.cache.item_dim;
    let plane = Arc::new(ControlPlane::new(
        config,
        backend,
        Arc::new(DotProductScorer),
        Arc::new(MockTrainer::default()),
    )?);
    let monitors = plane.spawn_background_monitors();

    // Seed the catalog with deterministic item vectors
    let mut rng = StdRng::seed_from_u64(args.seed);
    for item in 0..args.items {
        let values: Vec<f32> = (0..item_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let vector = FeatureVector::computed(EntityKind::Item, item_id(item, false), values);
        if let Err(e) = plane.cache().put(vector).await {
            warn!(error = %e, "item seed write failed");
        }
    }

    let experiment_id = if args.with_experiment {
        let id = plane.create_experiment(ExperimentConfig {
            name: "sim ranker rollout".to_string(),
            variants: vec![
                VariantConfig {
                    id: "control".to_string(),
                    name: "baseline".to_string(),
                    model_ref: "model_v1".to_string(),
                    weight: 0.5,
                },
                VariantConfig {
                    id: "treatment".to_string(),
                    name: "candidate".to_string(),
                    model_ref: "model_v2".to_string(),
                    weight: 0.5,
                },
            ],
            strategy: AllocationStrategy::Fixed,
            traffic_percentage: 1.0,
            min_sample_size: 50,
            epsilon: 0.1,
        })?;
        plane.start_experiment(&id)?;
        info!(experiment_id = %id, "experiment running");
        Some(id)
    } else {
        None
    };

    let drift_cutoff = if args.drift_after > 0.0 {
        (args.events as f64 * args.drift_after.min(1.0)) as usize
    } else {
        usize::MAX
    };

    println!("Replaying {} events over {} users", args.events, args.users);
    let mut ingested = 0usize;
    let mut served = 0usize;
    let mut conversions = 0usize;
    for i in 0..args.events {
        let shifted = i >= drift_cutoff;
        let user = format!("user_{}", rng.gen_range(0..args.users));
        let item = item_id(rng.gen_range(0..args.items), shifted);
        let kind = if shifted {
            // Post-shift traffic skews heavily toward purchases
            if rng.gen_bool(0.4) {
                EventKind::Purchase
            } else {
                pick_kind(&mut rng)
            }
        } else {
            pick_kind(&mut rng)
        };
        let mut event = InteractionEvent::new(user.clone(), item, kind);
        if kind == EventKind::Purchase {
            event = event.with_value(rng.gen_range(5.0..50.0));
        }
        match plane.ingest_event(event).await {
            Ok(_) => ingested += 1,
            Err(e) => warn!(error = %e, "event rejected"),
        }

        if i % 100 == 99 {
            let request = RecommendationRequest {
                user_id: user,
                candidate_items: Vec::new(),
                limit: 10,
                exclude_seen: true,
            };
            match plane.recommend(&request, experiment_id.as_deref()).await {
                Ok(outcome) => {
                    served += 1;
                    if let Some(assignment) = &outcome.assignment {
                        // Treatment converts at a higher simulated rate
                        let rate = if assignment.variant_id == "treatment" { 0.12 } else { 0.06 };
                        if rng.gen_bool(rate) {
                            plane
                                .record_conversion(
                                    &assignment.experiment_id,
                                    &assignment.variant_id,
                                    &request.user_id,
                                    Some(rng.gen_range(5.0..50.0)),
                                )
                                .await?;
                            conversions += 1;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "recommendation failed"),
            }
        }
    }

    let drift_report = plane.check_drift();
    let update = plane.trigger_model_update(true).await?;

    println!("\nSimulation complete");
    println!("  Events ingested: {ingested}");
    println!("  Recommendations served: {served}");
    println!("  Conversions recorded: {conversions}");
    println!("  Final model update: {update:?}");
    println!(
        "  Drift status: {} (max PSI {:.4})",
        drift_report.status.as_str(),
        drift_report.max_psi
    );

    if let Some(id) = &experiment_id {
        let summary = plane.conclude_experiment(id)?;
        println!(
            "  Experiment {}: winner {:?} after {} impressions",
            summary.id, summary.winner, summary.total_impressions
        );
        for variant in &summary.variants {
            println!(
                "    {}: {} impressions, {} conversions ({:.2}%), {:.2} revenue",
                variant.id,
                variant.impressions,
                variant.conversions,
                variant.conversion_rate * 100.0,
                variant.revenue
            );
        }
    }

    let status = plane.status();
    println!(
        "\nEngine status:\n{}",
        serde_json::to_string_pretty(&status).context("encode status")?
    );

    if args.dump_metrics {
        println!("\n{}", metrics::render());
    }

    monitors.stop().await;
    plane.shutdown().await?;
    Ok(())
}

fn item_id(index: usize, shifted: bool) -> String {
    // Category prefix changes after the drift cutoff so derived user
    // vectors move with the catalog
    if shifted {
        format!("fresh_{index}")
    } else {
        format!("movie_{index}")
    }
}
