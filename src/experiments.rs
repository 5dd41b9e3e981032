//! A/B experiment lifecycle and variant allocation
//!
//! Experiments move draft → running → (paused ⇄ running) → concluded.
//! Running experiments admit a fraction of traffic and allocate admitted
//! users to variants via one of three strategies: deterministic
//! hash-bucketed weights, Thompson sampling over Beta posteriors, or
//! epsilon-greedy exploitation. Winner analysis runs a chi-square
//! independence test over the variants' conversion table.

use crate::metrics;
use crate::user_features::stable_id_hash;
use anyhow::{bail, ensure, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{info, warn};

/// Impressions every variant needs before winner analysis runs
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 1000;

/// Exploration probability for epsilon-greedy allocation
pub const DEFAULT_EPSILON: f64 = 0.1;

/// Significance threshold for declaring a winner
pub const SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Latency samples retained per variant
const VARIANT_LATENCY_CAP: usize = 1000;

/// Window for the reported average latency
const LATENCY_AVG_WINDOW: usize = 100;

/// Hash buckets for deterministic allocation
const HASH_BUCKETS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    Fixed,
    ThompsonSampling,
    EpsilonGreedy,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::Fixed => "fixed",
            AllocationStrategy::ThompsonSampling => "thompson_sampling",
            AllocationStrategy::EpsilonGreedy => "epsilon_greedy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Concluded,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Concluded => "concluded",
        }
    }
}

/// One arm of an experiment as supplied at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    pub name: String,
    /// Identifier of the model this arm serves, resolved by the caller
    pub model_ref: String,
    /// Traffic share under fixed allocation; all weights must sum to 1.0
    pub weight: f64,
}

/// Experiment as supplied at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub variants: Vec<VariantConfig>,
    pub strategy: AllocationStrategy,
    /// Fraction of traffic admitted into the experiment, 0.0 to 1.0
    pub traffic_percentage: f64,
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_min_sample_size() -> u64 {
    DEFAULT_MIN_SAMPLE_SIZE
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

impl ExperimentConfig {
    fn validate(&self) -> Result<()> {
        ensure!(!self.name.trim().is_empty(), "experiment name is empty");
        ensure!(
            self.variants.len() >= 2,
            "experiment needs at least 2 variants, got {}",
            self.variants.len()
        );
        let mut seen = HashSet::new();
        let mut weight_sum = 0.0;
        for v in &self.variants {
            ensure!(!v.id.trim().is_empty(), "variant id is empty");
            ensure!(!v.model_ref.trim().is_empty(), "variant {} has no model_ref", v.id);
            ensure!(
                seen.insert(v.id.clone()),
                "duplicate variant id: {}",
                v.id
            );
            ensure!(
                (0.0..=1.0).contains(&v.weight),
                "variant {} weight {} outside [0, 1]",
                v.id,
                v.weight
            );
            weight_sum += v.weight;
        }
        ensure!(
            (weight_sum - 1.0).abs() < 1e-6,
            "variant weights sum to {weight_sum}, expected 1.0"
        );
        ensure!(
            (0.0..=1.0).contains(&self.traffic_percentage),
            "traffic_percentage {} outside [0, 1]",
            self.traffic_percentage
        );
        ensure!(self.min_sample_size >= 1, "min_sample_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.epsilon),
            "epsilon {} outside [0, 1]",
            self.epsilon
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Variant {
    config: VariantConfig,
    impressions: u64,
    conversions: u64,
    revenue: f64,
    latency_samples: VecDeque<f64>,
}

impl Variant {
    fn new(config: VariantConfig) -> Self {
        Self {
            config,
            impressions: 0,
            conversions: 0,
            revenue: 0.0,
            latency_samples: VecDeque::new(),
        }
    }

    fn conversion_rate(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.conversions as f64 / self.impressions as f64
        }
    }

    fn record_latency(&mut self, ms: f64) {
        if self.latency_samples.len() >= VARIANT_LATENCY_CAP {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(ms);
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        let window = self.latency_samples.len().min(LATENCY_AVG_WINDOW);
        let start = self.latency_samples.len() - window;
        let sum: f64 = self.latency_samples.iter().skip(start).sum();
        sum / window as f64
    }
}

struct Experiment {
    id: String,
    config: ExperimentConfig,
    status: ExperimentStatus,
    variants: Vec<Variant>,
    winner: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    concluded_at: Option<DateTime<Utc>>,
}

impl Experiment {
    fn variant_mut(&mut self, variant_id: &str) -> Result<&mut Variant> {
        self.variants
            .iter_mut()
            .find(|v| v.config.id == variant_id)
            .ok_or_else(|| {
                anyhow::anyhow!("unknown variant {} in experiment {}", variant_id, self.id)
            })
    }
}

/// Per-variant slice of an [`ExperimentSummary`]
#[derive(Debug, Clone, Serialize)]
pub struct VariantSummary {
    pub id: String,
    pub name: String,
    pub model_ref: String,
    pub weight: f64,
    pub impressions: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub revenue: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub strategy: AllocationStrategy,
    pub traffic_percentage: f64,
    pub total_impressions: u64,
    pub total_conversions: u64,
    pub variants: Vec<VariantSummary>,
    pub winner: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub concluded_at: Option<DateTime<Utc>>,
}

/// Winner analysis over the conversion table
#[derive(Debug, Clone, Serialize)]
pub struct WinnerAnalysis {
    pub winner: Option<String>,
    pub p_value: f64,
    pub confidence: f64,
    pub significant: bool,
    pub conversion_rates: HashMap<String, f64>,
    pub sample_sizes: HashMap<String, u64>,
}

/// Owns all experiments and the allocation RNG.
///
/// The RNG is a seedable ChaCha8 stream so that simulations and tests can
/// replay allocation decisions exactly.
pub struct ExperimentAllocator {
    experiments: RwLock<HashMap<String, Experiment>>,
    rng: Mutex<ChaCha8Rng>,
}

impl ExperimentAllocator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            experiments: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Validates and registers a new experiment in draft status.
    pub fn create_experiment(&self, config: ExperimentConfig) -> Result<String> {
        config.validate()?;
        let id = format!(
            "exp_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let variants = config.variants.iter().cloned().map(Variant::new).collect();
        let experiment = Experiment {
            id: id.clone(),
            config,
            status: ExperimentStatus::Draft,
            variants,
            winner: None,
            created_at: Utc::now(),
            started_at: None,
            concluded_at: None,
        };
        info!(experiment_id = %id, name = %experiment.config.name, "experiment created");
        self.experiments.write().insert(id.clone(), experiment);
        Ok(id)
    }

    pub fn start_experiment(&self, experiment_id: &str) -> Result<()> {
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        match experiment.status {
            ExperimentStatus::Draft | ExperimentStatus::Paused => {
                experiment.status = ExperimentStatus::Running;
                if experiment.started_at.is_none() {
                    experiment.started_at = Some(Utc::now());
                }
                metrics::ACTIVE_EXPERIMENTS.inc();
                info!(experiment_id, "experiment started");
                Ok(())
            }
            status => bail!(
                "cannot start experiment {experiment_id} from status {}",
                status.as_str()
            ),
        }
    }

    pub fn pause_experiment(&self, experiment_id: &str) -> Result<()> {
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        match experiment.status {
            ExperimentStatus::Running => {
                experiment.status = ExperimentStatus::Paused;
                metrics::ACTIVE_EXPERIMENTS.dec();
                info!(experiment_id, "experiment paused");
                Ok(())
            }
            status => bail!(
                "cannot pause experiment {experiment_id} from status {}",
                status.as_str()
            ),
        }
    }

    /// Concludes the experiment, freezing the winner analysis taken at
    /// conclusion time.
    pub fn conclude_experiment(&self, experiment_id: &str) -> Result<ExperimentSummary> {
        let analysis = self.evaluate_winner(experiment_id)?;
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        match experiment.status {
            ExperimentStatus::Running | ExperimentStatus::Paused => {
                if experiment.status == ExperimentStatus::Running {
                    metrics::ACTIVE_EXPERIMENTS.dec();
                }
                experiment.status = ExperimentStatus::Concluded;
                experiment.concluded_at = Some(Utc::now());
                if let Some(analysis) = &analysis {
                    experiment.winner = analysis.winner.clone();
                }
                info!(
                    experiment_id,
                    winner = experiment.winner.as_deref().unwrap_or("none"),
                    "experiment concluded"
                );
                Ok(summarize(experiment, analysis.as_ref()))
            }
            status => bail!(
                "cannot conclude experiment {experiment_id} from status {}",
                status.as_str()
            ),
        }
    }

    /// Allocates a user to a variant, or `None` when the user falls
    /// outside the admitted traffic slice or the experiment is not running.
    pub fn select_variant(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> Result<Option<String>> {
        let experiments = self.experiments.read();
        let experiment = lookup(&experiments, experiment_id)?;
        if experiment.status != ExperimentStatus::Running {
            return Ok(None);
        }

        {
            let mut rng = self.rng.lock();
            let draw: f64 = rng.gen();
            if draw >= experiment.config.traffic_percentage {
                return Ok(None);
            }
        }

        let variant_id = match experiment.config.strategy {
            AllocationStrategy::Fixed => self.allocate_fixed(experiment, user_id),
            AllocationStrategy::ThompsonSampling => self.allocate_thompson(experiment),
            AllocationStrategy::EpsilonGreedy => self.allocate_epsilon_greedy(experiment),
        };
        metrics::VARIANT_SELECTIONS_TOTAL.inc();
        Ok(Some(variant_id))
    }

    /// Deterministic allocation: users hash into a stable bucket that is
    /// walked against cumulative variant weights.
    fn allocate_fixed(&self, experiment: &Experiment, user_id: &str) -> String {
        let bucket = (stable_id_hash(user_id) % HASH_BUCKETS) as f64 / HASH_BUCKETS as f64;
        let mut cumulative = 0.0;
        for variant in &experiment.variants {
            cumulative += variant.config.weight;
            if bucket < cumulative {
                return variant.config.id.clone();
            }
        }
        // Float dust can leave the last boundary just below 1.0
        experiment
            .variants
            .last()
            .map(|v| v.config.id.clone())
            .unwrap_or_default()
    }

    /// Thompson sampling: draw from each arm's Beta posterior and take
    /// the largest sample.
    fn allocate_thompson(&self, experiment: &Experiment) -> String {
        let mut rng = self.rng.lock();
        let mut best_id = experiment.variants[0].config.id.clone();
        let mut best_sample = f64::MIN;
        for variant in &experiment.variants {
            let alpha = variant.conversions as f64 + 1.0;
            let beta = variant.impressions.saturating_sub(variant.conversions) as f64 + 1.0;
            let sample = match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(&mut *rng),
                Err(_) => 0.5,
            };
            if sample > best_sample {
                best_sample = sample;
                best_id = variant.config.id.clone();
            }
        }
        best_id
    }

    /// Epsilon-greedy: explore uniformly with probability epsilon,
    /// otherwise exploit the best observed conversion rate.
    fn allocate_epsilon_greedy(&self, experiment: &Experiment) -> String {
        let mut rng = self.rng.lock();
        let draw: f64 = rng.gen();
        if draw < experiment.config.epsilon {
            let idx = rng.gen_range(0..experiment.variants.len());
            return experiment.variants[idx].config.id.clone();
        }
        let mut best = &experiment.variants[0];
        for variant in &experiment.variants[1..] {
            if variant.conversion_rate() > best.conversion_rate() {
                best = variant;
            }
        }
        best.config.id.clone()
    }

    pub fn record_impression(&self, experiment_id: &str, variant_id: &str) -> Result<()> {
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        let variant = experiment.variant_mut(variant_id)?;
        variant.impressions += 1;
        metrics::EXPERIMENT_IMPRESSIONS_TOTAL.inc();
        Ok(())
    }

    pub fn record_conversion(
        &self,
        experiment_id: &str,
        variant_id: &str,
        revenue: Option<f64>,
    ) -> Result<()> {
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        let variant = experiment.variant_mut(variant_id)?;
        variant.conversions += 1;
        if let Some(revenue) = revenue {
            if revenue.is_finite() && revenue > 0.0 {
                variant.revenue += revenue;
            }
        }
        metrics::EXPERIMENT_CONVERSIONS_TOTAL.inc();
        Ok(())
    }

    pub fn record_latency(
        &self,
        experiment_id: &str,
        variant_id: &str,
        latency_ms: f64,
    ) -> Result<()> {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Ok(());
        }
        let mut experiments = self.experiments.write();
        let experiment = lookup_mut(&mut experiments, experiment_id)?;
        experiment.variant_mut(variant_id)?.record_latency(latency_ms);
        Ok(())
    }

    /// Chi-square winner analysis. Returns `None` until every variant has
    /// collected `min_sample_size` impressions; past the floor, the
    /// highest-conversion variant is always named and `confidence`
    /// (1 - p-value) tells the caller how much to trust it.
    pub fn evaluate_winner(&self, experiment_id: &str) -> Result<Option<WinnerAnalysis>> {
        let experiments = self.experiments.read();
        let experiment = lookup(&experiments, experiment_id)?;

        let min = experiment.config.min_sample_size;
        if experiment.variants.iter().any(|v| v.impressions < min) {
            return Ok(None);
        }

        let impressions: Vec<u64> = experiment.variants.iter().map(|v| v.impressions).collect();
        let conversions: Vec<u64> = experiment.variants.iter().map(|v| v.conversions).collect();
        let p_value = conversion_table_p_value(&conversions, &impressions);
        let significant = p_value < SIGNIFICANCE_LEVEL;

        let winner = experiment
            .variants
            .iter()
            .max_by(|a, b| {
                a.conversion_rate()
                    .partial_cmp(&b.conversion_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|v| v.config.id.clone());

        if !significant {
            warn!(
                experiment_id,
                p_value, "winner analysis inconclusive at current sample sizes"
            );
        }

        Ok(Some(WinnerAnalysis {
            winner,
            p_value,
            confidence: 1.0 - p_value,
            significant,
            conversion_rates: experiment
                .variants
                .iter()
                .map(|v| (v.config.id.clone(), v.conversion_rate()))
                .collect(),
            sample_sizes: experiment
                .variants
                .iter()
                .map(|v| (v.config.id.clone(), v.impressions))
                .collect(),
        }))
    }

    pub fn summary(&self, experiment_id: &str) -> Result<ExperimentSummary> {
        let analysis = self.evaluate_winner(experiment_id)?;
        let experiments = self.experiments.read();
        let experiment = lookup(&experiments, experiment_id)?;
        Ok(summarize(experiment, analysis.as_ref()))
    }

    pub fn list_experiments(&self) -> Vec<ExperimentSummary> {
        let experiments = self.experiments.read();
        let mut summaries: Vec<_> = experiments
            .values()
            .map(|e| summarize(e, None))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn experiment_count(&self) -> usize {
        self.experiments.read().len()
    }

    /// Model reference served by a variant, for scorer routing.
    pub fn model_ref(&self, experiment_id: &str, variant_id: &str) -> Result<String> {
        let experiments = self.experiments.read();
        let experiment = lookup(&experiments, experiment_id)?;
        experiment
            .variants
            .iter()
            .find(|v| v.config.id == variant_id)
            .map(|v| v.config.model_ref.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("unknown variant {variant_id} in experiment {experiment_id}")
            })
    }
}

fn lookup<'a>(
    experiments: &'a HashMap<String, Experiment>,
    experiment_id: &str,
) -> Result<&'a Experiment> {
    experiments
        .get(experiment_id)
        .ok_or_else(|| anyhow::anyhow!("unknown experiment: {experiment_id}"))
}

fn lookup_mut<'a>(
    experiments: &'a mut HashMap<String, Experiment>,
    experiment_id: &str,
) -> Result<&'a mut Experiment> {
    experiments
        .get_mut(experiment_id)
        .ok_or_else(|| anyhow::anyhow!("unknown experiment: {experiment_id}"))
}

fn summarize(experiment: &Experiment, analysis: Option<&WinnerAnalysis>) -> ExperimentSummary {
    ExperimentSummary {
        id: experiment.id.clone(),
        name: experiment.config.name.clone(),
        status: experiment.status,
        strategy: experiment.config.strategy,
        traffic_percentage: experiment.config.traffic_percentage,
        total_impressions: experiment.variants.iter().map(|v| v.impressions).sum(),
        total_conversions: experiment.variants.iter().map(|v| v.conversions).sum(),
        variants: experiment
            .variants
            .iter()
            .map(|v| VariantSummary {
                id: v.config.id.clone(),
                name: v.config.name.clone(),
                model_ref: v.config.model_ref.clone(),
                weight: v.config.weight,
                impressions: v.impressions,
                conversions: v.conversions,
                conversion_rate: v.conversion_rate(),
                revenue: v.revenue,
                avg_latency_ms: v.avg_latency_ms(),
            })
            .collect(),
        winner: experiment
            .winner
            .clone()
            .or_else(|| analysis.and_then(|a| a.winner.clone())),
        confidence: analysis.map(|a| a.confidence),
        created_at: experiment.created_at,
        started_at: experiment.started_at,
        concluded_at: experiment.concluded_at,
    }
}

/// P-value for a 2×V independence test over conversions vs non-conversions.
///
/// Degenerate tables (all converted or none converted) carry no signal and
/// report 1.0.
fn conversion_table_p_value(conversions: &[u64], impressions: &[u64]) -> f64 {
    let grand: u64 = impressions.iter().sum();
    let total_conv: u64 = conversions.iter().sum();
    let total_nonconv = grand - total_conv;
    if grand == 0 || total_conv == 0 || total_nonconv == 0 || impressions.len() < 2 {
        return 1.0;
    }

    let mut statistic = 0.0;
    for (&conv, &imp) in conversions.iter().zip(impressions) {
        if imp == 0 {
            continue;
        }
        let expected_conv = imp as f64 * total_conv as f64 / grand as f64;
        let expected_nonconv = imp as f64 * total_nonconv as f64 / grand as f64;
        let observed_nonconv = (imp - conv) as f64;
        statistic += (conv as f64 - expected_conv).powi(2) / expected_conv;
        statistic += (observed_nonconv - expected_nonconv).powi(2) / expected_nonconv;
    }

    let df = (impressions.iter().filter(|&&i| i > 0).count() - 1) as f64;
    if df < 1.0 {
        return 1.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) => (1.0 - dist.cdf(statistic)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_variant_config(strategy: AllocationStrategy, traffic: f64) -> ExperimentConfig {
        ExperimentConfig {
            name: "ranker rollout".to_string(),
            variants: vec![
                VariantConfig {
                    id: "control".to_string(),
                    name: "baseline ranker".to_string(),
                    model_ref: "model_v1".to_string(),
                    weight: 0.5,
                },
                VariantConfig {
                    id: "treatment".to_string(),
                    name: "candidate ranker".to_string(),
                    model_ref: "model_v2".to_string(),
                    weight: 0.5,
                },
            ],
            strategy,
            traffic_percentage: traffic,
            min_sample_size: 100,
            epsilon: DEFAULT_EPSILON,
        }
    }

    fn running(allocator: &ExperimentAllocator, config: ExperimentConfig) -> String {
        let id = allocator.create_experiment(config).unwrap();
        allocator.start_experiment(&id).unwrap();
        id
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let allocator = ExperimentAllocator::new(Some(1));

        let mut single = two_variant_config(AllocationStrategy::Fixed, 1.0);
        single.variants.truncate(1);
        assert!(allocator.create_experiment(single).is_err());

        let mut skewed = two_variant_config(AllocationStrategy::Fixed, 1.0);
        skewed.variants[0].weight = 0.9;
        assert!(allocator.create_experiment(skewed).is_err());

        let mut dup = two_variant_config(AllocationStrategy::Fixed, 1.0);
        dup.variants[1].id = "control".to_string();
        assert!(allocator.create_experiment(dup).is_err());

        let mut flood = two_variant_config(AllocationStrategy::Fixed, 1.5);
        flood.name = "too much traffic".to_string();
        assert!(allocator.create_experiment(flood).is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let allocator = ExperimentAllocator::new(Some(1));
        let id = allocator
            .create_experiment(two_variant_config(AllocationStrategy::Fixed, 1.0))
            .unwrap();
        assert!(id.starts_with("exp_"));

        // Draft experiments do not serve
        assert_eq!(allocator.select_variant(&id, "user_1").unwrap(), None);

        // Draft cannot be paused or re-concluded out of order
        assert!(allocator.pause_experiment(&id).is_err());

        allocator.start_experiment(&id).unwrap();
        assert!(allocator.select_variant(&id, "user_1").unwrap().is_some());

        allocator.pause_experiment(&id).unwrap();
        assert_eq!(allocator.select_variant(&id, "user_1").unwrap(), None);

        allocator.start_experiment(&id).unwrap();
        let summary = allocator.conclude_experiment(&id).unwrap();
        assert_eq!(summary.status, ExperimentStatus::Concluded);
        assert!(summary.concluded_at.is_some());

        // Concluded is terminal
        assert!(allocator.start_experiment(&id).is_err());
        assert_eq!(allocator.select_variant(&id, "user_1").unwrap(), None);
    }

    #[test]
    fn test_fixed_allocation_is_deterministic_per_user() {
        let allocator = ExperimentAllocator::new(Some(7));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for user in ["user_a", "user_b", "user_c"] {
            let first = allocator.select_variant(&id, user).unwrap().unwrap();
            for _ in 0..10 {
                let again = allocator.select_variant(&id, user).unwrap().unwrap();
                assert_eq!(first, again, "allocation drifted for {user}");
            }
        }
    }

    #[test]
    fn test_fixed_allocation_splits_near_weights() {
        let allocator = ExperimentAllocator::new(Some(7));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        let mut control = 0;
        let mut treatment = 0;
        for i in 0..1000 {
            match allocator
                .select_variant(&id, &format!("user_{i}"))
                .unwrap()
                .unwrap()
                .as_str()
            {
                "control" => control += 1,
                "treatment" => treatment += 1,
                other => panic!("unexpected variant {other}"),
            }
        }
        assert_eq!(control + treatment, 1000);
        assert!(
            (400..=600).contains(&control),
            "split too far from weights: {control}/{treatment}"
        );
    }

    #[test]
    fn test_zero_traffic_admits_nobody() {
        let allocator = ExperimentAllocator::new(Some(3));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 0.0));
        for i in 0..50 {
            assert_eq!(
                allocator.select_variant(&id, &format!("user_{i}")).unwrap(),
                None
            );
        }
    }

    #[test]
    fn test_thompson_sampling_favors_converting_variant() {
        let allocator = ExperimentAllocator::new(Some(11));
        let id = running(
            &allocator,
            two_variant_config(AllocationStrategy::ThompsonSampling, 1.0),
        );

        for _ in 0..100 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        for _ in 0..10 {
            allocator.record_conversion(&id, "control", None).unwrap();
        }
        for _ in 0..90 {
            allocator.record_conversion(&id, "treatment", None).unwrap();
        }

        let mut treatment = 0;
        for i in 0..200 {
            if allocator
                .select_variant(&id, &format!("user_{i}"))
                .unwrap()
                .unwrap()
                == "treatment"
            {
                treatment += 1;
            }
        }
        assert!(treatment > 150, "posterior ignored: {treatment}/200");
    }

    #[test]
    fn test_epsilon_greedy_exploits_best_rate() {
        let allocator = ExperimentAllocator::new(Some(13));
        let id = running(
            &allocator,
            two_variant_config(AllocationStrategy::EpsilonGreedy, 1.0),
        );

        for _ in 0..100 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        for _ in 0..40 {
            allocator.record_conversion(&id, "treatment", None).unwrap();
        }

        let mut treatment = 0;
        for i in 0..200 {
            if allocator
                .select_variant(&id, &format!("user_{i}"))
                .unwrap()
                .unwrap()
                == "treatment"
            {
                treatment += 1;
            }
        }
        assert!(treatment > 160, "exploitation too weak: {treatment}/200");
    }

    #[test]
    fn test_winner_requires_min_samples() {
        let allocator = ExperimentAllocator::new(Some(17));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for _ in 0..50 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        assert!(allocator.evaluate_winner(&id).unwrap().is_none());
    }

    #[test]
    fn test_winner_analysis_detects_better_variant() {
        let allocator = ExperimentAllocator::new(Some(19));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for _ in 0..150 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        for _ in 0..30 {
            allocator.record_conversion(&id, "control", None).unwrap();
        }
        for _ in 0..60 {
            allocator
                .record_conversion(&id, "treatment", Some(9.99))
                .unwrap();
        }

        let analysis = allocator.evaluate_winner(&id).unwrap().unwrap();
        assert!(analysis.significant);
        assert_eq!(analysis.winner.as_deref(), Some("treatment"));
        assert!(analysis.confidence > 0.9, "confidence {}", analysis.confidence);

        let summary = allocator.conclude_experiment(&id).unwrap();
        assert_eq!(summary.winner.as_deref(), Some("treatment"));
        let treatment = summary
            .variants
            .iter()
            .find(|v| v.id == "treatment")
            .unwrap();
        assert!((treatment.revenue - 60.0 * 9.99).abs() < 1e-6);
        assert!((treatment.conversion_rate - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_even_conversions_not_significant() {
        let allocator = ExperimentAllocator::new(Some(23));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for _ in 0..150 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        for _ in 0..30 {
            allocator.record_conversion(&id, "control", None).unwrap();
            allocator.record_conversion(&id, "treatment", None).unwrap();
        }

        let analysis = allocator.evaluate_winner(&id).unwrap().unwrap();
        assert!(!analysis.significant);
        assert!(analysis.p_value > 0.9);
        assert!(analysis.confidence < 0.1);
        // A tied table still names a leader, with no confidence behind it
        assert!(analysis.winner.is_some());
    }

    #[test]
    fn test_winner_named_below_significance() {
        let allocator = ExperimentAllocator::new(Some(37));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for _ in 0..100 {
            allocator.record_impression(&id, "control").unwrap();
            allocator.record_impression(&id, "treatment").unwrap();
        }
        for _ in 0..10 {
            allocator.record_conversion(&id, "control", None).unwrap();
        }
        for _ in 0..12 {
            allocator.record_conversion(&id, "treatment", None).unwrap();
        }

        // 10% vs 12% over 100 impressions each is nowhere near significant,
        // but the leading variant is still reported with its low confidence
        let analysis = allocator.evaluate_winner(&id).unwrap().unwrap();
        assert!(!analysis.significant);
        assert_eq!(analysis.winner.as_deref(), Some("treatment"));
        assert!(analysis.confidence < 0.9, "confidence {}", analysis.confidence);
        assert!((analysis.confidence - (1.0 - analysis.p_value)).abs() < 1e-12);

        let summary = allocator.conclude_experiment(&id).unwrap();
        assert_eq!(summary.winner.as_deref(), Some("treatment"));
    }

    #[test]
    fn test_latency_average_uses_recent_window() {
        let allocator = ExperimentAllocator::new(Some(29));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));

        for _ in 0..200 {
            allocator.record_latency(&id, "control", 10.0).unwrap();
        }
        for _ in 0..100 {
            allocator.record_latency(&id, "control", 30.0).unwrap();
        }
        let summary = allocator.summary(&id).unwrap();
        let control = summary.variants.iter().find(|v| v.id == "control").unwrap();
        // Average covers only the most recent 100 samples
        assert!((control.avg_latency_ms - 30.0).abs() < 1e-9);

        // Garbage samples are ignored
        allocator.record_latency(&id, "control", f64::NAN).unwrap();
        allocator.record_latency(&id, "control", -5.0).unwrap();
        let summary = allocator.summary(&id).unwrap();
        let control = summary.variants.iter().find(|v| v.id == "control").unwrap();
        assert!((control.avg_latency_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_model_ref_resolution() {
        let allocator = ExperimentAllocator::new(Some(31));
        let id = running(&allocator, two_variant_config(AllocationStrategy::Fixed, 1.0));
        assert_eq!(allocator.model_ref(&id, "treatment").unwrap(), "model_v2");
        assert!(allocator.model_ref(&id, "missing").is_err());
        assert!(allocator.model_ref("exp_nope", "control").is_err());
    }
}
