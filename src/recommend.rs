//! Recommendation serving pipeline
//!
//! Pulls user and item vectors through the feature cache, scores
//! candidates behind the [`ModelScorer`] seam and returns a ranked page.
//! Users without interaction history get a popularity fallback ranked by
//! reciprocal rank instead of model scores.

use crate::feature_backend::{EntityKind, FeatureVector};
use crate::feature_cache::FeatureCacheService;
use crate::latency::{LatencySummary, LatencyTracker, DEFAULT_LATENCY_WINDOW};
use crate::metrics;
use crate::user_features::UserStatsRegistry;
use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Hard cap on candidates scored per request
pub const MAX_CANDIDATES: usize = 1000;

/// Default page size
pub const DEFAULT_RECOMMENDATION_LIMIT: usize = 10;

/// Model reference used outside experiments
pub const DEFAULT_MODEL_REF: &str = "default";

/// Scoring seam. Real deployments route `model_ref` to a serving stack;
/// the in-process [`DotProductScorer`] keeps the pipeline self-contained.
#[async_trait]
pub trait ModelScorer: Send + Sync {
    async fn score_batch(
        &self,
        model_ref: &str,
        user: &FeatureVector,
        items: &[FeatureVector],
    ) -> Result<Vec<f64>>;

    fn name(&self) -> &'static str {
        "scorer"
    }
}

/// Dot product over the overlapping dimensions of user and item vectors.
pub struct DotProductScorer;

#[async_trait]
impl ModelScorer for DotProductScorer {
    async fn score_batch(
        &self,
        _model_ref: &str,
        user: &FeatureVector,
        items: &[FeatureVector],
    ) -> Result<Vec<f64>> {
        Ok(items
            .iter()
            .map(|item| {
                user.values
                    .iter()
                    .zip(&item.values)
                    .map(|(u, i)| *u as f64 * *i as f64)
                    .sum()
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "dot_product"
    }
}

/// Global interaction counts used for cold-start fallback ranking.
pub struct PopularityTracker {
    counts: RwLock<HashMap<String, u64>>,
}

impl PopularityTracker {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, item_id: &str) {
        *self.counts.write().entry(item_id.to_string()).or_insert(0) += 1;
    }

    /// Top items by count, ties broken by id for stable output.
    pub fn top(&self, n: usize) -> Vec<String> {
        let counts = self.counts.read();
        let mut items: Vec<(&String, &u64)> = counts.iter().collect();
        items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        items.into_iter().take(n).map(|(id, _)| id.clone()).collect()
    }

    pub fn tracked_items(&self) -> usize {
        self.counts.read().len()
    }
}

impl Default for PopularityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationRequest {
    pub user_id: String,
    /// Explicit candidate pool; empty means "use popular items"
    #[serde(default)]
    pub candidate_items: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Drop items the user has already interacted with
    #[serde(default = "default_true")]
    pub exclude_seen: bool,
}

fn default_limit() -> usize {
    DEFAULT_RECOMMENDATION_LIMIT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationResponse {
    pub user_id: String,
    pub items: Vec<ScoredItem>,
    pub model_ref: String,
    pub cold_start: bool,
    pub latency_ms: f64,
    pub generated_at: DateTime<Utc>,
}

/// Scoring pipeline over cache, stats and scorer.
pub struct Recommender {
    cache: Arc<FeatureCacheService>,
    stats: Arc<UserStatsRegistry>,
    popularity: Arc<PopularityTracker>,
    scorer: Arc<dyn ModelScorer>,
    latency: LatencyTracker,
}

impl Recommender {
    pub fn new(
        cache: Arc<FeatureCacheService>,
        stats: Arc<UserStatsRegistry>,
        popularity: Arc<PopularityTracker>,
        scorer: Arc<dyn ModelScorer>,
    ) -> Self {
        Self {
            cache,
            stats,
            popularity,
            scorer,
            latency: LatencyTracker::new(DEFAULT_LATENCY_WINDOW),
        }
    }

    /// Serves one ranked page for `user_id` with the given model.
    pub async fn recommend(
        &self,
        request: &RecommendationRequest,
        model_ref: &str,
    ) -> Result<RecommendationResponse> {
        ensure!(!request.user_id.trim().is_empty(), "user_id is empty");
        ensure!(request.limit >= 1, "limit must be at least 1");
        let started = Instant::now();

        let user_stats = self.stats.get(&request.user_id);
        let cold_start = user_stats.is_none();

        let mut candidates: Vec<String> = if request.candidate_items.is_empty() {
            self.popularity.top(request.limit.max(DEFAULT_RECOMMENDATION_LIMIT) * 5)
        } else {
            request.candidate_items.clone()
        };
        if candidates.len() > MAX_CANDIDATES {
            debug!(
                dropped = candidates.len() - MAX_CANDIDATES,
                "candidate pool truncated"
            );
            candidates.truncate(MAX_CANDIDATES);
        }
        let mut unique = std::collections::HashSet::with_capacity(candidates.len());
        candidates.retain(|id| unique.insert(id.clone()));
        if request.exclude_seen {
            if let Some(stats) = &user_stats {
                candidates.retain(|item| !stats.interacted_items.contains(item));
            }
        }

        let items = if cold_start {
            metrics::COLD_START_RECOMMENDATIONS_TOTAL.inc();
            self.rank_by_popularity(&candidates, request.limit)
        } else {
            self.score_candidates(request, &candidates, model_ref).await?
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.latency.record(latency_ms);
        metrics::RECOMMENDATIONS_TOTAL.inc();
        metrics::RECOMMENDATION_LATENCY_SECONDS.observe(latency_ms / 1000.0);

        Ok(RecommendationResponse {
            user_id: request.user_id.clone(),
            items,
            model_ref: model_ref.to_string(),
            cold_start,
            latency_ms,
            generated_at: Utc::now(),
        })
    }

    async fn score_candidates(
        &self,
        request: &RecommendationRequest,
        candidates: &[String],
        model_ref: &str,
    ) -> Result<Vec<ScoredItem>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let user_vector = self.cache.get(EntityKind::User, &request.user_id).await?;
        let mut fetched = self.cache.get_batch(EntityKind::Item, candidates).await?;
        let item_dim = self.cache.dimension_for(EntityKind::Item);
        // Reorder the batch result to follow the candidate list
        let item_vectors: Vec<FeatureVector> = candidates
            .iter()
            .map(|id| {
                fetched
                    .remove(id)
                    .unwrap_or_else(|| FeatureVector::default_for(EntityKind::Item, id, item_dim))
            })
            .collect();
        let scores = self
            .scorer
            .score_batch(model_ref, &user_vector, &item_vectors)
            .await?;

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .zip(scores)
            .map(|(id, score)| (id.clone(), if score.is_finite() { score } else { 0.0 }))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(request.limit);
        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (item_id, score))| ScoredItem {
                item_id,
                score,
                rank: i + 1,
            })
            .collect())
    }

    /// Reciprocal-rank scores over the already popularity-ordered pool.
    fn rank_by_popularity(&self, candidates: &[String], limit: usize) -> Vec<ScoredItem> {
        candidates
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, item_id)| ScoredItem {
                item_id: item_id.clone(),
                score: 1.0 / (i + 1) as f64,
                rank: i + 1,
            })
            .collect()
    }

    pub fn latency_summary(&self) -> LatencySummary {
        self.latency.summary()
    }
}
