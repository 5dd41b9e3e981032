//! Per-user running statistics and deterministic feature derivation
//!
//! Every interaction updates a `UserRunningStats` record; the user's feature
//! vector is then re-derived from the stats alone. Derivation is a pure
//! function of (stats, now, dimension), so replaying the same ordered event
//! log always reproduces the same vectors.
//!
//! # Vector layout (user, default dimension 50)
//! ```text
//! [0]  clicks / 100        (capped at 1.0)
//! [1]  views / 100         (capped at 1.0)
//! [2]  purchases / 50      (capped at 1.0)
//! [3]  likes / 50          (capped at 1.0)
//! [4]  total events / 100  (capped at 1.0)
//! [5]  unique items / 50   (capped at 1.0)
//! [6]  recency: exp(-seconds_since_last / 3600)
//! [7]  engagement: (clicks + purchases) / total
//! [8..13]  hash embedding of the 5 most recent items
//! [13..16] top-3 category affinity ratios
//! [16] activity span / 7 days (capped at 1.0)
//! [..] zero padding
//! ```

use crate::events::{EventKind, InteractionEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Default user feature dimension
pub const USER_FEATURE_DIM: usize = 50;

/// Default item feature dimension
pub const ITEM_FEATURE_DIM: usize = 20;

/// Bounded recent-item history per user
pub const RECENT_ITEMS_CAP: usize = 20;

/// Recency decay time constant (seconds)
const RECENCY_TAU_SECS: f64 = 3600.0;

/// Activity-span normalization window (seconds)
const ACTIVITY_SPAN_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Stable 64-bit FNV-1a hash. Used wherever identical ids must map to the
/// same value across restarts (recent-item embedding, variant bucketing);
/// the std hasher makes no such guarantee.
pub fn stable_id_hash(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Category prefix of an item id (text before the first `_`)
pub fn category_of(item_id: &str) -> &str {
    item_id.split('_').next().unwrap_or(item_id)
}

/// Mutable per-user interaction statistics.
///
/// Created on the first event for a user and updated on every subsequent
/// one; never deleted here (staleness is bounded by the cache TTL above).
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserRunningStats {
    pub views: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub likes: u64,
    pub dislikes: u64,
    pub shares: u64,
    pub ratings: u64,
    /// Most recent item ids, oldest first, FIFO-bounded
    pub recent_items: VecDeque<String>,
    /// Distinct item ids ever interacted with
    pub interacted_items: HashSet<String>,
    /// Interaction counts per category prefix
    pub category_counts: HashMap<String, u64>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserRunningStats {
    pub fn apply(&mut self, event: &InteractionEvent) {
        match event.kind {
            EventKind::View => self.views += 1,
            EventKind::Click => self.clicks += 1,
            EventKind::Purchase => self.purchases += 1,
            EventKind::Like => self.likes += 1,
            EventKind::Dislike => self.dislikes += 1,
            EventKind::Share => self.shares += 1,
            EventKind::Rating => self.ratings += 1,
        }

        if self.recent_items.len() >= RECENT_ITEMS_CAP {
            self.recent_items.pop_front();
        }
        self.recent_items.push_back(event.item_id.clone());
        self.interacted_items.insert(event.item_id.clone());
        *self
            .category_counts
            .entry(category_of(&event.item_id).to_string())
            .or_insert(0) += 1;

        if self.first_seen.is_none() {
            self.first_seen = Some(event.timestamp);
        }
        self.last_seen = Some(event.timestamp);
    }

    pub fn total_events(&self) -> u64 {
        self.views
            + self.clicks
            + self.purchases
            + self.likes
            + self.dislikes
            + self.shares
            + self.ratings
    }

    pub fn unique_items(&self) -> usize {
        self.interacted_items.len()
    }

    /// Top categories by count, ratio of total events. Ties broken by name
    /// so the result is independent of hash-map iteration order.
    pub fn top_categories(&self, n: usize) -> Vec<(String, f64)> {
        let total = self.total_events();
        if total == 0 {
            return Vec::new();
        }
        let mut entries: Vec<(&String, &u64)> = self.category_counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(n)
            .map(|(name, count)| (name.clone(), *count as f64 / total as f64))
            .collect()
    }
}

/// Derives a user feature vector from running stats.
///
/// Pure function: identical (stats, now, dim) always produce an identical
/// vector. `now` is the timestamp of the event that triggered the
/// recompute, which keeps replays of the same log bit-identical.
pub fn derive_user_vector(stats: &UserRunningStats, now: DateTime<Utc>, dim: usize) -> Vec<f32> {
    let mut features = vec![0.0f32; dim];
    if dim == 0 {
        return features;
    }

    let total = stats.total_events() as f64;

    let mut push = |idx: usize, value: f64| {
        if idx < dim {
            features[idx] = value as f32;
        }
    };

    push(0, (stats.clicks as f64 / 100.0).min(1.0));
    push(1, (stats.views as f64 / 100.0).min(1.0));
    push(2, (stats.purchases as f64 / 50.0).min(1.0));
    push(3, (stats.likes as f64 / 50.0).min(1.0));
    push(4, (total / 100.0).min(1.0));
    push(5, (stats.unique_items() as f64 / 50.0).min(1.0));

    if let Some(last_seen) = stats.last_seen {
        let elapsed = (now - last_seen).num_seconds().max(0) as f64;
        push(6, (-elapsed / RECENCY_TAU_SECS).exp());
    }

    if total > 0.0 {
        push(7, (stats.clicks + stats.purchases) as f64 / total);
    }

    // Hash embedding of the five most recent items, oldest of the five first
    let recent: Vec<&String> = stats
        .recent_items
        .iter()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    for (i, item) in recent.iter().enumerate() {
        let bucket = (stable_id_hash(item) % 1_000_000) as f64 / 1_000_000.0;
        push(8 + i, bucket);
    }

    for (i, (_, ratio)) in stats.top_categories(3).iter().enumerate() {
        push(13 + i, *ratio);
    }

    if let (Some(first), Some(last)) = (stats.first_seen, stats.last_seen) {
        let span = (last - first).num_seconds().max(0) as f64;
        push(16, (span / ACTIVITY_SPAN_SECS).min(1.0));
    }

    features
}

/// Registry of running stats for all users seen by this process.
pub struct UserStatsRegistry {
    stats: RwLock<HashMap<String, UserRunningStats>>,
}

impl UserStatsRegistry {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Applies an event and returns a snapshot of the updated stats for
    /// feature derivation.
    pub fn record(&self, event: &InteractionEvent) -> UserRunningStats {
        let mut stats = self.stats.write();
        let entry = stats.entry(event.user_id.clone()).or_default();
        entry.apply(event);
        entry.clone()
    }

    pub fn get(&self, user_id: &str) -> Option<UserRunningStats> {
        self.stats.read().get(user_id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.stats.read().len()
    }
}

impl Default for UserStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn replay(events: &[InteractionEvent]) -> Vec<f32> {
        let registry = UserStatsRegistry::new();
        let mut last = None;
        for event in events {
            let stats = registry.record(event);
            last = Some(derive_user_vector(&stats, event.timestamp, USER_FEATURE_DIM));
        }
        last.unwrap()
    }

    #[test]
    fn test_replay_yields_identical_vectors() {
        let events: Vec<_> = (0..40)
            .map(|i| {
                let kind = match i % 4 {
                    0 => EventKind::View,
                    1 => EventKind::Click,
                    2 => EventKind::Like,
                    _ => EventKind::Purchase,
                };
                InteractionEvent::at("user_a", format!("cat{}_item_{}", i % 3, i), kind, ts(i * 60))
            })
            .collect();

        let first = replay(&events);
        let second = replay(&events);
        assert_eq!(first, second);
    }

    #[test]
    fn test_recent_items_bounded_fifo() {
        let mut stats = UserRunningStats::default();
        for i in 0..RECENT_ITEMS_CAP + 5 {
            stats.apply(&InteractionEvent::at(
                "u",
                format!("item_{}", i),
                EventKind::View,
                ts(i as i64),
            ));
        }
        assert_eq!(stats.recent_items.len(), RECENT_ITEMS_CAP);
        assert_eq!(stats.recent_items.front().unwrap(), "item_5");
        assert_eq!(
            stats.recent_items.back().unwrap(),
            &format!("item_{}", RECENT_ITEMS_CAP + 4)
        );
    }

    #[test]
    fn test_count_features_capped_at_one() {
        let mut stats = UserRunningStats::default();
        for i in 0..500 {
            stats.apply(&InteractionEvent::at(
                "u",
                format!("item_{}", i),
                EventKind::Click,
                ts(i),
            ));
        }
        let v = derive_user_vector(&stats, ts(500), USER_FEATURE_DIM);
        assert_eq!(v[0], 1.0); // clicks
        assert_eq!(v[4], 1.0); // total
        assert_eq!(v[5], 1.0); // unique items
    }

    #[test]
    fn test_recency_decays_with_elapsed_time() {
        let mut stats = UserRunningStats::default();
        stats.apply(&InteractionEvent::at("u", "item_1", EventKind::View, ts(0)));

        let fresh = derive_user_vector(&stats, ts(0), USER_FEATURE_DIM);
        assert!((fresh[6] - 1.0).abs() < 1e-6);

        let one_hour = derive_user_vector(&stats, ts(3600), USER_FEATURE_DIM);
        assert!((one_hour[6] as f64 - (-1.0f64).exp()).abs() < 1e-6);

        let stale = derive_user_vector(&stats, ts(3600 * 24), USER_FEATURE_DIM);
        assert!(stale[6] < 1e-6);
    }

    #[test]
    fn test_engagement_ratio() {
        let mut stats = UserRunningStats::default();
        stats.apply(&InteractionEvent::at("u", "a_1", EventKind::Click, ts(0)));
        stats.apply(&InteractionEvent::at("u", "a_2", EventKind::Purchase, ts(1)));
        stats.apply(&InteractionEvent::at("u", "a_3", EventKind::View, ts(2)));
        stats.apply(&InteractionEvent::at("u", "a_4", EventKind::View, ts(3)));

        let v = derive_user_vector(&stats, ts(3), USER_FEATURE_DIM);
        assert!((v[7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_category_affinity_ordering_deterministic() {
        let mut stats = UserRunningStats::default();
        for _ in 0..6 {
            stats.apply(&InteractionEvent::at("u", "books_x", EventKind::View, ts(0)));
        }
        for _ in 0..3 {
            stats.apply(&InteractionEvent::at("u", "games_y", EventKind::View, ts(1)));
        }
        stats.apply(&InteractionEvent::at("u", "music_z", EventKind::View, ts(2)));

        let top = stats.top_categories(3);
        assert_eq!(top[0].0, "books");
        assert!((top[0].1 - 0.6).abs() < 1e-9);
        assert_eq!(top[1].0, "games");
        assert_eq!(top[2].0, "music");
    }

    #[test]
    fn test_category_prefix_parsing() {
        assert_eq!(category_of("electronics_42"), "electronics");
        assert_eq!(category_of("plain"), "plain");
        assert_eq!(category_of("a_b_c"), "a");
    }

    #[test]
    fn test_stable_hash_is_stable() {
        // FNV-1a reference value must not drift between releases
        assert_eq!(stable_id_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(stable_id_hash("user_1"), stable_id_hash("user_1"));
        assert_ne!(stable_id_hash("user_1"), stable_id_hash("user_2"));
    }

    #[test]
    fn test_dimension_truncation_safe() {
        let mut stats = UserRunningStats::default();
        stats.apply(&InteractionEvent::at("u", "a_1", EventKind::Click, ts(0)));
        let short = derive_user_vector(&stats, ts(0), 4);
        assert_eq!(short.len(), 4);
        let empty = derive_user_vector(&stats, ts(0), 0);
        assert!(empty.is_empty());
    }
}
