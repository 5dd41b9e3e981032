//! Interaction event model and ingress validation
//!
//! Events are the single input stream of the control plane. Each event is
//! validated once at ingress and then fanned out to independent consumers
//! (feature recompute, learning buffer, drift sampling); consumers never
//! mutate events.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum events accepted in a single batch submission
pub const MAX_EVENT_BATCH: usize = 1000;

/// Maximum length of user/item identifiers
pub const MAX_ID_LEN: usize = 256;

/// Kind of user-item interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    View,
    Click,
    Purchase,
    Like,
    Dislike,
    Share,
    Rating,
}

impl EventKind {
    /// Wire name, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::View => "view",
            EventKind::Click => "click",
            EventKind::Purchase => "purchase",
            EventKind::Like => "like",
            EventKind::Dislike => "dislike",
            EventKind::Share => "share",
            EventKind::Rating => "rating",
        }
    }

    /// Reward signal used by the incremental learner.
    ///
    /// Kinds without an entry contribute nothing to the model update.
    pub fn reward_score(&self) -> f64 {
        match self {
            EventKind::Purchase => 1.0,
            EventKind::Like => 0.8,
            EventKind::Click => 0.6,
            EventKind::View => 0.3,
            EventKind::Dislike => -0.5,
            EventKind::Share | EventKind::Rating => 0.0,
        }
    }
}

/// A single user-item interaction. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: String,
    pub item_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Optional payload, e.g. a rating value or purchase amount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl InteractionEvent {
    /// Event stamped with the current time
    pub fn new(user_id: impl Into<String>, item_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            kind,
            timestamp: Utc::now(),
            value: None,
        }
    }

    /// Event with an explicit timestamp (replay paths and tests)
    pub fn at(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        kind: EventKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            kind,
            timestamp,
            value: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Ingress validation. Rejected events are never partially applied.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.user_id.trim().is_empty(), "user_id cannot be empty");
        ensure!(
            self.user_id.len() <= MAX_ID_LEN,
            "user_id exceeds {} bytes",
            MAX_ID_LEN
        );
        ensure!(!self.item_id.trim().is_empty(), "item_id cannot be empty");
        ensure!(
            self.item_id.len() <= MAX_ID_LEN,
            "item_id exceeds {} bytes",
            MAX_ID_LEN
        );
        if let Some(v) = self.value {
            ensure!(v.is_finite(), "value must be finite, got {}", v);
        }
        Ok(())
    }
}

/// Validates a batch submission as a whole before any event is applied.
///
/// An oversize or partially invalid batch is rejected in full.
pub fn validate_batch(events: &[InteractionEvent]) -> Result<()> {
    ensure!(
        events.len() <= MAX_EVENT_BATCH,
        "batch of {} events exceeds limit of {}",
        events.len(),
        MAX_EVENT_BATCH
    );
    for (i, event) in events.iter().enumerate() {
        event
            .validate()
            .map_err(|e| anyhow::anyhow!("event {} invalid: {}", i, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_event_passes() {
        let event = InteractionEvent::new("user_1", "electronics_42", EventKind::Click);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let event = InteractionEvent::new("  ", "item_1", EventKind::View);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_empty_item_id_rejected() {
        let event = InteractionEvent::new("user_1", "", EventKind::View);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_oversized_id_rejected() {
        let long_id = "u".repeat(MAX_ID_LEN + 1);
        let event = InteractionEvent::new(long_id, "item_1", EventKind::View);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let event =
            InteractionEvent::new("user_1", "item_1", EventKind::Rating).with_value(f64::NAN);
        assert!(event.validate().is_err());

        let event =
            InteractionEvent::new("user_1", "item_1", EventKind::Rating).with_value(4.5);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_batch_limit_enforced() {
        let events: Vec<_> = (0..MAX_EVENT_BATCH + 1)
            .map(|i| InteractionEvent::new(format!("user_{}", i), "item_1", EventKind::View))
            .collect();
        assert!(validate_batch(&events).is_err());
        assert!(validate_batch(&events[..MAX_EVENT_BATCH]).is_ok());
    }

    #[test]
    fn test_batch_rejected_whole_on_single_bad_event() {
        let mut events: Vec<_> = (0..10)
            .map(|i| InteractionEvent::new(format!("user_{}", i), "item_1", EventKind::View))
            .collect();
        events[7].item_id = String::new();
        let err = validate_batch(&events).unwrap_err();
        assert!(err.to_string().contains("event 7"));
    }

    #[test]
    fn test_reward_scores() {
        assert_eq!(EventKind::Purchase.reward_score(), 1.0);
        assert_eq!(EventKind::Like.reward_score(), 0.8);
        assert_eq!(EventKind::Click.reward_score(), 0.6);
        assert_eq!(EventKind::View.reward_score(), 0.3);
        assert_eq!(EventKind::Dislike.reward_score(), -0.5);
        assert_eq!(EventKind::Share.reward_score(), 0.0);
    }

    #[test]
    fn test_serde_snake_case_wire_names() {
        let json = serde_json::to_string(&EventKind::Purchase).unwrap();
        assert_eq!(json, "\"purchase\"");
        let kind: EventKind = serde_json::from_str("\"view\"").unwrap();
        assert_eq!(kind, EventKind::View);
    }
}
