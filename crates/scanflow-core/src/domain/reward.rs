//! Reward domain: evaluation inputs, catalog items, grants, summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{OwnerId, RunId};

/// Sentinel label used when the classification carries no usable category.
pub const UNDEFINED_LABEL: &str = "undefined";

/// Classification hierarchy: major > middle > minor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub major_category: String,
    #[serde(default)]
    pub middle_category: String,
    #[serde(default)]
    pub minor_category: Option<String>,
}

/// Where a reward evaluation originates. Keys the evaluator registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSource {
    Scan,
}

impl fmt::Display for RewardSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardSource::Scan => f.write_str("scan"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardRequest {
    pub source: RewardSource,
    pub owner_id: OwnerId,
    pub run_id: RunId,
    pub classification: Classification,
    pub situation_tags: Vec<String>,
    pub disposal_rules_present: bool,
    pub insufficiencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: String,
    pub name: String,
    pub dialog: String,
    pub item_type: Option<String>,
    pub match_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardDecision {
    pub should_evaluate: bool,
    /// Catalog order is priority order.
    pub candidates: Vec<CatalogItem>,
    pub source_label: String,
    pub match_reason: Option<String>,
}

impl RewardDecision {
    pub fn skipped(source_label: impl Into<String>) -> Self {
        Self {
            should_evaluate: false,
            candidates: Vec::new(),
            source_label: source_label.into(),
            match_reason: None,
        }
    }
}

/// Ownership record. Unique on (owner_id, item_code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub owner_id: OwnerId,
    pub item_code: String,
    pub item_name: String,
    pub source_label: String,
    pub granted_at: DateTime<Utc>,
}

impl Grant {
    /// Deterministic key so persistence retries stay idempotent.
    pub fn key(&self) -> String {
        format!("ownership:{}:{}", self.owner_id, self.item_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted { item: CatalogItem, grant: Grant },
    /// `concurrent` is set when a parallel insert won the race.
    /// `existing` is the stored row when it was visible before inserting.
    AlreadyOwned {
        item: CatalogItem,
        existing: Option<Grant>,
        concurrent: bool,
    },
    NoCandidate,
}

impl GrantOutcome {
    /// Grant whose persistence should be (re)dispatched.
    ///
    /// A stored grant is re-sent as well: an earlier attempt may have inserted it and
    /// died before publishing. The persist sinks upsert, so the repeat is harmless.
    pub fn grant_to_persist(&self) -> Option<&Grant> {
        match self {
            GrantOutcome::Granted { grant, .. } => Some(grant),
            GrantOutcome::AlreadyOwned { existing, .. } => existing.as_ref(),
            GrantOutcome::NoCandidate => None,
        }
    }
}

/// `reward` field of the final result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSummary {
    pub received: bool,
    pub already_owned: bool,
    pub name: Option<String>,
    pub dialog: Option<String>,
    pub match_reason: Option<String>,
    pub item_type: Option<String>,
    pub source: Option<String>,
}

impl RewardSummary {
    pub fn from_outcome(outcome: &GrantOutcome, decision: &RewardDecision) -> Self {
        let (item, received, already_owned) = match outcome {
            GrantOutcome::Granted { item, .. } => (Some(item), true, false),
            GrantOutcome::AlreadyOwned { item, .. } => (Some(item), false, true),
            GrantOutcome::NoCandidate => (None, false, false),
        };
        Self {
            received,
            already_owned,
            name: item.map(|i| i.name.clone()),
            dialog: item.map(|i| i.dialog.clone()),
            match_reason: decision.match_reason.clone(),
            item_type: item.and_then(|i| i.item_type.clone()),
            source: Some(decision.source_label.clone()),
        }
    }
}

/// Downstream stores written after a new grant. Separate queues, separate failure domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistTarget {
    /// Ownership ledger of the reward domain.
    Ownership,
    /// The user's collection in the second domain.
    Collection,
}

impl PersistTarget {
    pub const ALL: [PersistTarget; 2] = [PersistTarget::Ownership, PersistTarget::Collection];

    pub fn queue(self) -> &'static str {
        match self {
            PersistTarget::Ownership => "reward.persist",
            PersistTarget::Collection => "my.sync",
        }
    }
}

impl fmt::Display for PersistTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistTarget::Ownership => f.write_str("ownership"),
            PersistTarget::Collection => f.write_str("collection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistMessage {
    pub target: PersistTarget,
    pub grant: Grant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn item() -> CatalogItem {
        CatalogItem {
            code: "char-pet".into(),
            name: "Petty".into(),
            dialog: "Thanks for rinsing me!".into(),
            item_type: Some("bottle".into()),
            match_label: Some("pet_bottle".into()),
        }
    }

    #[test]
    fn summary_for_new_grant() {
        let decision = RewardDecision {
            should_evaluate: true,
            candidates: vec![item()],
            source_label: "scan-reward".into(),
            match_reason: Some("pet_bottle".into()),
        };
        let grant = Grant {
            owner_id: OwnerId::from_ulid(Ulid::new()),
            item_code: "char-pet".into(),
            item_name: "Petty".into(),
            source_label: "scan-reward".into(),
            granted_at: Utc::now(),
        };
        let summary = RewardSummary::from_outcome(
            &GrantOutcome::Granted { item: item(), grant },
            &decision,
        );
        assert!(summary.received);
        assert!(!summary.already_owned);
        assert_eq!(summary.name.as_deref(), Some("Petty"));
        assert_eq!(summary.source.as_deref(), Some("scan-reward"));
    }

    #[test]
    fn grant_key_is_deterministic() {
        let owner = OwnerId::from_ulid(Ulid::new());
        let grant = |at| Grant {
            owner_id: owner,
            item_code: "char-pet".into(),
            item_name: "Petty".into(),
            source_label: "scan-reward".into(),
            granted_at: at,
        };
        let first = grant(Utc::now());
        let second = grant(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(first.key(), second.key());
        assert!(first.key().starts_with("ownership:owner-"));
    }

    #[test]
    fn persist_targets_use_distinct_queues() {
        assert_ne!(
            PersistTarget::Ownership.queue(),
            PersistTarget::Collection.queue()
        );
    }
}
