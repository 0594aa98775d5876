//! RewardDispatcher - grant の確定と永続化の fan-out
//!
//! # 学習ポイント
//! - 一意制約違反を「既に所持」に変換して race を吸収
//! - 永続化先ごとに別 queue へ publish（片方の障害がもう片方に波及しない）

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::publisher_loop::{PublishOutcome, ReliablePublisher};
use crate::domain::{
    CatalogItem, Grant, GrantOutcome, Message, OwnerId, PersistMessage, PersistTarget, StoreError,
};
use crate::ports::{Clock, OwnershipStore};

/// Per-target result of [`RewardDispatcher::dispatch_persistence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub outcomes: Vec<(PersistTarget, PublishOutcome)>,
}

impl DispatchReceipt {
    pub fn outcome(&self, target: PersistTarget) -> Option<PublishOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, outcome)| *outcome)
    }

    pub fn all_durable(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_durable())
    }
}

pub struct RewardDispatcher {
    ownership: Arc<dyn OwnershipStore>,
    publisher: Arc<ReliablePublisher>,
    clock: Arc<dyn Clock>,
}

impl RewardDispatcher {
    pub fn new(
        ownership: Arc<dyn OwnershipStore>,
        publisher: Arc<ReliablePublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ownership,
            publisher,
            clock,
        }
    }

    /// Grant the first candidate.
    ///
    /// Concurrent duplicates resolve to `AlreadyOwned { concurrent: true }`, never two rows.
    pub async fn apply(
        &self,
        owner: OwnerId,
        source_label: &str,
        candidates: &[CatalogItem],
    ) -> Result<GrantOutcome, StoreError> {
        let Some(item) = candidates.first() else {
            return Ok(GrantOutcome::NoCandidate);
        };

        if let Some(existing) = self.ownership.find(owner, &item.code).await? {
            debug!(owner_id = %owner, item = %item.code, "already owned");
            return Ok(GrantOutcome::AlreadyOwned {
                item: item.clone(),
                existing: Some(existing),
                concurrent: false,
            });
        }

        let grant = Grant {
            owner_id: owner,
            item_code: item.code.clone(),
            item_name: item.name.clone(),
            source_label: source_label.to_string(),
            granted_at: self.clock.now(),
        };
        match self.ownership.insert(grant.clone()).await {
            Ok(()) => {
                info!(owner_id = %owner, item = %item.code, source = source_label, "reward granted");
                Ok(GrantOutcome::Granted {
                    item: item.clone(),
                    grant,
                })
            }
            Err(StoreError::UniqueViolation { .. }) => {
                info!(owner_id = %owner, item = %item.code, "duplicate grant race, treating as already owned");
                // 勝った側が永続化を流す
                Ok(GrantOutcome::AlreadyOwned {
                    item: item.clone(),
                    existing: None,
                    concurrent: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One message per store. Never fails; failures land in the outbox.
    pub async fn dispatch_persistence(&self, grant: &Grant) -> DispatchReceipt {
        let mut outcomes = Vec::with_capacity(PersistTarget::ALL.len());
        for target in PersistTarget::ALL {
            let body = PersistMessage {
                target,
                grant: grant.clone(),
            };
            let outcome = match Message::json(&body) {
                Ok(message) => self.publisher.publish(target.queue(), message).await,
                Err(e) => {
                    warn!(%target, key = %grant.key(), error = %e, "persist message encoding failed");
                    PublishOutcome::Lost
                }
            };
            debug!(%target, key = %grant.key(), ?outcome, "persistence dispatched");
            outcomes.push((target, outcome));
        }
        DispatchReceipt { outcomes }
    }
}
