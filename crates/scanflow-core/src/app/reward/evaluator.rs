//! Reward evaluators (source ごとの評価戦略).
//!
//! `evaluate` は template method です。実装側は条件判定とラベル生成だけを持ちます。

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RewardConfig;
use crate::domain::reward::UNDEFINED_LABEL;
use crate::domain::{CatalogItem, Classification, RewardDecision, RewardRequest, RewardSource};

pub trait RewardEvaluator: Send + Sync {
    fn source_label(&self) -> &str;

    fn should_evaluate(&self, request: &RewardRequest) -> bool;

    /// Label catalog items are matched against.
    fn match_label(&self, request: &RewardRequest) -> String;

    fn match_reason(&self, request: &RewardRequest) -> String;

    /// Candidates keep catalog order.
    fn evaluate(&self, request: &RewardRequest, catalog: &[CatalogItem]) -> RewardDecision {
        if !self.should_evaluate(request) {
            return RewardDecision::skipped(self.source_label());
        }
        let label = self.match_label(request);
        let candidates = catalog
            .iter()
            .filter(|item| item.match_label.as_deref() == Some(label.as_str()))
            .cloned()
            .collect();
        RewardDecision {
            should_evaluate: true,
            candidates,
            source_label: self.source_label().to_string(),
            match_reason: Some(self.match_reason(request)),
        }
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Rewards a completed scan of an eligible, fully-explained item.
pub struct ScanRewardEvaluator {
    enabled: bool,
    eligible_category: String,
}

impl ScanRewardEvaluator {
    pub const SOURCE_LABEL: &'static str = "scan-reward";

    pub fn new(config: &RewardConfig) -> Self {
        Self {
            enabled: config.enabled,
            eligible_category: config.eligible_category.clone(),
        }
    }

    fn categories(classification: &Classification) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            non_blank(&classification.major_category),
            non_blank(&classification.middle_category),
            classification.minor_category.as_deref().and_then(non_blank),
        )
    }
}

impl RewardEvaluator for ScanRewardEvaluator {
    fn source_label(&self) -> &str {
        Self::SOURCE_LABEL
    }

    fn should_evaluate(&self, request: &RewardRequest) -> bool {
        let (major, middle, _) = Self::categories(&request.classification);
        let (Some(major), Some(_)) = (major, middle) else {
            return false;
        };
        self.enabled
            && major == self.eligible_category
            && request.disposal_rules_present
            && request.insufficiencies.iter().all(|i| i.trim().is_empty())
    }

    fn match_label(&self, request: &RewardRequest) -> String {
        match Self::categories(&request.classification) {
            (_, Some(middle), _) => middle.to_string(),
            (Some(major), None, _) => major.to_string(),
            (None, None, _) => UNDEFINED_LABEL.to_string(),
        }
    }

    fn match_reason(&self, request: &RewardRequest) -> String {
        match Self::categories(&request.classification) {
            (_, Some(middle), Some(minor)) => format!("{middle}>{minor}"),
            (_, Some(middle), None) => middle.to_string(),
            (Some(major), None, _) => major.to_string(),
            (None, None, _) => UNDEFINED_LABEL.to_string(),
        }
    }
}

/// Evaluators keyed by where the reward request comes from.
#[derive(Default, Clone)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<RewardSource, Arc<dyn RewardEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(config: &RewardConfig) -> Self {
        Self::new().with(RewardSource::Scan, Arc::new(ScanRewardEvaluator::new(config)))
    }

    pub fn with(mut self, source: RewardSource, evaluator: Arc<dyn RewardEvaluator>) -> Self {
        self.evaluators.insert(source, evaluator);
        self
    }

    pub fn get(&self, source: RewardSource) -> Option<Arc<dyn RewardEvaluator>> {
        self.evaluators.get(&source).cloned()
    }
}
