use crate::registry::ModelRegistry;
use crate::{PipelineError, SharedStore};
use chrono::{DateTime, Utc};
use salesops_core::{
    ComparisonDecision, ComparisonLogEntry, ContractError, ModelRecord, PromotionPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub decision: ComparisonDecision,
    pub candidate_version: Option<String>,
    /// PRODUCTION after the evaluation.
    pub production_version: Option<String>,
    /// Former PRODUCTION archived by a promotion.
    pub archived_production: Option<String>,
    pub improvement_pct: Option<f64>,
    pub reason: String,
    /// Older candidates retired because a newer one was evaluated.
    pub superseded: Vec<String>,
}

/// Applies the promotion policy to the newest candidate and drives the
/// registry accordingly. Every call appends one comparison log entry, in the
/// same transaction as the registry change it records.
#[derive(Clone)]
pub struct PromotionEvaluator {
    registry: ModelRegistry,
    policy: PromotionPolicy,
}

impl PromotionEvaluator {
    pub fn new(store: SharedStore, policy: PromotionPolicy) -> Self {
        Self {
            registry: ModelRegistry::new(store),
            policy,
        }
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<EvaluationOutcome, PipelineError> {
        let production = self.registry.production()?;
        let mut candidates = self.registry.candidates()?.into_iter();
        let Some(candidate) = candidates.next() else {
            let reason = "no candidate pending".to_string();
            let entry = comparison_entry(
                now,
                production.as_ref(),
                None,
                ComparisonDecision::NoCandidate,
                None,
                &reason,
            );
            self.registry.apply_evaluation(&entry, &[])?;
            info!(event = "promotion_skipped", reason = %reason);
            return Ok(EvaluationOutcome {
                decision: ComparisonDecision::NoCandidate,
                candidate_version: None,
                production_version: production.map(|record| record.version),
                archived_production: None,
                improvement_pct: None,
                reason,
                superseded: Vec::new(),
            });
        };
        let stale = candidates.collect::<Vec<_>>();

        let verdict = match self
            .policy
            .judge(production.as_ref().map(|record| &record.metrics), &candidate.metrics)
        {
            Ok(verdict) => verdict,
            Err(ContractError::UndefinedImprovement) => {
                let reason = format!(
                    "improvement undefined: production {} has MAE 0",
                    production
                        .as_ref()
                        .map(|record| record.version.as_str())
                        .unwrap_or("unknown"),
                );
                let entry = comparison_entry(
                    now,
                    production.as_ref(),
                    Some(&candidate),
                    ComparisonDecision::Undefined,
                    None,
                    &reason,
                );
                self.registry.apply_evaluation(&entry, &[])?;
                warn!(event = "promotion_undefined", candidate = %candidate.version, reason = %reason);
                return Err(ContractError::UndefinedImprovement.into());
            }
            Err(err) => return Err(err.into()),
        };

        let superseded = stale
            .into_iter()
            .map(|record| record.version)
            .collect::<Vec<_>>();
        let entry = comparison_entry(
            now,
            production.as_ref(),
            Some(&candidate),
            verdict.decision,
            verdict.improvement_pct,
            &verdict.reason,
        );
        let archived_production = self.registry.apply_evaluation(&entry, &superseded)?;
        let production_version = match verdict.decision {
            ComparisonDecision::Promote => Some(candidate.version.clone()),
            _ => production.as_ref().map(|record| record.version.clone()),
        };
        info!(
            event = "promotion_evaluated",
            decision = %verdict.decision,
            candidate = %candidate.version,
            improvement_pct = verdict.improvement_pct.unwrap_or(f64::NAN),
            reason = %verdict.reason,
        );

        Ok(EvaluationOutcome {
            decision: verdict.decision,
            candidate_version: Some(candidate.version),
            production_version,
            archived_production,
            improvement_pct: verdict.improvement_pct,
            reason: verdict.reason,
            superseded,
        })
    }
}

fn comparison_entry(
    now: DateTime<Utc>,
    production: Option<&ModelRecord>,
    candidate: Option<&ModelRecord>,
    decision: ComparisonDecision,
    improvement_pct: Option<f64>,
    reason: &str,
) -> ComparisonLogEntry {
    ComparisonLogEntry {
        compared_at: now,
        production_version: production.map(|record| record.version.clone()),
        candidate_version: candidate.map(|record| record.version.clone()),
        production_mae: production.map(|record| record.metrics.mae),
        candidate_mae: candidate.map(|record| record.metrics.mae),
        improvement_pct,
        decision,
        reason: reason.to_string(),
    }
}
