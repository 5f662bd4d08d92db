use crate::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PROMOTION_THRESHOLD_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Candidate,
    Production,
    Archived,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Candidate => "CANDIDATE",
            ModelStatus::Production => "PRODUCTION",
            ModelStatus::Archived => "ARCHIVED",
        }
    }

    /// Lifecycle is CANDIDATE -> PRODUCTION -> ARCHIVED, or CANDIDATE ->
    /// ARCHIVED when rejected. Nothing leaves ARCHIVED.
    pub fn can_transition_to(&self, target: ModelStatus) -> bool {
        matches!(
            (self, target),
            (ModelStatus::Candidate, ModelStatus::Production)
                | (ModelStatus::Candidate, ModelStatus::Archived)
                | (ModelStatus::Production, ModelStatus::Archived)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "CANDIDATE" => Ok(ModelStatus::Candidate),
            "PRODUCTION" => Ok(ModelStatus::Production),
            "ARCHIVED" => Ok(ModelStatus::Archived),
            other => Err(ContractError::UnknownLabel {
                kind: "model status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
}

impl ModelMetrics {
    pub fn validate(&self) -> Result<(), ContractError> {
        for (name, value) in [("mae", self.mae), ("rmse", self.rmse), ("mape", self.mape)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ContractError::InvalidMetric { name, value });
            }
        }
        Ok(())
    }
}

/// What a trainer hands back after a successful fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub version: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
    pub training_record_count: u64,
}

fn default_model_type() -> String {
    "external".to_string()
}

impl TrainingOutcome {
    pub fn metrics(&self) -> ModelMetrics {
        ModelMetrics {
            mae: self.mae,
            rmse: self.rmse,
            mape: self.mape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub version: String,
    pub model_type: String,
    pub status: ModelStatus,
    pub metrics: ModelMetrics,
    pub training_record_count: u64,
    pub trained_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ModelRecord {
    pub fn candidate(outcome: &TrainingOutcome, trained_at: DateTime<Utc>) -> Self {
        Self {
            version: outcome.version.clone(),
            model_type: outcome.model_type.clone(),
            status: ModelStatus::Candidate,
            metrics: outcome.metrics(),
            training_record_count: outcome.training_record_count,
            trained_at,
            promoted_at: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonDecision {
    Promote,
    KeepCurrent,
    /// Nothing was pending; recorded so no-op evaluations stay visible.
    NoCandidate,
    /// Improvement could not be computed (production MAE of zero).
    Undefined,
}

impl ComparisonDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonDecision::Promote => "PROMOTE",
            ComparisonDecision::KeepCurrent => "KEEP_CURRENT",
            ComparisonDecision::NoCandidate => "NO_CANDIDATE",
            ComparisonDecision::Undefined => "UNDEFINED",
        }
    }

    pub fn is_evaluated(&self) -> bool {
        matches!(
            self,
            ComparisonDecision::Promote | ComparisonDecision::KeepCurrent
        )
    }
}

impl fmt::Display for ComparisonDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComparisonDecision {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "PROMOTE" => Ok(ComparisonDecision::Promote),
            "KEEP_CURRENT" => Ok(ComparisonDecision::KeepCurrent),
            "NO_CANDIDATE" => Ok(ComparisonDecision::NoCandidate),
            "UNDEFINED" => Ok(ComparisonDecision::Undefined),
            other => Err(ContractError::UnknownLabel {
                kind: "comparison decision",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonLogEntry {
    pub compared_at: DateTime<Utc>,
    pub production_version: Option<String>,
    pub candidate_version: Option<String>,
    pub production_mae: Option<f64>,
    pub candidate_mae: Option<f64>,
    pub improvement_pct: Option<f64>,
    pub decision: ComparisonDecision,
    pub reason: String,
}

/// Relative MAE improvement of the candidate over production, in percent.
/// Positive favours the candidate.
pub fn improvement_pct(production_mae: f64, candidate_mae: f64) -> Result<f64, ContractError> {
    if production_mae == 0.0 {
        return Err(ContractError::UndefinedImprovement);
    }
    Ok((production_mae - candidate_mae) * 100.0 / production_mae)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromotionVerdict {
    pub decision: ComparisonDecision,
    pub improvement_pct: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionPolicy {
    pub min_improvement_pct: f64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_improvement_pct: DEFAULT_PROMOTION_THRESHOLD_PCT,
        }
    }
}

impl PromotionPolicy {
    pub fn new(min_improvement_pct: f64) -> Result<Self, ContractError> {
        if !min_improvement_pct.is_finite() || min_improvement_pct < 0.0 {
            return Err(ContractError::InvalidPolicy(format!(
                "promotion threshold must be finite and >= 0, got {min_improvement_pct}"
            )));
        }
        Ok(Self {
            min_improvement_pct,
        })
    }

    pub fn judge(
        &self,
        production: Option<&ModelMetrics>,
        candidate: &ModelMetrics,
    ) -> Result<PromotionVerdict, ContractError> {
        let Some(production) = production else {
            return Ok(PromotionVerdict {
                decision: ComparisonDecision::Promote,
                improvement_pct: None,
                reason: "first model".to_string(),
            });
        };

        let improvement = improvement_pct(production.mae, candidate.mae)?;
        let verdict = if improvement >= self.min_improvement_pct {
            PromotionVerdict {
                decision: ComparisonDecision::Promote,
                improvement_pct: Some(improvement),
                reason: format!(
                    "candidate improves MAE by {improvement:.2}% (threshold {:.2}%)",
                    self.min_improvement_pct
                ),
            }
        } else if improvement >= 0.0 {
            PromotionVerdict {
                decision: ComparisonDecision::KeepCurrent,
                improvement_pct: Some(improvement),
                reason: format!(
                    "improvement {improvement:.2}% below threshold {:.2}%",
                    self.min_improvement_pct
                ),
            }
        } else {
            PromotionVerdict {
                decision: ComparisonDecision::KeepCurrent,
                improvement_pct: Some(improvement),
                reason: format!(
                    "regression: candidate MAE {:.2} worse than production MAE {:.2} ({improvement:.2}%)",
                    candidate.mae, production.mae
                ),
            }
        };

        Ok(verdict)
    }
}
