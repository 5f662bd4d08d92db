pub mod drift_contracts;
pub mod features;
pub mod model_contracts;
pub mod run_contracts;
pub mod sales_contracts;

use thiserror::Error;

pub use drift_contracts::{
    classify_drift, DriftMetric, DriftReport, DriftStatus, DriftThresholds, FeatureStats,
    TrackedStat, DEFAULT_DRIFT_CRITICAL_PCT, DEFAULT_DRIFT_WARNING_PCT,
};
pub use features::{
    derive_features, fingerprint_rows, ExcludedObservation, FeatureDerivation, FeatureRow,
    LAG_DEPTH,
};
pub use model_contracts::{
    improvement_pct, ComparisonDecision, ComparisonLogEntry, ModelMetrics, ModelRecord,
    ModelStatus, PromotionPolicy, PromotionVerdict, TrainingOutcome,
    DEFAULT_PROMOTION_THRESHOLD_PCT,
};
pub use run_contracts::{
    PipelineRun, RunPhase, RunStatus, TriggerKind, TriggerLogEntry, RAW_SALES_STREAM,
};
pub use sales_contracts::{Observation, Period, SeriesKey};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContractError {
    #[error("invalid period token: {0:?}")]
    InvalidPeriod(String),
    #[error("invalid observation field {field}: {reason}")]
    InvalidObservation { field: &'static str, reason: String },
    #[error("metric {name} must be finite and non-negative, got {value}")]
    InvalidMetric { name: &'static str, value: f64 },
    #[error("improvement undefined: production MAE is zero")]
    UndefinedImprovement,
    #[error("insufficient data: {found} rows, {required} required")]
    InsufficientData { found: usize, required: usize },
    #[error("unknown {kind} label: {value}")]
    UnknownLabel { kind: &'static str, value: String },
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}
