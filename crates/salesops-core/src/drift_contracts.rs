use crate::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DRIFT_WARNING_PCT: f64 = 10.0;
pub const DEFAULT_DRIFT_CRITICAL_PCT: f64 = 25.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftStatus {
    Baseline,
    Normal,
    Warning,
    Critical,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Baseline => "BASELINE",
            DriftStatus::Normal => "NORMAL",
            DriftStatus::Warning => "WARNING",
            DriftStatus::Critical => "CRITICAL",
        }
    }

    pub fn severity(&self) -> u8 {
        match self {
            DriftStatus::Baseline => 0,
            DriftStatus::Normal => 1,
            DriftStatus::Warning => 2,
            DriftStatus::Critical => 3,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, DriftStatus::Baseline | DriftStatus::Normal)
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriftStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "BASELINE" => Ok(DriftStatus::Baseline),
            "NORMAL" => Ok(DriftStatus::Normal),
            "WARNING" => Ok(DriftStatus::Warning),
            "CRITICAL" => Ok(DriftStatus::Critical),
            other => Err(ContractError::UnknownLabel {
                kind: "drift status",
                value: other.to_string(),
            }),
        }
    }
}

/// Statistics of the target distribution that get their own baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrackedStat {
    Mean,
    Std,
    Min,
    Max,
    Count,
}

impl TrackedStat {
    pub const ALL: [TrackedStat; 5] = [
        TrackedStat::Mean,
        TrackedStat::Std,
        TrackedStat::Min,
        TrackedStat::Max,
        TrackedStat::Count,
    ];

    pub fn metric_name(&self) -> &'static str {
        match self {
            TrackedStat::Mean => "Y_MEAN",
            TrackedStat::Std => "Y_STD",
            TrackedStat::Min => "Y_MIN",
            TrackedStat::Max => "Y_MAX",
            TrackedStat::Count => "Y_COUNT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl FeatureStats {
    /// Summarizes the values; `std` is the sample deviation (n - 1).
    pub fn from_values(values: &[f64]) -> Result<Self, ContractError> {
        if values.is_empty() {
            return Err(ContractError::InsufficientData {
                found: 0,
                required: 1,
            });
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count < 2 {
            0.0
        } else {
            let variance = values
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(Self {
            mean,
            std,
            min,
            max,
            count: count as u64,
        })
    }

    pub fn value(&self, stat: TrackedStat) -> f64 {
        match stat {
            TrackedStat::Mean => self.mean,
            TrackedStat::Std => self.std,
            TrackedStat::Min => self.min,
            TrackedStat::Max => self.max,
            TrackedStat::Count => self.count as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftThresholds {
    pub warning_pct: f64,
    pub critical_pct: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            warning_pct: DEFAULT_DRIFT_WARNING_PCT,
            critical_pct: DEFAULT_DRIFT_CRITICAL_PCT,
        }
    }
}

impl DriftThresholds {
    pub fn new(warning_pct: f64, critical_pct: f64) -> Result<Self, ContractError> {
        if !warning_pct.is_finite() || !critical_pct.is_finite() || warning_pct < 0.0 {
            return Err(ContractError::InvalidPolicy(format!(
                "drift thresholds must be finite and >= 0, got {warning_pct}/{critical_pct}"
            )));
        }
        if warning_pct >= critical_pct {
            return Err(ContractError::InvalidPolicy(format!(
                "drift warning threshold {warning_pct} must be below critical {critical_pct}"
            )));
        }
        Ok(Self {
            warning_pct,
            critical_pct,
        })
    }
}

/// Returns the drift score (percent) and its status. A zero baseline has no
/// defined percentage: any non-zero current value is critical.
pub fn classify_drift(
    thresholds: &DriftThresholds,
    baseline: f64,
    current: f64,
) -> (Option<f64>, DriftStatus) {
    if baseline == 0.0 {
        return if current == 0.0 {
            (Some(0.0), DriftStatus::Normal)
        } else {
            (None, DriftStatus::Critical)
        };
    }

    let drift_pct = (current - baseline).abs() * 100.0 / baseline.abs();
    let status = if drift_pct >= thresholds.critical_pct {
        DriftStatus::Critical
    } else if drift_pct >= thresholds.warning_pct {
        DriftStatus::Warning
    } else {
        DriftStatus::Normal
    };
    (Some(drift_pct), status)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMetric {
    pub metric_name: String,
    pub checked_at: DateTime<Utc>,
    pub baseline_value: f64,
    pub current_value: f64,
    pub drift_score: Option<f64>,
    pub status: DriftStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub checked_at: DateTime<Utc>,
    pub status: DriftStatus,
    pub metrics: Vec<DriftMetric>,
    pub summary: String,
}

impl DriftReport {
    pub fn from_metrics(checked_at: DateTime<Utc>, metrics: Vec<DriftMetric>) -> Self {
        let status = metrics
            .iter()
            .map(|metric| metric.status)
            .max_by_key(DriftStatus::severity)
            .unwrap_or(DriftStatus::Baseline);
        let summary = metrics
            .iter()
            .map(|metric| match metric.drift_score {
                Some(score) => format!("{}={} ({score:.2}%)", metric.metric_name, metric.status),
                None => format!("{}={}", metric.metric_name, metric.status),
            })
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            checked_at,
            status,
            metrics,
            summary: format!("drift {status}: {summary}"),
        }
    }

    pub fn metric(&self, stat: TrackedStat) -> Option<&DriftMetric> {
        self.metrics
            .iter()
            .find(|metric| metric.metric_name == stat.metric_name())
    }
}
