use crate::{lock_store, PipelineError, SharedStore};
use chrono::{DateTime, Utc};
use salesops_core::{
    classify_drift, DriftMetric, DriftReport, DriftStatus, DriftThresholds, FeatureStats,
    TrackedStat,
};
use tracing::{info, warn};

/// Compares feature statistics against fixed per-metric baselines and keeps
/// the full check history.
#[derive(Clone)]
pub struct DriftMonitor {
    store: SharedStore,
    thresholds: DriftThresholds,
}

impl DriftMonitor {
    pub fn new(store: SharedStore, thresholds: DriftThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> &DriftThresholds {
        &self.thresholds
    }

    /// Statistics of `y` over the current feature table.
    pub fn current_stats(&self) -> Result<FeatureStats, PipelineError> {
        let features = lock_store(&self.store).features()?;
        let values = features.iter().map(|row| row.y).collect::<Vec<_>>();
        Ok(FeatureStats::from_values(&values)?)
    }

    /// A metric with no history gets a BASELINE row. Otherwise the baseline
    /// carried by its latest row is the reference, so the baseline stays where
    /// it was first observed.
    pub fn check_drift(
        &self,
        stats: &FeatureStats,
        now: DateTime<Utc>,
    ) -> Result<DriftReport, PipelineError> {
        let store = lock_store(&self.store);
        let mut metrics = Vec::with_capacity(TrackedStat::ALL.len());

        for stat in TrackedStat::ALL {
            let current = stats.value(stat);
            let metric = match store.latest_drift_metric(stat.metric_name())? {
                None => baseline_metric(stat, current, now),
                Some(previous) => {
                    let (drift_score, status) =
                        classify_drift(&self.thresholds, previous.baseline_value, current);
                    DriftMetric {
                        metric_name: stat.metric_name().to_string(),
                        checked_at: now,
                        baseline_value: previous.baseline_value,
                        current_value: current,
                        drift_score,
                        status,
                    }
                }
            };
            metrics.push(metric);
        }

        store.append_drift_metrics(&metrics)?;
        drop(store);

        let report = DriftReport::from_metrics(now, metrics);
        match report.status {
            DriftStatus::Warning | DriftStatus::Critical => {
                warn!(event = "drift_detected", status = %report.status, summary = %report.summary)
            }
            _ => info!(event = "drift_checked", status = %report.status, summary = %report.summary),
        }
        Ok(report)
    }

    /// Starts a fresh baseline for every tracked statistic.
    pub fn reset_baseline(
        &self,
        stats: &FeatureStats,
        now: DateTime<Utc>,
    ) -> Result<DriftReport, PipelineError> {
        let metrics = TrackedStat::ALL
            .into_iter()
            .map(|stat| baseline_metric(stat, stats.value(stat), now))
            .collect::<Vec<_>>();
        lock_store(&self.store).append_drift_metrics(&metrics)?;
        info!(event = "drift_rebaselined", mean = stats.mean, count = stats.count);
        Ok(DriftReport::from_metrics(now, metrics))
    }
}

fn baseline_metric(stat: TrackedStat, value: f64, now: DateTime<Utc>) -> DriftMetric {
    DriftMetric {
        metric_name: stat.metric_name().to_string(),
        checked_at: now,
        baseline_value: value,
        current_value: value,
        drift_score: Some(0.0),
        status: DriftStatus::Baseline,
    }
}
