use crate::PipelineError;
use salesops_core::{
    DriftThresholds, PromotionPolicy, DEFAULT_DRIFT_CRITICAL_PCT, DEFAULT_DRIFT_WARNING_PCT,
    DEFAULT_PROMOTION_THRESHOLD_PCT,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TRAINER_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MIN_TRAINING_ROWS: usize = 10;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    /// Cross-process advisory lock. Defaults to `<db_path>.lock`.
    pub lock_path: Option<PathBuf>,
    pub promotion_threshold_pct: f64,
    pub drift_warning_pct: f64,
    pub drift_critical_pct: f64,
    pub trainer_timeout_secs: u64,
    pub min_training_rows: usize,
    pub poll_interval_secs: u64,
    /// Shell command for an external trainer. The built-in rolling-mean
    /// baseline is used when unset.
    pub trainer_command: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            lock_path: None,
            promotion_threshold_pct: DEFAULT_PROMOTION_THRESHOLD_PCT,
            drift_warning_pct: DEFAULT_DRIFT_WARNING_PCT,
            drift_critical_pct: DEFAULT_DRIFT_CRITICAL_PCT,
            trainer_timeout_secs: DEFAULT_TRAINER_TIMEOUT_SECS,
            min_training_rows: DEFAULT_MIN_TRAINING_ROWS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            trainer_command: None,
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("salesops")
        .join("pipeline.db")
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.promotion_policy()?;
        self.drift_thresholds()?;
        if self.trainer_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "trainer_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(PipelineError::Config(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self
            .trainer_command
            .as_deref()
            .is_some_and(|command| command.trim().is_empty())
        {
            return Err(PipelineError::Config(
                "trainer_command must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn promotion_policy(&self) -> Result<PromotionPolicy, PipelineError> {
        PromotionPolicy::new(self.promotion_threshold_pct)
            .map_err(|err| PipelineError::Config(err.to_string()))
    }

    pub fn drift_thresholds(&self) -> Result<DriftThresholds, PipelineError> {
        DriftThresholds::new(self.drift_warning_pct, self.drift_critical_pct)
            .map_err(|err| PipelineError::Config(err.to_string()))
    }

    pub fn trainer_timeout(&self) -> Duration {
        Duration::from_secs(self.trainer_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Overlays `SALESOPS_*` variables. `lookup` is usually `std::env::var`
    /// wrapped to return an `Option`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read("SALESOPS_DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = read("SALESOPS_LOCK_PATH") {
            self.lock_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read("SALESOPS_PROMOTION_THRESHOLD_PCT") {
            self.promotion_threshold_pct = parse_env("SALESOPS_PROMOTION_THRESHOLD_PCT", &value)?;
        }
        if let Some(value) = read("SALESOPS_DRIFT_WARNING_PCT") {
            self.drift_warning_pct = parse_env("SALESOPS_DRIFT_WARNING_PCT", &value)?;
        }
        if let Some(value) = read("SALESOPS_DRIFT_CRITICAL_PCT") {
            self.drift_critical_pct = parse_env("SALESOPS_DRIFT_CRITICAL_PCT", &value)?;
        }
        if let Some(value) = read("SALESOPS_TRAINER_TIMEOUT_SECS") {
            self.trainer_timeout_secs = parse_env("SALESOPS_TRAINER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read("SALESOPS_MIN_TRAINING_ROWS") {
            self.min_training_rows = parse_env("SALESOPS_MIN_TRAINING_ROWS", &value)?;
        }
        if let Some(value) = read("SALESOPS_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("SALESOPS_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read("SALESOPS_TRAINER_COMMAND") {
            self.trainer_command = Some(value);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PipelineError> {
    value
        .parse::<T>()
        .map_err(|_| PipelineError::Config(format!("{key}: cannot parse {value:?}")))
}
