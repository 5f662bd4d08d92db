use crate::orchestrator::{CancellationToken, PipelineOrchestrator, RunReport, TriggerOutcome};
use crate::run_gate::RunGate;
use crate::trainer::{CommandTrainer, RollingMeanTrainer, Trainer};
use crate::{
    lock_store, shared_store, ErrorClass, EvaluationOutcome, PipelineConfig, PipelineError,
    SharedStore,
};
use chrono::{DateTime, Utc};
use salesops_core::{
    ComparisonLogEntry, DriftMetric, DriftReport, DriftStatus, ModelRecord, Observation,
    PipelineRun, TrackedStat, TriggerLogEntry, RAW_SALES_STREAM,
};
use salesops_storage::PipelineStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ok,
    Skipped,
    /// The change detector could not be read.
    NoSignal,
    Busy,
    Halted,
    Failed,
}

/// What every public operation returns: a status, a readable summary and
/// an optional payload. Errors never cross this boundary raw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub status: OperationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub detail: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(message: impl Into<String>, detail: Option<T>) -> Self {
        Self {
            status: OperationStatus::Ok,
            message: message.into(),
            error_class: None,
            detail,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Skipped,
            message: message.into(),
            error_class: None,
            detail: None,
        }
    }

    pub fn failed(err: &PipelineError) -> Self {
        let class = err.class();
        let status = match class {
            ErrorClass::Busy => OperationStatus::Busy,
            ErrorClass::Halted => OperationStatus::Halted,
            _ => OperationStatus::Failed,
        };
        Self {
            status,
            message: err.to_string(),
            error_class: Some(class),
            detail: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OperationStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Models,
    Comparisons,
    Drift,
    Runs,
    Triggers,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Models => "models",
            HistoryKind::Comparisons => "comparisons",
            HistoryKind::Drift => "drift",
            HistoryKind::Runs => "runs",
            HistoryKind::Triggers => "triggers",
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryKind {
    type Err = PipelineError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "models" => Ok(HistoryKind::Models),
            "comparisons" => Ok(HistoryKind::Comparisons),
            "drift" => Ok(HistoryKind::Drift),
            "runs" => Ok(HistoryKind::Runs),
            "triggers" => Ok(HistoryKind::Triggers),
            other => Err(PipelineError::Config(format!("unknown history table: {other}"))),
        }
    }
}

/// Newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "rows", rename_all = "snake_case")]
pub enum HistoryPage {
    Models(Vec<ModelRecord>),
    Comparisons(Vec<ComparisonLogEntry>),
    Drift(Vec<DriftMetric>),
    Runs(Vec<PipelineRun>),
    Triggers(Vec<TriggerLogEntry>),
}

impl HistoryPage {
    pub fn len(&self) -> usize {
        match self {
            HistoryPage::Models(rows) => rows.len(),
            HistoryPage::Comparisons(rows) => rows.len(),
            HistoryPage::Drift(rows) => rows.len(),
            HistoryPage::Runs(rows) => rows.len(),
            HistoryPage::Triggers(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub production_version: Option<String>,
    pub production_mae: Option<f64>,
    pub production_promoted_at: Option<DateTime<Utc>>,
    pub pending_candidate: Option<String>,
    pub raw_record_count: i64,
    pub feature_count: i64,
    pub drift_status: Option<DriftStatus>,
    pub drift_checked_at: Option<DateTime<Utc>>,
    pub last_run: Option<PipelineRun>,
    pub watermark: i64,
    pub stream_head: i64,
    pub run_in_progress: bool,
    pub halted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub appended: usize,
    pub excluded: usize,
    pub head: i64,
}

/// Entry point for schedulers and the CLI.
pub struct PipelineService {
    store: SharedStore,
    config: PipelineConfig,
    orchestrator: PipelineOrchestrator,
}

impl PipelineService {
    pub fn new(
        store: SharedStore,
        config: PipelineConfig,
        trainer: Arc<dyn Trainer>,
    ) -> Result<Self, PipelineError> {
        let lock_path = config
            .lock_path
            .clone()
            .or_else(|| lock_store(&store).run_lock_path());
        let gate = RunGate::new(lock_path);
        let orchestrator = PipelineOrchestrator::new(store.clone(), &config, trainer, gate)?;
        Ok(Self {
            store,
            config,
            orchestrator,
        })
    }

    /// Opens (or creates) the database at `config.db_path` with the trainer
    /// the config selects.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = shared_store(PipelineStore::open(&config.db_path)?);
        let trainer = configured_trainer(&config);
        Self::new(store, config, trainer)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Appends cleaned observations to the stream. Records that fail
    /// validation are excluded and counted.
    pub fn load_observations(&self, observations: Vec<Observation>) -> OperationResult<LoadReport> {
        self.load_batch(observations, 0)
    }

    /// Like `load_observations` for a batch whose reader already dropped
    /// `unparsed` records; those count as excluded too.
    pub fn load_batch(
        &self,
        observations: Vec<Observation>,
        unparsed: usize,
    ) -> OperationResult<LoadReport> {
        let mut valid = Vec::with_capacity(observations.len());
        let mut excluded = unparsed;
        for (index, observation) in observations.into_iter().enumerate() {
            match observation.validate() {
                Ok(_) => valid.push(observation),
                Err(err) => {
                    excluded += 1;
                    warn!(event = "observation_rejected", index, error = %err);
                }
            }
        }

        let appended = lock_store(&self.store).append_observations(&valid, Utc::now());
        match appended {
            Ok(report) => {
                info!(
                    event = "observations_loaded",
                    appended = report.appended,
                    excluded,
                    head = report.head,
                );
                OperationResult::ok(
                    format!("appended {} observations, excluded {excluded}", report.appended),
                    Some(LoadReport {
                        appended: report.appended,
                        excluded,
                        head: report.head,
                    }),
                )
            }
            Err(err) => self.fail(err.into()),
        }
    }

    pub fn trigger_pipeline_if_new_data(&self) -> OperationResult<RunReport> {
        self.trigger_pipeline_with(&CancellationToken::new())
    }

    pub fn trigger_pipeline_with(&self, cancel: &CancellationToken) -> OperationResult<RunReport> {
        match self.orchestrator.trigger_if_new_data(cancel) {
            Ok(TriggerOutcome::NoNewData(signal)) => OperationResult::skipped(format!(
                "no new data since position {}",
                signal.acknowledged
            )),
            Ok(TriggerOutcome::NoSignal { reason }) => OperationResult {
                status: OperationStatus::NoSignal,
                message: format!("change detector unavailable: {reason}"),
                error_class: Some(ErrorClass::TransientIo),
                detail: None,
            },
            Ok(TriggerOutcome::Completed(report)) => match &report.failure {
                None => OperationResult::ok(
                    format!("run {} done: {}", report.run.run_id, report.run.message),
                    Some(report),
                ),
                Some(failure) => OperationResult {
                    status: if failure.class == ErrorClass::InvalidState {
                        OperationStatus::Halted
                    } else {
                        OperationStatus::Failed
                    },
                    message: format!("run {} failed: {}", report.run.run_id, failure.message),
                    error_class: Some(failure.class),
                    detail: Some(report),
                },
            },
            Err(err) => self.fail(err),
        }
    }

    pub fn run_promotion_evaluation(&self) -> OperationResult<EvaluationOutcome> {
        match self.evaluate_under_gate() {
            Ok(outcome) if outcome.decision.is_evaluated() => OperationResult::ok(
                format!("{}: {}", outcome.decision, outcome.reason),
                Some(outcome),
            ),
            Ok(outcome) => OperationResult {
                status: OperationStatus::Skipped,
                message: outcome.reason.clone(),
                error_class: None,
                detail: Some(outcome),
            },
            Err(err) => self.fail(err),
        }
    }

    fn evaluate_under_gate(&self) -> Result<EvaluationOutcome, PipelineError> {
        if let Some(halt) = lock_store(&self.store).halt_state()? {
            return Err(PipelineError::Halted(halt.reason));
        }
        let Some(_permit) = self.orchestrator.gate().try_acquire("promotion-evaluation")? else {
            return Err(PipelineError::Busy);
        };
        self.orchestrator.evaluator().evaluate(Utc::now())
    }

    pub fn run_drift_check(&self) -> OperationResult<DriftReport> {
        let monitor = self.orchestrator.drift_monitor();
        let result = monitor
            .current_stats()
            .and_then(|stats| monitor.check_drift(&stats, Utc::now()));
        match result {
            Ok(report) => OperationResult::ok(report.summary.clone(), Some(report)),
            Err(err) => self.fail(err),
        }
    }

    pub fn reset_drift_baseline(&self) -> OperationResult<DriftReport> {
        let monitor = self.orchestrator.drift_monitor();
        let result = monitor
            .current_stats()
            .and_then(|stats| monitor.reset_baseline(&stats, Utc::now()));
        match result {
            Ok(report) => OperationResult::ok("drift baseline reset", Some(report)),
            Err(err) => self.fail(err),
        }
    }

    pub fn get_production_model(&self) -> OperationResult<ModelRecord> {
        let production = lock_store(&self.store).production_model();
        match production {
            Ok(Some(record)) => OperationResult::ok(
                format!(
                    "{} ({}) MAE {:.4}",
                    record.version, record.model_type, record.metrics.mae
                ),
                Some(record),
            ),
            Ok(None) => OperationResult::ok("no production model", None),
            Err(err) => self.fail(err.into()),
        }
    }

    /// Health snapshot read under a single store lock.
    pub fn status(&self) -> OperationResult<StatusSnapshot> {
        let snapshot = {
            let store = lock_store(&self.store);
            self.snapshot(&store)
        };
        match snapshot {
            Ok(snapshot) => {
                let message = match (&snapshot.halted, &snapshot.production_version) {
                    (Some(reason), _) => format!("halted: {reason}"),
                    (None, Some(version)) => format!("production model {version}"),
                    (None, None) => "no production model".to_string(),
                };
                OperationResult::ok(message, Some(snapshot))
            }
            Err(err) => self.fail(err),
        }
    }

    fn snapshot(&self, store: &PipelineStore) -> Result<StatusSnapshot, PipelineError> {
        let production = store.production_model()?;
        let drift = store.latest_drift_metric(TrackedStat::Mean.metric_name())?;
        Ok(StatusSnapshot {
            production_version: production.as_ref().map(|record| record.version.clone()),
            production_mae: production.as_ref().map(|record| record.metrics.mae),
            production_promoted_at: production.as_ref().and_then(|record| record.promoted_at),
            pending_candidate: store.latest_candidate()?.map(|record| record.version),
            raw_record_count: store.raw_record_count()?,
            feature_count: store.feature_count()?,
            drift_status: drift.as_ref().map(|metric| metric.status),
            drift_checked_at: drift.as_ref().map(|metric| metric.checked_at),
            last_run: store.latest_run()?,
            watermark: store
                .watermark(RAW_SALES_STREAM)?
                .map(|watermark| watermark.position)
                .unwrap_or(0),
            stream_head: store.stream_head(RAW_SALES_STREAM)?,
            run_in_progress: self.orchestrator.gate().is_active(),
            halted: store.halt_state()?.map(|halt| halt.reason),
        })
    }

    pub fn history(&self, kind: HistoryKind, limit: usize) -> OperationResult<HistoryPage> {
        let page = {
            let store = lock_store(&self.store);
            match kind {
                HistoryKind::Models => store.models(limit).map(HistoryPage::Models),
                HistoryKind::Comparisons => store.comparisons(limit).map(HistoryPage::Comparisons),
                HistoryKind::Drift => store.drift_metrics(limit).map(HistoryPage::Drift),
                HistoryKind::Runs => store.pipeline_runs(limit).map(HistoryPage::Runs),
                HistoryKind::Triggers => store.trigger_log(limit).map(HistoryPage::Triggers),
            }
        };
        match page {
            Ok(page) => OperationResult::ok(format!("{} {kind} rows", page.len()), Some(page)),
            Err(err) => self.fail(err.into()),
        }
    }

    /// Clears the halt flag. Returns the reason that was cleared.
    pub fn resume(&self) -> OperationResult<String> {
        let store = lock_store(&self.store);
        let cleared = store
            .halt_state()
            .and_then(|state| store.clear_halt().map(|_| state));
        drop(store);
        match cleared {
            Ok(Some(state)) => {
                info!(event = "pipeline_resumed", reason = %state.reason);
                OperationResult::ok("pipeline resumed", Some(state.reason))
            }
            Ok(None) => OperationResult::skipped("pipeline was not halted"),
            Err(err) => self.fail(err.into()),
        }
    }

    fn fail<T>(&self, err: PipelineError) -> OperationResult<T> {
        if err.is_fatal() {
            error!(event = "pipeline_halted", error = %err);
            if let Err(persist) = lock_store(&self.store).set_halt(&err.to_string(), Utc::now()) {
                error!(event = "halt_persist_failed", error = %persist);
            }
            let mut result = OperationResult::failed(&err);
            result.status = OperationStatus::Halted;
            return result;
        }
        warn!(event = "operation_failed", class = err.class().as_str(), error = %err);
        OperationResult::failed(&err)
    }
}

pub fn configured_trainer(config: &PipelineConfig) -> Arc<dyn Trainer> {
    match config.trainer_command.as_deref() {
        Some(cmdline) => Arc::new(CommandTrainer::new(cmdline, config.min_training_rows)),
        None => Arc::new(RollingMeanTrainer::new(config.min_training_rows)),
    }
}
