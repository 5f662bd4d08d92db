use crate::change_detector::{ChangeDetector, ChangeSignal};
use crate::drift_monitor::DriftMonitor;
use crate::evaluator::{EvaluationOutcome, PromotionEvaluator};
use crate::registry::ModelRegistry;
use crate::run_gate::RunGate;
use crate::trainer::{train_with_timeout, Trainer, TrainerError};
use crate::{lock_store, ErrorClass, PipelineConfig, PipelineError, SharedStore};
use chrono::Utc;
use salesops_core::{
    derive_features, DriftReport, FeatureStats, PipelineRun, RunPhase, RunStatus, TriggerKind,
    TriggerLogEntry, RAW_SALES_STREAM,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Checked at every stage boundary; a stage already running is not
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Last stage entered before the failure.
    pub stage: RunPhase,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: PipelineRun,
    pub new_rows: u64,
    pub excluded_observations: usize,
    pub candidate_version: Option<String>,
    pub evaluation: Option<EvaluationOutcome>,
    pub drift: Option<DriftReport>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    NoNewData(ChangeSignal),
    /// The detector could not be read. Not the same as "no new data".
    NoSignal { reason: String },
    Completed(RunReport),
}

#[derive(Debug, Default)]
struct RunProgress {
    phase: RunPhase,
    records: u64,
    excluded: usize,
    fingerprint: Option<String>,
    candidate_version: Option<String>,
    evaluation: Option<EvaluationOutcome>,
    drift: Option<DriftReport>,
}

impl RunProgress {
    fn enter(
        &mut self,
        phase: RunPhase,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.phase = phase;
        info!(event = "run_stage", run_id, phase = %phase);
        Ok(())
    }
}

/// Sequences features, training, comparison and drift monitoring as one
/// unit of work per detected change.
pub struct PipelineOrchestrator {
    store: SharedStore,
    detector: ChangeDetector,
    registry: ModelRegistry,
    evaluator: PromotionEvaluator,
    drift: DriftMonitor,
    trainer: Arc<dyn Trainer>,
    gate: RunGate,
    trainer_timeout: Duration,
    min_training_rows: usize,
}

impl PipelineOrchestrator {
    pub fn new(
        store: SharedStore,
        config: &PipelineConfig,
        trainer: Arc<dyn Trainer>,
        gate: RunGate,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            detector: ChangeDetector::new(store.clone(), RAW_SALES_STREAM),
            registry: ModelRegistry::new(store.clone()),
            evaluator: PromotionEvaluator::new(store.clone(), config.promotion_policy()?),
            drift: DriftMonitor::new(store.clone(), config.drift_thresholds()?),
            store,
            trainer,
            gate,
            trainer_timeout: config.trainer_timeout(),
            min_training_rows: config.min_training_rows,
        })
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn evaluator(&self) -> &PromotionEvaluator {
        &self.evaluator
    }

    pub fn drift_monitor(&self) -> &DriftMonitor {
        &self.drift
    }

    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    /// Runs the full stage sequence when the detector reports new rows.
    /// The trigger log entry, run row and watermark advance are committed
    /// together once the run reaches DONE or FAILED.
    pub fn trigger_if_new_data(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TriggerOutcome, PipelineError> {
        if let Some(halt) = lock_store(&self.store).halt_state()? {
            return Err(PipelineError::Halted(halt.reason));
        }

        let run_id = PipelineRun::new_run_id();
        let Some(_permit) = self.gate.try_acquire(&run_id)? else {
            return Err(PipelineError::Busy);
        };

        let signal = match self.detector.inspect() {
            Ok(signal) => signal,
            Err(err) => {
                warn!(event = "change_detector_unavailable", error = %err);
                return Ok(TriggerOutcome::NoSignal {
                    reason: err.to_string(),
                });
            }
        };
        if !signal.has_new_data() {
            return Ok(TriggerOutcome::NoNewData(signal));
        }

        let started_at = Utc::now();
        let trigger = TriggerLogEntry {
            logged_at: started_at,
            run_id: run_id.clone(),
            trigger_kind: TriggerKind::Stream,
            new_rows: signal.new_rows(),
            from_position: signal.acknowledged,
            to_position: signal.head,
        };
        info!(
            event = "run_started",
            run_id = %run_id,
            new_rows = signal.new_rows(),
            head = signal.head,
        );

        let mut progress = RunProgress::default();
        let result = self.run_stages(&run_id, signal.head, cancel, &mut progress);

        let (status, message, failure) = match &result {
            Ok(()) => {
                progress.phase = RunPhase::Done;
                (RunStatus::Success, success_message(&progress), None)
            }
            Err(err) => {
                let stage = progress.phase;
                let message = match err {
                    PipelineError::Cancelled => err.to_string(),
                    _ => format!("{} stage failed: {err}", stage.as_str().to_lowercase()),
                };
                progress.phase = RunPhase::Failed;
                (
                    RunStatus::Failed,
                    message.clone(),
                    Some(RunFailure {
                        stage,
                        class: err.class(),
                        message,
                    }),
                )
            }
        };

        let run = PipelineRun {
            run_id: run_id.clone(),
            phase: progress.phase,
            status,
            records_processed: progress.records,
            started_at,
            finished_at: Utc::now(),
            trigger_position: signal.head,
            feature_fingerprint: progress.fingerprint.clone(),
            message,
        };

        {
            let store = lock_store(&self.store);
            store.complete_run(
                &run,
                Some(&trigger),
                Some((self.detector.stream(), signal.head)),
            )?;
            if let Err(err) = &result {
                if err.is_fatal() {
                    store.set_halt(&err.to_string(), run.finished_at)?;
                }
            }
        }

        match &result {
            Ok(()) => info!(
                event = "run_done",
                run_id = %run.run_id,
                records = run.records_processed,
                duration_ms = run.duration_ms(),
            ),
            Err(err) if err.is_fatal() => error!(
                event = "pipeline_halted",
                run_id = %run.run_id,
                message = %run.message,
            ),
            Err(err) => warn!(
                event = "run_failed",
                run_id = %run.run_id,
                class = err.class().as_str(),
                message = %run.message,
            ),
        }

        Ok(TriggerOutcome::Completed(RunReport {
            run,
            new_rows: signal.new_rows(),
            excluded_observations: progress.excluded,
            candidate_version: progress.candidate_version,
            evaluation: progress.evaluation,
            drift: progress.drift,
            failure,
        }))
    }

    fn run_stages(
        &self,
        run_id: &str,
        head: i64,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<(), PipelineError> {
        progress.enter(RunPhase::Features, run_id, cancel)?;
        let observations = lock_store(&self.store).observations_through(head)?;
        let derivation = derive_features(&observations);
        for excluded in &derivation.excluded {
            warn!(
                event = "observation_excluded",
                run_id,
                index = excluded.index,
                error = %excluded.error,
            );
        }
        lock_store(&self.store).replace_features(&derivation.rows, Utc::now())?;
        progress.records = derivation.rows.len() as u64;
        progress.excluded = derivation.excluded.len();
        progress.fingerprint = Some(derivation.fingerprint());

        progress.enter(RunPhase::Training, run_id, cancel)?;
        if derivation.rows.len() < self.min_training_rows {
            return Err(TrainerError::InsufficientData {
                rows: derivation.rows.len(),
                required: self.min_training_rows,
            }
            .into());
        }
        let outcome = train_with_timeout(
            self.trainer.clone(),
            derivation.rows.clone(),
            self.trainer_timeout,
        )?;
        let candidate = self.registry.register(&outcome, Utc::now())?;
        progress.candidate_version = Some(candidate.version);

        progress.enter(RunPhase::Comparing, run_id, cancel)?;
        progress.evaluation = Some(self.evaluator.evaluate(Utc::now())?);

        progress.enter(RunPhase::Monitoring, run_id, cancel)?;
        let stats = FeatureStats::from_values(&derivation.target_values())?;
        progress.drift = Some(self.drift.check_drift(&stats, Utc::now())?);

        Ok(())
    }
}

fn success_message(progress: &RunProgress) -> String {
    let decision = progress
        .evaluation
        .as_ref()
        .map(|evaluation| evaluation.decision.as_str())
        .unwrap_or("none");
    let drift = progress
        .drift
        .as_ref()
        .map(|report| report.status.as_str())
        .unwrap_or("none");
    format!(
        "{} feature rows; decision {decision}; drift {drift}",
        progress.records
    )
}
