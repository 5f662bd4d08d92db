use chrono::Utc;
use salesops_core::{
    ComparisonDecision, DriftStatus, FeatureRow, ModelStatus, Observation, RunPhase, RunStatus,
    TrackedStat, TrainingOutcome, RAW_SALES_STREAM,
};
use salesops_pipeline::trainer::next_model_version;
use salesops_pipeline::{
    shared_store, CancellationToken, ErrorClass, HistoryKind, HistoryPage, OperationStatus,
    PipelineConfig, PipelineService, SharedStore, Trainer, TrainerError,
};
use salesops_storage::PipelineStore;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const BRANDS: [&str; 3] = ["acme", "nova", "zeta"];

/// Plays back a fixed list of results, one per training call.
struct ScriptedTrainer {
    script: Mutex<VecDeque<Result<f64, TrainerError>>>,
}

impl ScriptedTrainer {
    fn new(script: Vec<Result<f64, TrainerError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

impl Trainer for ScriptedTrainer {
    fn model_type(&self) -> &str {
        "scripted"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(TrainerError::Failed("script exhausted".to_string())));
        next.map(|mae| outcome(mae, features.len()))
    }
}

/// Blocks inside `train` until the test releases it.
struct BlockingTrainer {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Trainer for BlockingTrainer {
    fn model_type(&self) -> &str {
        "blocking"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        self.started
            .lock()
            .expect("started lock")
            .send(())
            .expect("signal start");
        self.release
            .lock()
            .expect("release lock")
            .recv()
            .expect("wait for release");
        Ok(outcome(40.0, features.len()))
    }
}

/// Requests cancellation while its own stage is running.
struct CancellingTrainer {
    token: CancellationToken,
}

impl Trainer for CancellingTrainer {
    fn model_type(&self) -> &str {
        "cancelling"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        self.token.cancel();
        Ok(outcome(10.0, features.len()))
    }
}

struct SleepingTrainer;

impl Trainer for SleepingTrainer {
    fn model_type(&self) -> &str {
        "sleeping"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        std::thread::sleep(Duration::from_secs(3));
        Ok(outcome(1.0, features.len()))
    }
}

fn outcome(mae: f64, rows: usize) -> TrainingOutcome {
    TrainingOutcome {
        version: next_model_version(),
        model_type: "scripted".to_string(),
        mae,
        rmse: mae * 1.1,
        mape: 7.5,
        training_record_count: rows as u64,
    }
}

fn month_batch(month: u32, scale: f64) -> Vec<Observation> {
    BRANDS
        .iter()
        .map(|brand| {
            Observation::new(
                *brand,
                "CA",
                format!("2023-{month:02}"),
                scale * (100.0 + month as f64),
                format!("batch-{month}"),
            )
        })
        .collect()
}

fn months(range: std::ops::RangeInclusive<u32>) -> Vec<Observation> {
    range.flat_map(|month| month_batch(month, 1.0)).collect()
}

fn service_with(trainer: Arc<dyn Trainer>, config: PipelineConfig) -> (SharedStore, PipelineService) {
    let store = shared_store(PipelineStore::open_in_memory().expect("open db"));
    let service = PipelineService::new(store.clone(), config, trainer).expect("service");
    (store, service)
}

/// A separate connection and run gate per call, as a second process would have.
fn open_service(db_path: &Path, trainer: Arc<dyn Trainer>) -> PipelineService {
    let store = shared_store(PipelineStore::open(db_path).expect("open db"));
    PipelineService::new(store, PipelineConfig::default(), trainer).expect("service")
}

fn service(trainer: Arc<dyn Trainer>) -> (SharedStore, PipelineService) {
    service_with(trainer, PipelineConfig::default())
}

fn production_version(service: &PipelineService) -> Option<String> {
    service.get_production_model().detail.map(|record| record.version)
}

fn production_count(store: &SharedStore) -> i64 {
    store
        .lock()
        .expect("store lock")
        .count_models_with_status(ModelStatus::Production)
        .expect("count")
}

#[test]
fn retrigger_without_new_data_runs_nothing() {
    let (store, service) = service(ScriptedTrainer::new(vec![Ok(50.0)]));
    service.load_observations(months(1..=8));

    let first = service.trigger_pipeline_if_new_data();
    assert_eq!(first.status, OperationStatus::Ok, "{}", first.message);
    let second = service.trigger_pipeline_if_new_data();
    assert_eq!(second.status, OperationStatus::Skipped);
    let third = service.trigger_pipeline_if_new_data();
    assert_eq!(third.status, OperationStatus::Skipped);

    let store = store.lock().expect("store lock");
    assert_eq!(store.pipeline_runs(10).expect("runs").len(), 1);
    assert_eq!(store.trigger_log(10).expect("triggers").len(), 1);
}

#[test]
fn cold_start_then_policy_decisions_across_runs() {
    let trainer = ScriptedTrainer::new(vec![Ok(100.0), Ok(90.0), Ok(87.3), Ok(99.0)]);
    let (store, service) = service(trainer);

    service.load_observations(months(1..=8));
    let run = service.trigger_pipeline_if_new_data();
    let report = run.detail.expect("report");
    let evaluation = report.evaluation.expect("evaluation");
    assert_eq!(evaluation.decision, ComparisonDecision::Promote);
    assert_eq!(evaluation.reason, "first model");
    let first_version = production_version(&service).expect("production");

    service.load_observations(month_batch(9, 1.0));
    let run = service.trigger_pipeline_if_new_data();
    let evaluation = run.detail.and_then(|report| report.evaluation).expect("evaluation");
    assert_eq!(evaluation.decision, ComparisonDecision::Promote);
    assert_eq!(evaluation.archived_production.as_deref(), Some(first_version.as_str()));
    let second_version = production_version(&service).expect("production");
    assert_ne!(first_version, second_version);

    service.load_observations(month_batch(10, 1.0));
    let run = service.trigger_pipeline_if_new_data();
    let evaluation = run.detail.and_then(|report| report.evaluation).expect("evaluation");
    assert_eq!(evaluation.decision, ComparisonDecision::KeepCurrent);
    assert!(evaluation.reason.contains("below threshold"), "{}", evaluation.reason);
    assert_eq!(production_version(&service), Some(second_version.clone()));

    service.load_observations(month_batch(11, 1.0));
    let run = service.trigger_pipeline_if_new_data();
    let evaluation = run.detail.and_then(|report| report.evaluation).expect("evaluation");
    assert_eq!(evaluation.decision, ComparisonDecision::KeepCurrent);
    assert!(evaluation.reason.starts_with("regression"));
    assert_eq!(production_version(&service), Some(second_version));

    assert_eq!(production_count(&store), 1);
    let comparisons = service.history(HistoryKind::Comparisons, 10);
    let Some(HistoryPage::Comparisons(entries)) = comparisons.detail else {
        panic!("expected comparison history");
    };
    let decisions = entries.iter().map(|entry| entry.decision).collect::<Vec<_>>();
    assert_eq!(
        decisions,
        vec![
            ComparisonDecision::KeepCurrent,
            ComparisonDecision::KeepCurrent,
            ComparisonDecision::Promote,
            ComparisonDecision::Promote,
        ]
    );
}

#[test]
fn trainer_failure_leaves_registry_untouched() {
    let trainer = ScriptedTrainer::new(vec![
        Ok(100.0),
        Err(TrainerError::Failed("solver diverged".to_string())),
    ]);
    let (store, service) = service(trainer);
    service.load_observations(months(1..=8));
    service.trigger_pipeline_if_new_data();
    let production = production_version(&service);

    service.load_observations(month_batch(9, 1.0));
    let result = service.trigger_pipeline_if_new_data();
    assert_eq!(result.status, OperationStatus::Failed);
    assert!(result.message.contains("solver diverged"), "{}", result.message);
    let report = result.detail.expect("report");
    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.failure.map(|failure| failure.stage), Some(RunPhase::Training));

    let guard = store.lock().expect("store lock");
    assert_eq!(
        guard.count_models_with_status(ModelStatus::Candidate).expect("count"),
        0
    );
    assert_eq!(guard.models(10).expect("models").len(), 1);
    let latest = guard.latest_run().expect("latest").expect("run");
    assert_eq!(latest.status, RunStatus::Failed);
    assert_eq!(
        guard.watermark(RAW_SALES_STREAM).expect("wm").map(|wm| wm.position),
        Some(guard.stream_head(RAW_SALES_STREAM).expect("head"))
    );
    drop(guard);
    assert_eq!(production_version(&service), production);
}

#[test]
fn trainer_timeout_fails_run_without_candidate() {
    let config = PipelineConfig {
        trainer_timeout_secs: 1,
        ..PipelineConfig::default()
    };
    let (store, service) = service_with(Arc::new(SleepingTrainer), config);
    service.load_observations(months(1..=8));

    let result = service.trigger_pipeline_if_new_data();
    assert_eq!(result.status, OperationStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
    assert!(store
        .lock()
        .expect("store lock")
        .models(10)
        .expect("models")
        .is_empty());
}

#[test]
fn cancellation_at_stage_boundary_keeps_production() {
    let token = CancellationToken::new();
    let (store, service) = service(ScriptedTrainer::new(vec![Ok(100.0)]));
    service.load_observations(months(1..=8));
    service.trigger_pipeline_if_new_data();
    let production = production_version(&service).expect("production");

    let cancelling = PipelineService::new(
        store.clone(),
        PipelineConfig::default(),
        Arc::new(CancellingTrainer {
            token: token.clone(),
        }),
    )
    .expect("service");
    cancelling.load_observations(month_batch(9, 1.0));
    let result = cancelling.trigger_pipeline_with(&token);

    assert_eq!(result.status, OperationStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::Cancelled));
    let report = result.detail.expect("report");
    assert_eq!(report.run.message, "cancelled");
    assert_eq!(report.run.phase, RunPhase::Failed);
    assert!(report.evaluation.is_none());
    assert_eq!(production_version(&cancelling), Some(production));
    assert_eq!(production_count(&store), 1);
}

#[test]
fn overlapping_trigger_is_refused_and_mid_run_rows_trigger_next_run() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let trainer = Arc::new(BlockingTrainer {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let (store, service) = service(trainer);
    service.load_observations(months(1..=8));

    std::thread::scope(|scope| {
        let running = scope.spawn(|| service.trigger_pipeline_if_new_data());
        started_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("trainer started");

        assert_eq!(
            service.trigger_pipeline_if_new_data().status,
            OperationStatus::Busy
        );
        assert_eq!(service.run_promotion_evaluation().status, OperationStatus::Busy);

        let status = service.status().detail.expect("snapshot");
        assert!(status.run_in_progress);
        let drift = service.run_drift_check();
        assert_eq!(drift.status, OperationStatus::Ok, "{}", drift.message);

        service.load_observations(month_batch(9, 1.0));
        release_tx.send(()).expect("release trainer");
        let first = running.join().expect("run thread");
        assert_eq!(first.status, OperationStatus::Ok, "{}", first.message);
        assert_eq!(first.detail.map(|report| report.run.trigger_position), Some(24));
    });

    let pending = service.status().detail.expect("snapshot");
    assert_eq!(pending.watermark, 24);
    assert_eq!(pending.stream_head, 27);

    // The blocking trainer has no release queued, so the follow-up run uses a
    // scripted one against the same store.
    let follow_up = PipelineService::new(
        store.clone(),
        PipelineConfig::default(),
        ScriptedTrainer::new(vec![Ok(30.0)]),
    )
    .expect("service");
    let result = follow_up.trigger_pipeline_if_new_data();
    assert_eq!(result.status, OperationStatus::Ok, "{}", result.message);

    let runs = store
        .lock()
        .expect("store lock")
        .pipeline_runs(10)
        .expect("runs");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].trigger_position, 27);
}

#[test]
fn drift_baseline_is_set_once_and_shift_is_detected() {
    let (_, service) = service(ScriptedTrainer::new(vec![Ok(50.0), Ok(49.0)]));
    service.load_observations(months(1..=8));
    let first = service
        .trigger_pipeline_if_new_data()
        .detail
        .and_then(|report| report.drift)
        .expect("drift report");
    assert_eq!(first.status, DriftStatus::Baseline);
    let baseline_mean = first
        .metric(TrackedStat::Mean)
        .map(|metric| metric.baseline_value)
        .expect("mean baseline");

    for month in 9..=12 {
        service.load_observations(month_batch(month, 3.0));
    }
    let second = service
        .trigger_pipeline_if_new_data()
        .detail
        .and_then(|report| report.drift)
        .expect("drift report");
    let mean = second.metric(TrackedStat::Mean).expect("mean");
    assert_eq!(mean.baseline_value, baseline_mean);
    assert!(mean.current_value > baseline_mean);
    assert_eq!(mean.status, DriftStatus::Critical);
    assert_eq!(second.status, DriftStatus::Critical);

    let snapshot = service.status().detail.expect("snapshot");
    assert_eq!(snapshot.drift_status, Some(DriftStatus::Critical));

    let rebased = service.reset_drift_baseline();
    assert!(rebased.is_ok());
    let after = service.run_drift_check().detail.expect("drift report");
    assert_eq!(after.status, DriftStatus::Normal);
}

#[test]
fn file_backed_state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PipelineConfig {
        db_path: dir.path().join("data").join("pipeline.db"),
        lock_path: Some(dir.path().join("pipeline.lock")),
        ..PipelineConfig::default()
    };

    let production = {
        let service = PipelineService::open(config.clone()).expect("open service");
        service.load_observations(months(1..=8));
        let result = service.trigger_pipeline_if_new_data();
        assert_eq!(result.status, OperationStatus::Ok, "{}", result.message);
        production_version(&service).expect("production")
    };

    let service = PipelineService::open(config).expect("reopen service");
    assert_eq!(
        service.trigger_pipeline_if_new_data().status,
        OperationStatus::Skipped
    );
    let record = service.get_production_model().detail.expect("production");
    assert_eq!(record.version, production);
    assert_eq!(record.model_type, "rolling_mean_3");
    assert!(record.promoted_at.is_some_and(|at| at <= Utc::now()));
}

#[test]
fn services_sharing_a_database_file_never_run_concurrently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("pipeline.db");
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let first = open_service(
        &db_path,
        Arc::new(BlockingTrainer {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        }),
    );
    let second = open_service(&db_path, ScriptedTrainer::new(vec![Ok(30.0)]));
    first.load_observations(months(1..=8));

    std::thread::scope(|scope| {
        let running = scope.spawn(|| first.trigger_pipeline_if_new_data());
        started_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("trainer started");

        let refused = second.trigger_pipeline_if_new_data();
        assert_eq!(refused.status, OperationStatus::Busy, "{}", refused.message);
        assert_eq!(second.run_promotion_evaluation().status, OperationStatus::Busy);

        release_tx.send(()).expect("release trainer");
        let done = running.join().expect("run thread");
        assert_eq!(done.status, OperationStatus::Ok, "{}", done.message);
    });

    assert!(dir.path().join("pipeline.db.lock").exists());
    assert_eq!(
        second.trigger_pipeline_if_new_data().status,
        OperationStatus::Skipped
    );
    let runs = second.history(HistoryKind::Runs, 10);
    match runs.detail {
        Some(HistoryPage::Runs(runs)) => assert_eq!(runs.len(), 1),
        other => panic!("expected run history, got {other:?}"),
    }
}
