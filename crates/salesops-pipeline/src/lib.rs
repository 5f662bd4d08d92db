pub mod change_detector;
pub mod config;
pub mod drift_monitor;
pub mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod registry;
pub mod run_gate;
pub mod service;
pub mod trainer;

use salesops_storage::PipelineStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use change_detector::{ChangeDetector, ChangeSignal};
pub use config::PipelineConfig;
pub use drift_monitor::DriftMonitor;
pub use error::{ErrorClass, PipelineError};
pub use evaluator::{EvaluationOutcome, PromotionEvaluator};
pub use orchestrator::{CancellationToken, PipelineOrchestrator, RunFailure, RunReport, TriggerOutcome};
pub use registry::ModelRegistry;
pub use run_gate::{RunGate, RunPermit};
pub use service::{
    HistoryKind, HistoryPage, LoadReport, OperationResult, OperationStatus, PipelineService,
    StatusSnapshot,
};
pub use trainer::{CommandTrainer, RollingMeanTrainer, Trainer, TrainerError};

/// The one persistence handle every component is constructed with.
pub type SharedStore = Arc<Mutex<PipelineStore>>;

pub fn shared_store(store: PipelineStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// A panic while holding the lock cannot leave SQLite half-written, so a
/// poisoned guard is still usable.
pub(crate) fn lock_store(store: &SharedStore) -> MutexGuard<'_, PipelineStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}
