use crate::{lock_store, PipelineError, SharedStore};
use chrono::{DateTime, Utc};
use salesops_core::{ComparisonDecision, ComparisonLogEntry, ModelRecord, TrainingOutcome};
use tracing::info;

/// Lifecycle operations over the model lineage. PRODUCTION is reachable
/// only through `apply_evaluation`.
#[derive(Clone)]
pub struct ModelRegistry {
    store: SharedStore,
}

impl ModelRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn register(
        &self,
        outcome: &TrainingOutcome,
        trained_at: DateTime<Utc>,
    ) -> Result<ModelRecord, PipelineError> {
        outcome.metrics().validate()?;
        let record = ModelRecord::candidate(outcome, trained_at);
        lock_store(&self.store).insert_candidate(&record)?;
        info!(
            event = "candidate_registered",
            version = %record.version,
            model_type = %record.model_type,
            mae = record.metrics.mae,
            training_records = record.training_record_count,
        );
        Ok(record)
    }

    /// Applies a comparison decision and its log entry atomically. Returns
    /// the former PRODUCTION version archived by a promotion.
    pub fn apply_evaluation(
        &self,
        entry: &ComparisonLogEntry,
        superseded: &[String],
    ) -> Result<Option<String>, PipelineError> {
        let archived = lock_store(&self.store).record_evaluation(entry, superseded)?;
        let candidate = entry.candidate_version.as_deref().unwrap_or("none");
        for version in superseded {
            info!(event = "candidate_archived", version = %version, reason = "superseded", by = candidate);
        }
        match entry.decision {
            ComparisonDecision::Promote => info!(
                event = "model_promoted",
                version = candidate,
                archived = archived.as_deref().unwrap_or("none"),
            ),
            ComparisonDecision::KeepCurrent => {
                info!(event = "candidate_archived", version = candidate, reason = %entry.reason)
            }
            _ => {}
        }
        Ok(archived)
    }

    pub fn production(&self) -> Result<Option<ModelRecord>, PipelineError> {
        Ok(lock_store(&self.store).production_model()?)
    }

    /// Candidates, most recently trained first. Only the head is pending.
    pub fn candidates(&self) -> Result<Vec<ModelRecord>, PipelineError> {
        Ok(lock_store(&self.store).candidates()?)
    }

    pub fn pending_candidate(&self) -> Result<Option<ModelRecord>, PipelineError> {
        Ok(lock_store(&self.store).latest_candidate()?)
    }
}
