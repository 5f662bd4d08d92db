use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use salesops_core::{
    ComparisonDecision, ComparisonLogEntry, ContractError, DriftMetric, DriftStatus, FeatureRow,
    ModelMetrics, ModelRecord, ModelStatus, Observation, PipelineRun, RunPhase, RunStatus,
    TriggerKind, TriggerLogEntry, RAW_SALES_STREAM,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PIPELINE_SCHEMA_VERSION: i64 = 1;

const HALT_KEY: &str = "halted";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("unknown stream: {0}")]
    UnknownStream(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model already registered: {0}")]
    DuplicateModel(String),
    #[error("invalid transition for {version}: {from} -> {to}")]
    InvalidTransition {
        version: String,
        from: ModelStatus,
        to: ModelStatus,
    },
    #[error("registry invariant violated: {0}")]
    RegistryInvariant(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamWatermark {
    pub stream: String,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReport {
    pub appended: usize,
    pub head: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltState {
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Single-connection handle over the pipeline database. Every multi-row
/// mutation runs in one transaction so readers never observe a half-applied
/// change.
pub struct PipelineStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl PipelineStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock file every process sharing this database serializes runs on:
    /// `<db file>.lock` next to the database. In-memory stores have none.
    pub fn run_lock_path(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        let mut name = path.file_name()?.to_os_string();
        name.push(".lock");
        Some(path.with_file_name(name))
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > PIPELINE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: PIPELINE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_pipeline_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    // raw observation log

    pub fn append_observations(
        &self,
        observations: &[Observation],
        loaded_at: DateTime<Utc>,
    ) -> Result<AppendReport, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO raw_sales (brand, state, period, value, source_batch, loaded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;
            let loaded_at = format_ts(loaded_at);
            for observation in observations {
                stmt.execute(params![
                    observation.brand.trim(),
                    observation.state.trim(),
                    observation.period.trim(),
                    observation.value,
                    observation.source_batch,
                    loaded_at,
                ])?;
            }
        }
        tx.commit()?;

        Ok(AppendReport {
            appended: observations.len(),
            head: self.stream_head(RAW_SALES_STREAM)?,
        })
    }

    /// Observations up to and including `position`, in log order.
    pub fn observations_through(&self, position: i64) -> Result<Vec<Observation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT brand, state, period, value, source_batch
            FROM raw_sales
            WHERE position <= ?1
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([position], |row| {
            Ok(Observation {
                brand: row.get(0)?,
                state: row.get(1)?,
                period: row.get(2)?,
                value: row.get(3)?,
                source_batch: row.get(4)?,
            })
        })?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        Ok(observations)
    }

    pub fn raw_record_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM raw_sales", [], |row| row.get(0))?)
    }

    /// Highest position appended to the stream, 0 when empty.
    pub fn stream_head(&self, stream: &str) -> Result<i64, StorageError> {
        if stream != RAW_SALES_STREAM {
            return Err(StorageError::UnknownStream(stream.to_string()));
        }
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(position), 0) FROM raw_sales",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn watermark(&self, stream: &str) -> Result<Option<StreamWatermark>, StorageError> {
        let watermark = self
            .conn
            .query_row(
                "
                SELECT stream, position, updated_at
                FROM pipeline_watermarks
                WHERE stream = ?1
                ",
                [stream],
                |row| {
                    Ok(StreamWatermark {
                        stream: row.get(0)?,
                        position: row.get(1)?,
                        updated_at: ts_column(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(watermark)
    }

    pub fn acknowledge_watermark(
        &self,
        stream: &str,
        position: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        upsert_watermark(&self.conn, stream, position, at)
    }

    // feature table

    pub fn replace_features(
        &self,
        rows: &[FeatureRow],
        generated_at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM feature_store", [])?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO feature_store (
                    brand,
                    state,
                    period_date,
                    year,
                    month,
                    quarter,
                    y,
                    lag_1,
                    lag_2,
                    lag_3,
                    rolling_avg_3,
                    observation_count,
                    generated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
            )?;
            let generated_at = format_ts(generated_at);
            for row in rows {
                stmt.execute(params![
                    row.brand,
                    row.state,
                    row.period_date.format("%Y-%m-%d").to_string(),
                    row.year,
                    row.month,
                    row.quarter,
                    row.y,
                    row.lag_1,
                    row.lag_2,
                    row.lag_3,
                    row.rolling_avg_3,
                    row.observation_count,
                    generated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn features(&self) -> Result<Vec<FeatureRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT brand, state, period_date, year, month, quarter, y,
                   lag_1, lag_2, lag_3, rolling_avg_3, observation_count
            FROM feature_store
            ORDER BY brand ASC, state ASC, period_date ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            let period_date: String = row.get(2)?;
            let period_date = NaiveDate::parse_from_str(&period_date, "%Y-%m-%d")
                .map_err(|err| conversion_error(2, err))?;
            Ok(FeatureRow {
                brand: row.get(0)?,
                state: row.get(1)?,
                period_date,
                year: row.get(3)?,
                month: row.get(4)?,
                quarter: row.get(5)?,
                y: row.get(6)?,
                lag_1: row.get(7)?,
                lag_2: row.get(8)?,
                lag_3: row.get(9)?,
                rolling_avg_3: row.get(10)?,
                observation_count: row.get(11)?,
            })
        })?;

        let mut features = Vec::new();
        for row in rows {
            features.push(row?);
        }
        Ok(features)
    }

    pub fn feature_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM feature_store", [], |row| row.get(0))?)
    }

    // model registry

    pub fn insert_candidate(&self, record: &ModelRecord) -> Result<(), StorageError> {
        if record.status != ModelStatus::Candidate {
            return Err(StorageError::InvalidTransition {
                version: record.version.clone(),
                from: record.status,
                to: ModelStatus::Candidate,
            });
        }
        if self.model(&record.version)?.is_some() {
            return Err(StorageError::DuplicateModel(record.version.clone()));
        }

        self.conn.execute(
            "
            INSERT INTO model_registry (
                version,
                model_type,
                status,
                trained_at,
                promoted_at,
                mae,
                rmse,
                mape,
                training_record_count,
                notes
            ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                record.version,
                record.model_type,
                record.status.as_str(),
                format_ts(record.trained_at),
                record.metrics.mae,
                record.metrics.rmse,
                record.metrics.mape,
                record.training_record_count as i64,
                record.notes,
            ],
        )?;
        Ok(())
    }

    pub fn model(&self, version: &str) -> Result<Option<ModelRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("{MODEL_SELECT} WHERE version = ?1"),
                [version],
                model_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn production_model(&self) -> Result<Option<ModelRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{MODEL_SELECT} WHERE status = 'PRODUCTION' ORDER BY trained_at DESC, rowid DESC"
        ))?;
        let mut records = Vec::new();
        for row in stmt.query_map([], model_from_row)? {
            records.push(row?);
        }
        if records.len() > 1 {
            return Err(StorageError::RegistryInvariant(format!(
                "{} records hold PRODUCTION",
                records.len()
            )));
        }
        Ok(records.pop())
    }

    /// Candidates, most recently trained first.
    pub fn candidates(&self) -> Result<Vec<ModelRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{MODEL_SELECT} WHERE status = 'CANDIDATE' ORDER BY trained_at DESC, rowid DESC"
        ))?;
        let mut records = Vec::new();
        for row in stmt.query_map([], model_from_row)? {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn latest_candidate(&self) -> Result<Option<ModelRecord>, StorageError> {
        Ok(self.candidates()?.into_iter().next())
    }

    /// Model history, most recently trained first.
    pub fn models(&self, limit: usize) -> Result<Vec<ModelRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{MODEL_SELECT} ORDER BY trained_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let mut records = Vec::new();
        for row in stmt.query_map([limit as i64], model_from_row)? {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count_models_with_status(&self, status: ModelStatus) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM model_registry WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Moves `version` to PRODUCTION and archives whatever held it, in one
    /// transaction. Returns the version that was archived, if any.
    pub fn promote_model(
        &self,
        version: &str,
        at: DateTime<Utc>,
        note: &str,
    ) -> Result<Option<String>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let previous = promote_in(&tx, version, at, note)?;
        tx.commit()?;
        Ok(previous)
    }

    /// Rejects a candidate. Only CANDIDATE records may be archived directly.
    pub fn archive_model(&self, version: &str, reason: &str) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        archive_in(&tx, version, reason)?;
        tx.commit()?;
        Ok(())
    }

    /// Applies an evaluation and logs it in one transaction: `superseded`
    /// candidates are archived, the logged candidate is promoted on PROMOTE
    /// and archived on KEEP_CURRENT. Other decisions only append the log
    /// row. Returns the former PRODUCTION version archived by a promotion.
    pub fn record_evaluation(
        &self,
        entry: &ComparisonLogEntry,
        superseded: &[String],
    ) -> Result<Option<String>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let candidate = entry.candidate_version.as_deref();

        if let Some(candidate) = candidate {
            let note = format!("superseded by {candidate}");
            for version in superseded {
                archive_in(&tx, version, &note)?;
            }
        }

        let archived = match (entry.decision, candidate) {
            (ComparisonDecision::Promote, Some(candidate)) => {
                promote_in(&tx, candidate, entry.compared_at, &entry.reason)?
            }
            (ComparisonDecision::KeepCurrent, Some(candidate)) => {
                archive_in(&tx, candidate, &entry.reason)?;
                None
            }
            (ComparisonDecision::Promote | ComparisonDecision::KeepCurrent, None) => {
                return Err(StorageError::RegistryInvariant(format!(
                    "{} decision without a candidate",
                    entry.decision
                )));
            }
            _ => None,
        };

        insert_comparison(&tx, entry)?;
        tx.commit()?;
        Ok(archived)
    }

    // comparison log

    pub fn append_comparison(&self, entry: &ComparisonLogEntry) -> Result<(), StorageError> {
        insert_comparison(&self.conn, entry)
    }

    /// Comparison history, newest first.
    pub fn comparisons(&self, limit: usize) -> Result<Vec<ComparisonLogEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT compared_at, production_version, candidate_version, production_mae,
                   candidate_mae, improvement_pct, decision, reason
            FROM model_comparison_log
            ORDER BY comparison_id DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let decision: String = row.get(6)?;
            Ok(ComparisonLogEntry {
                compared_at: ts_column(row, 0)?,
                production_version: row.get(1)?,
                candidate_version: row.get(2)?,
                production_mae: row.get(3)?,
                candidate_mae: row.get(4)?,
                improvement_pct: row.get(5)?,
                decision: decision
                    .parse::<ComparisonDecision>()
                    .map_err(|err| conversion_error(6, err))?,
                reason: row.get(7)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // drift metrics

    pub fn append_drift_metric(&self, metric: &DriftMetric) -> Result<(), StorageError> {
        insert_drift_metric(&self.conn, metric)
    }

    /// Appends a whole check at once so a report is never half persisted.
    pub fn append_drift_metrics(&self, metrics: &[DriftMetric]) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        for metric in metrics {
            insert_drift_metric(&tx, metric)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn latest_drift_metric(
        &self,
        metric_name: &str,
    ) -> Result<Option<DriftMetric>, StorageError> {
        let metric = self
            .conn
            .query_row(
                &format!("{DRIFT_SELECT} WHERE metric_name = ?1 ORDER BY drift_id DESC LIMIT 1"),
                [metric_name],
                drift_from_row,
            )
            .optional()?;
        Ok(metric)
    }

    /// Drift history, newest first.
    pub fn drift_metrics(&self, limit: usize) -> Result<Vec<DriftMetric>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{DRIFT_SELECT} ORDER BY drift_id DESC LIMIT ?1"))?;
        let mut metrics = Vec::new();
        for row in stmt.query_map([limit as i64], drift_from_row)? {
            metrics.push(row?);
        }
        Ok(metrics)
    }

    // run audit trail

    pub fn trigger_log(&self, limit: usize) -> Result<Vec<TriggerLogEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT logged_at, run_id, trigger_kind, new_rows, from_position, to_position
            FROM pipeline_trigger_log
            ORDER BY log_id DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let kind: String = row.get(2)?;
            Ok(TriggerLogEntry {
                logged_at: ts_column(row, 0)?,
                run_id: row.get(1)?,
                trigger_kind: kind
                    .parse::<TriggerKind>()
                    .map_err(|err| conversion_error(2, err))?,
                new_rows: row.get::<_, i64>(3)? as u64,
                from_position: row.get(4)?,
                to_position: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Writes the run row together with its trigger log entry and, when
    /// given, advances the stream watermark, all in one transaction.
    pub fn complete_run(
        &self,
        run: &PipelineRun,
        trigger: Option<&TriggerLogEntry>,
        acknowledge: Option<(&str, i64)>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(entry) = trigger {
            insert_trigger_log(&tx, entry)?;
        }
        tx.execute(
            "
            INSERT INTO pipeline_runs (
                run_id,
                phase,
                status,
                records_processed,
                started_at,
                finished_at,
                trigger_position,
                feature_fingerprint,
                message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                run.run_id,
                run.phase.as_str(),
                run.status.as_str(),
                run.records_processed as i64,
                format_ts(run.started_at),
                format_ts(run.finished_at),
                run.trigger_position,
                run.feature_fingerprint,
                run.message,
            ],
        )?;
        if let Some((stream, position)) = acknowledge {
            upsert_watermark(&tx, stream, position, run.finished_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Run history, newest first.
    pub fn pipeline_runs(&self, limit: usize) -> Result<Vec<PipelineRun>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT run_id, phase, status, records_processed, started_at, finished_at,
                   trigger_position, feature_fingerprint, message
            FROM pipeline_runs
            ORDER BY run_seq DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let phase: String = row.get(1)?;
            let status: String = row.get(2)?;
            Ok(PipelineRun {
                run_id: row.get(0)?,
                phase: phase
                    .parse::<RunPhase>()
                    .map_err(|err| conversion_error(1, err))?,
                status: status
                    .parse::<RunStatus>()
                    .map_err(|err| conversion_error(2, err))?,
                records_processed: row.get::<_, i64>(3)? as u64,
                started_at: ts_column(row, 4)?,
                finished_at: ts_column(row, 5)?,
                trigger_position: row.get(6)?,
                feature_fingerprint: row.get(7)?,
                message: row.get(8)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn latest_run(&self) -> Result<Option<PipelineRun>, StorageError> {
        Ok(self.pipeline_runs(1)?.into_iter().next())
    }

    // operator control

    pub fn halt_state(&self) -> Result<Option<HaltState>, StorageError> {
        let state = self
            .conn
            .query_row(
                "SELECT value, updated_at FROM pipeline_control WHERE key = ?1",
                [HALT_KEY],
                |row| {
                    Ok(HaltState {
                        reason: row.get(0)?,
                        since: ts_column(row, 1)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn set_halt(&self, reason: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO pipeline_control (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![HALT_KEY, reason, format_ts(at)],
        )?;
        Ok(())
    }

    pub fn clear_halt(&self) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM pipeline_control WHERE key = ?1", [HALT_KEY])?;
        Ok(changes > 0)
    }
}

const MODEL_SELECT: &str = "
    SELECT version, model_type, status, trained_at, promoted_at, mae, rmse, mape,
           training_record_count, notes
    FROM model_registry
";

const DRIFT_SELECT: &str = "
    SELECT metric_name, checked_at, baseline_value, current_value, drift_score, status
    FROM drift_metrics
";

/// Appends `?1` to the notes column, separated from earlier notes.
const NOTES_APPEND: &str =
    "notes = CASE WHEN notes IS NULL OR notes = '' THEN ?1 ELSE notes || '; ' || ?1 END";

fn model_status(conn: &Connection, version: &str) -> Result<ModelStatus, StorageError> {
    let status = conn
        .query_row(
            "SELECT status FROM model_registry WHERE version = ?1",
            [version],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::ModelNotFound(version.to_string()))?;
    Ok(status.parse::<ModelStatus>()?)
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let status: String = row.get(2)?;
    let promoted_at: Option<String> = row.get(4)?;
    let promoted_at = promoted_at
        .map(|value| parse_timestamp(&value).map_err(|err| conversion_error(4, err)))
        .transpose()?;

    Ok(ModelRecord {
        version: row.get(0)?,
        model_type: row.get(1)?,
        status: status
            .parse::<ModelStatus>()
            .map_err(|err| conversion_error(2, err))?,
        trained_at: ts_column(row, 3)?,
        promoted_at,
        metrics: ModelMetrics {
            mae: row.get(5)?,
            rmse: row.get(6)?,
            mape: row.get(7)?,
        },
        training_record_count: row.get::<_, i64>(8)? as u64,
        notes: row.get(9)?,
    })
}

fn drift_from_row(row: &Row<'_>) -> rusqlite::Result<DriftMetric> {
    let status: String = row.get(5)?;
    Ok(DriftMetric {
        metric_name: row.get(0)?,
        checked_at: ts_column(row, 1)?,
        baseline_value: row.get(2)?,
        current_value: row.get(3)?,
        drift_score: row.get(4)?,
        status: status
            .parse::<DriftStatus>()
            .map_err(|err| conversion_error(5, err))?,
    })
}

fn promote_in(
    conn: &Connection,
    version: &str,
    at: DateTime<Utc>,
    note: &str,
) -> Result<Option<String>, StorageError> {
    let current = model_status(conn, version)?;
    if !current.can_transition_to(ModelStatus::Production) {
        return Err(StorageError::InvalidTransition {
            version: version.to_string(),
            from: current,
            to: ModelStatus::Production,
        });
    }

    let previous = conn
        .query_row(
            "SELECT version FROM model_registry WHERE status = 'PRODUCTION'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    conn.execute(
        &format!("UPDATE model_registry SET status = 'ARCHIVED', {NOTES_APPEND} WHERE status = 'PRODUCTION'"),
        params![format!("replaced by {version}")],
    )?;
    conn.execute(
        &format!(
            "UPDATE model_registry SET status = 'PRODUCTION', promoted_at = ?2, {NOTES_APPEND} WHERE version = ?3"
        ),
        params![note, format_ts(at), version],
    )?;

    let production_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM model_registry WHERE status = 'PRODUCTION'",
        [],
        |row| row.get(0),
    )?;
    if production_count != 1 {
        return Err(StorageError::RegistryInvariant(format!(
            "{production_count} records hold PRODUCTION after promoting {version}"
        )));
    }
    Ok(previous)
}

fn archive_in(conn: &Connection, version: &str, reason: &str) -> Result<(), StorageError> {
    let current = model_status(conn, version)?;
    if current != ModelStatus::Candidate {
        return Err(StorageError::InvalidTransition {
            version: version.to_string(),
            from: current,
            to: ModelStatus::Archived,
        });
    }
    conn.execute(
        &format!("UPDATE model_registry SET status = 'ARCHIVED', {NOTES_APPEND} WHERE version = ?2"),
        params![reason, version],
    )?;
    Ok(())
}

fn insert_comparison(conn: &Connection, entry: &ComparisonLogEntry) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO model_comparison_log (
            compared_at,
            production_version,
            candidate_version,
            production_mae,
            candidate_mae,
            improvement_pct,
            decision,
            reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ",
        params![
            format_ts(entry.compared_at),
            entry.production_version,
            entry.candidate_version,
            entry.production_mae,
            entry.candidate_mae,
            entry.improvement_pct,
            entry.decision.as_str(),
            entry.reason,
        ],
    )?;
    Ok(())
}

fn insert_trigger_log(conn: &Connection, entry: &TriggerLogEntry) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO pipeline_trigger_log (
            logged_at,
            run_id,
            trigger_kind,
            new_rows,
            from_position,
            to_position
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            format_ts(entry.logged_at),
            entry.run_id,
            entry.trigger_kind.as_str(),
            entry.new_rows as i64,
            entry.from_position,
            entry.to_position,
        ],
    )?;
    Ok(())
}

fn insert_drift_metric(conn: &Connection, metric: &DriftMetric) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO drift_metrics (
            metric_name,
            checked_at,
            baseline_value,
            current_value,
            drift_score,
            status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            metric.metric_name,
            format_ts(metric.checked_at),
            metric.baseline_value,
            metric.current_value,
            metric.drift_score,
            metric.status.as_str(),
        ],
    )?;
    Ok(())
}

/// Watermarks only move forward.
fn upsert_watermark(
    conn: &Connection,
    stream: &str,
    position: i64,
    at: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO pipeline_watermarks (stream, position, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(stream) DO UPDATE SET
            position=MAX(position, excluded.position),
            updated_at=excluded.updated_at
        ",
        params![stream, position, format_ts(at)],
    )?;
    Ok(())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value).map_err(|err| conversion_error(idx, err))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use salesops_core::{derive_features, TrainingOutcome};
    use tempfile::NamedTempFile;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(offset_secs)
    }

    fn candidate(version: &str, mae: f64, trained_at: DateTime<Utc>) -> ModelRecord {
        ModelRecord::candidate(
            &TrainingOutcome {
                version: version.to_string(),
                model_type: "rolling_mean".to_string(),
                mae,
                rmse: mae * 1.3,
                mape: 12.0,
                training_record_count: 40,
            },
            trained_at,
        )
    }

    fn sample_observations() -> Vec<Observation> {
        (1..=6)
            .map(|month| {
                Observation::new(
                    "acme",
                    "CA",
                    format!("2023-{month:02}"),
                    month as f64 * 10.0,
                    "batch-1",
                )
            })
            .collect()
    }

    #[test]
    fn migration_creates_pipeline_tables() {
        let db = PipelineStore::open_in_memory().expect("open db");

        for table in [
            "raw_sales",
            "feature_store",
            "model_registry",
            "model_comparison_log",
            "drift_metrics",
            "pipeline_runs",
            "pipeline_trigger_log",
            "pipeline_watermarks",
            "pipeline_control",
        ] {
            assert!(db.table_exists(table).expect("table check"), "{table}");
        }

        assert_eq!(
            db.schema_version().expect("schema version"),
            PIPELINE_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_store_keeps_rows_and_schema() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let db = PipelineStore::open(file.path()).expect("open db");
            db.append_observations(&sample_observations(), ts(0))
                .expect("append");
        }
        let db = PipelineStore::open(file.path()).expect("reopen db");
        assert_eq!(db.raw_record_count().expect("count"), 6);
        assert_eq!(db.schema_version().expect("version"), PIPELINE_SCHEMA_VERSION);
    }

    #[test]
    fn stream_head_and_watermark_track_positions() {
        let db = PipelineStore::open_in_memory().expect("open db");
        assert_eq!(db.stream_head(RAW_SALES_STREAM).expect("head"), 0);
        assert!(db.watermark(RAW_SALES_STREAM).expect("watermark").is_none());

        let report = db
            .append_observations(&sample_observations(), ts(0))
            .expect("append");
        assert_eq!(report.appended, 6);
        assert_eq!(report.head, 6);

        db.acknowledge_watermark(RAW_SALES_STREAM, 6, ts(1))
            .expect("ack");
        db.acknowledge_watermark(RAW_SALES_STREAM, 2, ts(2))
            .expect("stale ack");
        let watermark = db
            .watermark(RAW_SALES_STREAM)
            .expect("watermark")
            .expect("present");
        assert_eq!(watermark.position, 6);

        assert!(matches!(
            db.stream_head("orders"),
            Err(StorageError::UnknownStream(_))
        ));
    }

    #[test]
    fn observations_through_respects_position() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.append_observations(&sample_observations(), ts(0))
            .expect("append");
        let first_four = db.observations_through(4).expect("observations");
        assert_eq!(first_four.len(), 4);
        assert_eq!(first_four[3].period, "2023-04");
    }

    #[test]
    fn feature_store_is_replaced_in_full() {
        let db = PipelineStore::open_in_memory().expect("open db");
        let derivation = derive_features(&sample_observations());
        assert_eq!(
            db.replace_features(&derivation.rows, ts(0)).expect("replace"),
            3
        );
        let shorter = derive_features(&sample_observations()[..4]);
        db.replace_features(&shorter.rows, ts(1)).expect("replace");

        let stored = db.features().expect("features");
        assert_eq!(stored, shorter.rows);
        assert_eq!(db.feature_count().expect("count"), 1);
    }

    #[test]
    fn promote_archives_previous_production_atomically() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert v1");
        db.insert_candidate(&candidate("v2", 80.0, ts(10)))
            .expect("insert v2");

        assert_eq!(db.promote_model("v1", ts(1), "first model").expect("promote v1"), None);
        assert_eq!(
            db.promote_model("v2", ts(11), "better").expect("promote v2"),
            Some("v1".to_string())
        );

        let v1 = db.model("v1").expect("query").expect("v1");
        let v2 = db.model("v2").expect("query").expect("v2");
        assert_eq!(v1.status, ModelStatus::Archived);
        assert_eq!(v1.notes.as_deref(), Some("first model; replaced by v2"));
        assert_eq!(v2.status, ModelStatus::Production);
        assert_eq!(v2.promoted_at, Some(ts(11)));
        assert_eq!(
            db.count_models_with_status(ModelStatus::Production)
                .expect("count"),
            1
        );
        assert_eq!(
            db.production_model().expect("production").map(|m| m.version),
            Some("v2".to_string())
        );
    }

    #[test]
    fn invalid_transitions_are_rejected_without_side_effects() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert");
        db.archive_model("v1", "rejected").expect("archive");

        assert!(matches!(
            db.promote_model("v1", ts(1), "retry"),
            Err(StorageError::InvalidTransition { .. })
        ));
        assert!(matches!(
            db.archive_model("v1", "again"),
            Err(StorageError::InvalidTransition { .. })
        ));
        assert!(matches!(
            db.promote_model("missing", ts(1), "nope"),
            Err(StorageError::ModelNotFound(_))
        ));
        assert!(db.production_model().expect("production").is_none());
    }

    #[test]
    fn production_cannot_be_archived_directly() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert");
        db.promote_model("v1", ts(1), "first model").expect("promote");
        assert!(matches!(
            db.archive_model("v1", "manual"),
            Err(StorageError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn database_rejects_a_second_production_row() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert v1");
        db.insert_candidate(&candidate("v2", 90.0, ts(1)))
            .expect("insert v2");
        db.promote_model("v1", ts(2), "first model").expect("promote");

        let direct = db.conn.execute(
            "UPDATE model_registry SET status = 'PRODUCTION' WHERE version = 'v2'",
            [],
        );
        assert!(direct.is_err());
    }

    #[test]
    fn duplicate_candidates_are_rejected() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert");
        assert!(matches!(
            db.insert_candidate(&candidate("v1", 90.0, ts(1))),
            Err(StorageError::DuplicateModel(_))
        ));
    }

    #[test]
    fn candidates_are_ordered_by_training_time() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v-late", 90.0, ts(20)))
            .expect("insert");
        db.insert_candidate(&candidate("v-early", 95.0, ts(5)))
            .expect("insert");

        let latest = db.latest_candidate().expect("latest").expect("candidate");
        assert_eq!(latest.version, "v-late");
        let versions = db
            .models(10)
            .expect("models")
            .into_iter()
            .map(|m| m.version)
            .collect::<Vec<_>>();
        assert_eq!(versions, vec!["v-late".to_string(), "v-early".to_string()]);
    }

    #[test]
    fn complete_run_writes_row_and_watermark_together() {
        let db = PipelineStore::open_in_memory().expect("open db");
        let run = PipelineRun {
            run_id: "run-1".to_string(),
            phase: RunPhase::Done,
            status: RunStatus::Success,
            records_processed: 12,
            started_at: ts(0),
            finished_at: ts(3),
            trigger_position: 42,
            feature_fingerprint: Some("abc".to_string()),
            message: "ok".to_string(),
        };
        let trigger = TriggerLogEntry {
            logged_at: ts(0),
            run_id: "run-1".to_string(),
            trigger_kind: TriggerKind::Stream,
            new_rows: 12,
            from_position: 30,
            to_position: 42,
        };
        assert!(db.trigger_log(10).expect("trigger log").is_empty());
        db.complete_run(&run, Some(&trigger), Some((RAW_SALES_STREAM, 42)))
            .expect("complete");

        assert_eq!(db.latest_run().expect("latest"), Some(run));
        assert_eq!(db.trigger_log(10).expect("trigger log"), vec![trigger]);
        assert_eq!(
            db.watermark(RAW_SALES_STREAM)
                .expect("watermark")
                .map(|w| w.position),
            Some(42)
        );
    }

    #[test]
    fn failed_completion_leaves_no_trigger_row() {
        let db = PipelineStore::open_in_memory().expect("open db");
        let run = PipelineRun {
            run_id: "run-1".to_string(),
            phase: RunPhase::Done,
            status: RunStatus::Success,
            records_processed: 1,
            started_at: ts(0),
            finished_at: ts(1),
            trigger_position: 1,
            feature_fingerprint: None,
            message: "ok".to_string(),
        };
        db.complete_run(&run, None, None).expect("first");
        let trigger = TriggerLogEntry {
            logged_at: ts(2),
            run_id: "run-1".to_string(),
            trigger_kind: TriggerKind::Stream,
            new_rows: 1,
            from_position: 0,
            to_position: 1,
        };
        assert!(db.complete_run(&run, Some(&trigger), None).is_err());
        assert!(db.trigger_log(10).expect("trigger log").is_empty());
    }

    fn evaluation(
        decision: ComparisonDecision,
        candidate: Option<&str>,
        production: Option<&str>,
    ) -> ComparisonLogEntry {
        ComparisonLogEntry {
            compared_at: ts(30),
            production_version: production.map(str::to_string),
            candidate_version: candidate.map(str::to_string),
            production_mae: production.map(|_| 100.0),
            candidate_mae: candidate.map(|_| 80.0),
            improvement_pct: Some(20.0),
            decision,
            reason: "improvement 20.00% >= threshold 5.00%".to_string(),
        }
    }

    #[test]
    fn evaluation_updates_registry_and_log_together() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert v1");
        db.promote_model("v1", ts(1), "first model").expect("promote v1");
        db.insert_candidate(&candidate("v2", 90.0, ts(10)))
            .expect("insert v2");
        db.insert_candidate(&candidate("v3", 80.0, ts(20)))
            .expect("insert v3");

        let archived = db
            .record_evaluation(
                &evaluation(ComparisonDecision::Promote, Some("v3"), Some("v1")),
                &["v2".to_string()],
            )
            .expect("record");
        assert_eq!(archived, Some("v1".to_string()));

        let v2 = db.model("v2").expect("query").expect("v2");
        assert_eq!(v2.status, ModelStatus::Archived);
        assert_eq!(v2.notes.as_deref(), Some("superseded by v3"));
        assert_eq!(
            db.production_model().expect("production").map(|m| m.version),
            Some("v3".to_string())
        );
        let comparisons = db.comparisons(10).expect("comparisons");
        assert_eq!(comparisons.len(), 1);
        assert_eq!(comparisons[0].decision, ComparisonDecision::Promote);
        assert_eq!(comparisons[0].candidate_version.as_deref(), Some("v3"));
    }

    #[test]
    fn rejected_evaluation_rolls_back_registry_and_log() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert v1");
        db.insert_candidate(&candidate("v2", 90.0, ts(10)))
            .expect("insert v2");
        db.archive_model("v1", "rejected").expect("archive v1");

        // v1 is already archived, so retiring it again must undo the whole call
        assert!(matches!(
            db.record_evaluation(
                &evaluation(ComparisonDecision::KeepCurrent, Some("v2"), None),
                &["v1".to_string()],
            ),
            Err(StorageError::InvalidTransition { .. })
        ));
        assert!(db.comparisons(10).expect("comparisons").is_empty());
        assert_eq!(
            db.latest_candidate().expect("latest").map(|m| m.version),
            Some("v2".to_string())
        );

        db.record_evaluation(
            &evaluation(ComparisonDecision::NoCandidate, None, None),
            &[],
        )
        .expect("log only");
        assert_eq!(db.comparisons(10).expect("comparisons").len(), 1);
        assert_eq!(
            db.latest_candidate().expect("latest").map(|m| m.version),
            Some("v2".to_string())
        );
    }

    #[test]
    fn promotion_is_undone_when_its_log_entry_cannot_be_written() {
        let db = PipelineStore::open_in_memory().expect("open db");
        db.insert_candidate(&candidate("v1", 100.0, ts(0)))
            .expect("insert v1");
        db.promote_model("v1", ts(1), "first model").expect("promote v1");
        db.insert_candidate(&candidate("v2", 80.0, ts(10)))
            .expect("insert v2");
        db.conn
            .execute_batch(
                "CREATE TRIGGER refuse_log BEFORE INSERT ON model_comparison_log
                 BEGIN SELECT RAISE(ABORT, 'log unavailable'); END;",
            )
            .expect("install trigger");

        assert!(db
            .record_evaluation(
                &evaluation(ComparisonDecision::Promote, Some("v2"), Some("v1")),
                &[],
            )
            .is_err());
        assert_eq!(
            db.production_model().expect("production").map(|m| m.version),
            Some("v1".to_string())
        );
        assert_eq!(
            db.model("v2").expect("query").map(|m| m.status),
            Some(ModelStatus::Candidate)
        );
    }

    #[test]
    fn run_lock_sits_next_to_the_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = PipelineStore::open(dir.path().join("pipeline.db")).expect("open db");
        assert_eq!(db.run_lock_path(), Some(dir.path().join("pipeline.db.lock")));
        assert!(PipelineStore::open_in_memory()
            .expect("open db")
            .run_lock_path()
            .is_none());
    }

    #[test]
    fn drift_and_comparison_history_are_newest_first() {
        let db = PipelineStore::open_in_memory().expect("open db");
        for (idx, status) in [DriftStatus::Baseline, DriftStatus::Warning]
            .into_iter()
            .enumerate()
        {
            db.append_drift_metric(&DriftMetric {
                metric_name: "Y_MEAN".to_string(),
                checked_at: ts(idx as i64),
                baseline_value: 100.0,
                current_value: 112.0,
                drift_score: Some(12.0),
                status,
            })
            .expect("append drift");
        }
        let latest = db
            .latest_drift_metric("Y_MEAN")
            .expect("latest")
            .expect("present");
        assert_eq!(latest.status, DriftStatus::Warning);
        assert!(db.latest_drift_metric("Y_STD").expect("latest").is_none());

        db.append_comparison(&ComparisonLogEntry {
            compared_at: ts(5),
            production_version: None,
            candidate_version: None,
            production_mae: None,
            candidate_mae: None,
            improvement_pct: None,
            decision: ComparisonDecision::NoCandidate,
            reason: "no candidate pending".to_string(),
        })
        .expect("append comparison");
        let comparisons = db.comparisons(10).expect("comparisons");
        assert_eq!(comparisons.len(), 1);
        assert_eq!(comparisons[0].decision, ComparisonDecision::NoCandidate);
    }

    #[test]
    fn halt_flag_roundtrip() {
        let db = PipelineStore::open_in_memory().expect("open db");
        assert!(db.halt_state().expect("state").is_none());
        db.set_halt("two production models", ts(0)).expect("halt");
        let state = db.halt_state().expect("state").expect("halted");
        assert_eq!(state.reason, "two production models");
        assert_eq!(state.since, ts(0));
        assert!(db.clear_halt().expect("clear"));
        assert!(!db.clear_halt().expect("clear again"));
    }
}
