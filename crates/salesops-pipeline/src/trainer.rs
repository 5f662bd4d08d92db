use crate::PipelineError;
use chrono::Utc;
use salesops_core::{FeatureRow, SeriesKey, TrainingOutcome};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Exit code an external trainer uses to report too few rows.
pub const INSUFFICIENT_DATA_EXIT_CODE: i32 = 3;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(25);
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrainerError {
    #[error("insufficient data: {rows} feature rows, {required} required")]
    InsufficientData { rows: usize, required: usize },
    #[error("trainer failed: {0}")]
    Failed(String),
    #[error("trainer stopped at its deadline")]
    DeadlineExceeded,
}

/// Opaque fit capability. Given the feature table it returns holdout metrics
/// for a newly trained model.
pub trait Trainer: Send + Sync {
    fn model_type(&self) -> &str;

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError>;

    /// Like `train`, for trainers able to abandon their work at `deadline`.
    fn train_until(
        &self,
        features: &[FeatureRow],
        _deadline: Instant,
    ) -> Result<TrainingOutcome, TrainerError> {
        self.train(features)
    }
}

/// Versions are `v` + training timestamp in milliseconds, bumped when two
/// trainings land in the same millisecond so versions stay monotonic.
pub fn next_model_version() -> String {
    static LAST_MS: AtomicI64 = AtomicI64::new(0);

    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    let mut last = LAST_MS.load(Ordering::SeqCst);
    loop {
        let next = now_ms.max(last + 1);
        match LAST_MS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                let stamp = chrono::DateTime::from_timestamp_millis(next).unwrap_or(now);
                return format!("v{}", stamp.format("%Y%m%d%H%M%S%3f"));
            }
            Err(observed) => last = observed,
        }
    }
}

/// Baseline forecaster: predicts each period as the mean of the three before
/// it. The latest period of every series is held out for scoring.
#[derive(Debug, Clone)]
pub struct RollingMeanTrainer {
    min_rows: usize,
}

impl RollingMeanTrainer {
    pub fn new(min_rows: usize) -> Self {
        Self { min_rows }
    }
}

impl Trainer for RollingMeanTrainer {
    fn model_type(&self) -> &str {
        "rolling_mean_3"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        if features.len() < self.min_rows {
            return Err(TrainerError::InsufficientData {
                rows: features.len(),
                required: self.min_rows,
            });
        }

        let mut holdout = BTreeMap::<SeriesKey, &FeatureRow>::new();
        for row in features {
            let latest = holdout.entry(row.series_key()).or_insert(row);
            if row.period_date > latest.period_date {
                *latest = row;
            }
        }

        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut pct_sum = 0.0;
        let mut pct_count = 0usize;
        for row in holdout.values() {
            let error = row.y - row.rolling_avg_3;
            abs_sum += error.abs();
            sq_sum += error * error;
            if row.y != 0.0 {
                pct_sum += (error / row.y).abs() * 100.0;
                pct_count += 1;
            }
        }

        let scored = holdout.len() as f64;
        Ok(TrainingOutcome {
            version: next_model_version(),
            model_type: self.model_type().to_string(),
            mae: abs_sum / scored,
            rmse: (sq_sum / scored).sqrt(),
            mape: if pct_count == 0 {
                0.0
            } else {
                pct_sum / pct_count as f64
            },
            training_record_count: (features.len() - holdout.len()) as u64,
        })
    }
}

/// Runs an external program through `bash -lc`. Feature rows go in as a JSON
/// array on stdin; a JSON `TrainingOutcome` is expected on stdout.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    cmdline: String,
    min_rows: usize,
}

impl CommandTrainer {
    pub fn new(cmdline: impl Into<String>, min_rows: usize) -> Self {
        Self {
            cmdline: cmdline.into(),
            min_rows,
        }
    }

    fn run(
        &self,
        features: &[FeatureRow],
        deadline: Option<Instant>,
    ) -> Result<TrainingOutcome, TrainerError> {
        let payload = serde_json::to_vec(features)
            .map_err(|err| TrainerError::Failed(format!("encode feature rows: {err}")))?;

        let mut command = Command::new("bash");
        command
            .arg("-lc")
            .arg(&self.cmdline)
            .env("SALESOPS_FEATURE_ROWS", features.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|err| TrainerError::Failed(format!("failed to spawn trainer: {err}")))?;

        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The trainer may exit without reading; a broken pipe is fine.
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        stop(&mut child);
                        warn!(event = "trainer_killed", pid = child.id(), command = %self.cmdline);
                        return Err(TrainerError::DeadlineExceeded);
                    }
                    thread::sleep(CHILD_POLL_INTERVAL);
                }
                Err(err) => {
                    stop(&mut child);
                    return Err(TrainerError::Failed(format!("trainer wait failed: {err}")));
                }
            }
        };
        let _ = writer.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default())
            .trim()
            .to_string();

        match status.code() {
            Some(0) => {
                let mut outcome: TrainingOutcome = serde_json::from_slice(&stdout)
                    .map_err(|err| TrainerError::Failed(format!("invalid trainer output: {err}")))?;
                if outcome.version.trim().is_empty() {
                    outcome.version = next_model_version();
                }
                Ok(outcome)
            }
            Some(INSUFFICIENT_DATA_EXIT_CODE) => Err(TrainerError::InsufficientData {
                rows: features.len(),
                required: self.min_rows,
            }),
            _ => Err(TrainerError::Failed(if stderr.is_empty() {
                format!("trainer exited with status {status}")
            } else {
                stderr
            })),
        }
    }
}

impl Trainer for CommandTrainer {
    fn model_type(&self) -> &str {
        "external"
    }

    fn train(&self, features: &[FeatureRow]) -> Result<TrainingOutcome, TrainerError> {
        self.run(features, None)
    }

    fn train_until(
        &self,
        features: &[FeatureRow],
        deadline: Instant,
    ) -> Result<TrainingOutcome, TrainerError> {
        self.run(features, Some(deadline))
    }
}

fn capture<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buffer);
        }
        buffer
    })
}

/// Kills the trainer's process group, then the child itself, and reaps it.
fn stop(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Runs the trainer on a worker thread and waits at most `timeout`. Trainers
/// that honour the deadline get a short grace period to stop their work; any
/// result that arrives after the deadline is dropped with the channel.
pub fn train_with_timeout(
    trainer: Arc<dyn Trainer>,
    features: Vec<FeatureRow>,
    timeout: Duration,
) -> Result<TrainingOutcome, PipelineError> {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(trainer.train_until(&features, deadline));
    });

    match rx.recv_timeout(timeout) {
        Ok(Err(TrainerError::DeadlineExceeded)) => Err(PipelineError::TrainerTimeout(timeout)),
        Ok(result) => Ok(result?),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            let _ = rx.recv_timeout(STOP_GRACE);
            Err(PipelineError::TrainerTimeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(PipelineError::Trainer(
            TrainerError::Failed("trainer worker exited without a result".to_string()),
        )),
    }
}
