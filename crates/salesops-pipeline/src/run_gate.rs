use crate::PipelineError;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Admits at most one mutating operation at a time. The in-process flag is
/// always used; the advisory file lock extends the guarantee to other
/// processes sharing the same database.
#[derive(Debug, Clone)]
pub struct RunGate {
    active: Arc<AtomicBool>,
    lock_path: Option<PathBuf>,
}

/// Held for the duration of a run. Dropping it reopens the gate.
#[derive(Debug)]
pub struct RunPermit {
    active: Arc<AtomicBool>,
    file_lock: Option<AdvisoryRunLock>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        drop(self.file_lock.take());
        self.active.store(false, Ordering::SeqCst);
    }
}

impl RunGate {
    pub fn new(lock_path: Option<PathBuf>) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            lock_path,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// `Ok(None)` when another run holds the gate.
    pub fn try_acquire(&self, holder: &str) -> Result<Option<RunPermit>, PipelineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        let file_lock = match self.lock_path.as_deref() {
            None => None,
            Some(path) => match AdvisoryRunLock::try_acquire(path, holder) {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    self.active.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Err(err) => {
                    self.active.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            },
        };

        Ok(Some(RunPermit {
            active: self.active.clone(),
            file_lock,
        }))
    }
}

#[derive(Debug)]
struct AdvisoryRunLock {
    file: File,
}

impl AdvisoryRunLock {
    fn try_acquire(path: &Path, holder: &str) -> Result<Option<Self>, std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "holder={holder}\npid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self { file }))
    }
}

impl Drop for AdvisoryRunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
