use crate::{lock_store, PipelineError, SharedStore};
use serde::{Deserialize, Serialize};

/// Result of one read-only look at the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSignal {
    pub stream: String,
    pub acknowledged: i64,
    pub head: i64,
}

impl ChangeSignal {
    pub fn has_new_data(&self) -> bool {
        self.head > self.acknowledged
    }

    pub fn new_rows(&self) -> u64 {
        (self.head - self.acknowledged).max(0) as u64
    }
}

/// Compares the stream head against the last acknowledged position. Never
/// writes: acknowledgement belongs to run completion.
#[derive(Clone)]
pub struct ChangeDetector {
    store: SharedStore,
    stream: String,
}

impl ChangeDetector {
    pub fn new(store: SharedStore, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn inspect(&self) -> Result<ChangeSignal, PipelineError> {
        let store = lock_store(&self.store);
        let head = store.stream_head(&self.stream)?;
        let acknowledged = store
            .watermark(&self.stream)?
            .map(|watermark| watermark.position)
            .unwrap_or(0);

        Ok(ChangeSignal {
            stream: self.stream.clone(),
            acknowledged,
            head,
        })
    }

    pub fn has_new_data(&self) -> Result<bool, PipelineError> {
        Ok(self.inspect()?.has_new_data())
    }
}
