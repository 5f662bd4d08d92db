use crate::trainer::TrainerError;
use salesops_core::ContractError;
use salesops_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Contract(#[from] ContractError),
    #[error("{0}")]
    Trainer(#[from] TrainerError),
    #[error("trainer timed out after {0:?}")]
    TrainerTimeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("a pipeline run is already in progress")]
    Busy,
    #[error("pipeline halted: {0}")]
    Halted(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How callers should react to a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Storage or a collaborator was unreachable; retry later.
    TransientIo,
    InsufficientData,
    /// A registry invariant broke. Fatal until an operator resumes.
    InvalidState,
    Validation,
    Timeout,
    Cancelled,
    Busy,
    Halted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::InsufficientData => "insufficient_data",
            ErrorClass::InvalidState => "invalid_state",
            ErrorClass::Validation => "validation",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Busy => "busy",
            ErrorClass::Halted => "halted",
        }
    }
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Storage(err) => match err {
                StorageError::Sqlite(_) | StorageError::Timestamp(_) => ErrorClass::TransientIo,
                StorageError::UnknownStream(_)
                | StorageError::ModelNotFound(_)
                | StorageError::DuplicateModel(_) => ErrorClass::Validation,
                StorageError::Contract(_)
                | StorageError::UnsupportedSchemaVersion { .. }
                | StorageError::InvalidTransition { .. }
                | StorageError::RegistryInvariant(_) => ErrorClass::InvalidState,
            },
            PipelineError::Contract(ContractError::InsufficientData { .. }) => {
                ErrorClass::InsufficientData
            }
            PipelineError::Contract(_) => ErrorClass::Validation,
            PipelineError::Trainer(TrainerError::InsufficientData { .. }) => {
                ErrorClass::InsufficientData
            }
            PipelineError::Trainer(TrainerError::Failed(_)) => ErrorClass::TransientIo,
            PipelineError::Trainer(TrainerError::DeadlineExceeded)
            | PipelineError::TrainerTimeout(_) => ErrorClass::Timeout,
            PipelineError::Cancelled => ErrorClass::Cancelled,
            PipelineError::Busy => ErrorClass::Busy,
            PipelineError::Halted(_) => ErrorClass::Halted,
            PipelineError::Config(_) => ErrorClass::Validation,
            PipelineError::Io(_) => ErrorClass::TransientIo,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::InvalidState
    }
}
