use std::path::PathBuf;

use saga_core::SagaId;
use thiserror::Error;

/// Failure to make a record durable.
///
/// An action is never considered attempted until its start record has been
/// written, so callers retry `Unavailable` at the log layer itself.
#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("log storage unavailable while appending to saga {saga_id}")]
    Unavailable {
        saga_id: SagaId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode log record for saga {saga_id}")]
    Encode {
        saga_id: SagaId,
        #[source]
        source: serde_json::Error,
    },

    #[error("saga {0} is archived and no longer accepts records")]
    Archived(SagaId),
}

impl LogWriteError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Write(#[from] LogWriteError),

    #[error("failed to initialize log directory '{path}'")]
    Init {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read log '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at line {line} of '{path}'")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("no log found for saga {0}")]
    UnknownSaga(SagaId),
}
