use async_trait::async_trait;
use saga_core::{LogRecord, SagaId, StepAttempt};

use crate::Result;
use crate::error::LogWriteError;

/// Pluggable persistence for saga histories.
///
/// Appends for one saga are linearized. Nothing is guaranteed about the
/// relative order of appends to different sagas.
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Durably appends a record to the history of `record.saga_id()`.
    ///
    /// Must not return `Ok` before the record would survive a crash.
    ///
    /// # Errors
    ///
    /// Returns `LogWriteError::Unavailable` if storage cannot be written.
    async fn append(&self, record: &LogRecord) -> std::result::Result<(), LogWriteError>;

    /// Durably appends an attempt record.
    ///
    /// # Errors
    ///
    /// See [`StepLog::append`].
    async fn append_attempt(&self, attempt: &StepAttempt) -> std::result::Result<(), LogWriteError> {
        self.append(&LogRecord::Attempt(attempt.clone())).await
    }

    /// All records of a saga, in append order. Archived histories stay readable.
    ///
    /// # Errors
    ///
    /// Returns `LogError::UnknownSaga` if nothing was ever appended for the saga.
    async fn read_history(&self, saga_id: SagaId) -> Result<Vec<LogRecord>>;

    /// Ids of all sagas that have not been archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be listed.
    async fn active_sagas(&self) -> Result<Vec<SagaId>>;

    /// Retires a terminal saga. Its history is kept, never deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the saga is unknown or storage cannot be written.
    async fn archive(&self, saga_id: SagaId) -> Result<()>;

    /// # Errors
    ///
    /// Returns `LogError::UnknownSaga` for sagas with no history.
    async fn is_archived(&self, saga_id: SagaId) -> Result<bool>;
}
