use std::collections::{HashMap, HashSet};
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use saga_core::{LogRecord, SagaId};

use crate::Result;
use crate::error::{LogError, LogWriteError};
use crate::traits::StepLog;

#[derive(Debug, Default)]
struct MemoryState {
    histories: HashMap<SagaId, Vec<LogRecord>>,
    archived: HashSet<SagaId>,
    failing_appends: u32,
    total_appends: usize,
}

/// Process-local step log.
///
/// Survives engine restarts within one process (share the `Arc`), which is
/// what embedded use and tests need. Storage outages can be simulated with
/// [`MemoryStepLog::fail_next_appends`].
#[derive(Debug, Default)]
pub struct MemoryStepLog {
    state: Mutex<MemoryState>,
}

impl MemoryStepLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail with `LogWriteError::Unavailable`.
    pub fn fail_next_appends(&self, count: u32) {
        self.state.lock().failing_appends = count;
    }

    /// Number of successful appends across all sagas.
    #[must_use]
    pub fn total_appends(&self) -> usize {
        self.state.lock().total_appends
    }

    /// Drops every record after the first `len` of a saga's history.
    ///
    /// Simulates a crash that lost writes which were never acknowledged.
    pub fn truncate(&self, saga_id: SagaId, len: usize) {
        if let Some(history) = self.state.lock().histories.get_mut(&saga_id) {
            history.truncate(len);
        }
    }
}

#[async_trait]
impl StepLog for MemoryStepLog {
    async fn append(&self, record: &LogRecord) -> std::result::Result<(), LogWriteError> {
        let saga_id = record.saga_id();
        let mut state = self.state.lock();

        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(LogWriteError::Unavailable {
                saga_id,
                source: io::Error::other("simulated storage outage"),
            });
        }
        if state.archived.contains(&saga_id) {
            return Err(LogWriteError::Archived(saga_id));
        }

        state
            .histories
            .entry(saga_id)
            .or_default()
            .push(record.clone());
        state.total_appends += 1;
        Ok(())
    }

    async fn read_history(&self, saga_id: SagaId) -> Result<Vec<LogRecord>> {
        self.state
            .lock()
            .histories
            .get(&saga_id)
            .cloned()
            .ok_or(LogError::UnknownSaga(saga_id))
    }

    async fn active_sagas(&self) -> Result<Vec<SagaId>> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state
            .histories
            .keys()
            .filter(|id| !state.archived.contains(id))
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn archive(&self, saga_id: SagaId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.histories.contains_key(&saga_id) {
            return Err(LogError::UnknownSaga(saga_id));
        }
        state.archived.insert(saga_id);
        Ok(())
    }

    async fn is_archived(&self, saga_id: SagaId) -> Result<bool> {
        let state = self.state.lock();
        if !state.histories.contains_key(&saga_id) {
            return Err(LogError::UnknownSaga(saga_id));
        }
        Ok(state.archived.contains(&saga_id))
    }
}
