use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use saga_config::EngineConfig;
use saga_core::{LogRecord, SagaId, SagaStatus};
use saga_log::{FileStepLog, LogWriteError, MemoryStepLog, StepLog};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::definition::SagaDefinition;
use crate::durable::DurableWriter;
use crate::error::{EngineError, Result};
use crate::orchestrator::Driver;
use crate::registry::{Registry, ResolvedDefinition};
use crate::replay::Replay;
use crate::status::StatusReport;

#[derive(Debug, Clone)]
enum DriverExit {
    Finished(SagaStatus),
    Halted(String),
}

struct DriverHandle {
    cancel: watch::Sender<bool>,
    exit: watch::Receiver<Option<DriverExit>>,
    abort: AbortHandle,
}

impl DriverHandle {
    fn is_live(&self) -> bool {
        self.exit.borrow().is_none() && !self.abort.is_finished()
    }
}

struct Inner {
    log: Arc<dyn StepLog>,
    config: EngineConfig,
    registry: Registry,
    drivers: Mutex<HashMap<SagaId, DriverHandle>>,
    permits: Option<Arc<Semaphore>>,
}

impl Inner {
    fn writer(&self) -> DurableWriter {
        DurableWriter::new(Arc::clone(&self.log), *self.config.log_write_retry())
    }

    async fn replay(&self, saga_id: SagaId) -> Result<Replay> {
        let history = self.log.read_history(saga_id).await?;
        Replay::from_history(saga_id, &history)
    }

    /// Archives a terminal saga. Failure is not fatal: recovery retires any
    /// terminal saga it finds still active.
    async fn retire(&self, saga_id: SagaId) {
        match self.log.archive(saga_id).await {
            Ok(()) => debug!(%saga_id, "saga archived"),
            Err(err) => warn!(%saga_id, error = %err, "failed to archive terminal saga"),
        }
    }
}

/// Outcome of [`SagaEngine::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal sagas whose drivers were restarted.
    pub resumed: Vec<SagaId>,
    /// Terminal sagas that were still active and got archived.
    pub archived: Vec<SagaId>,
    /// Sagas that could not be resumed: unknown definition or unreadable
    /// history. They stay in the log untouched.
    pub skipped: Vec<SagaId>,
}

/// Runs saga instances against a durable step log.
///
/// Cheap to clone; clones share drivers, definitions and the log.
#[derive(Clone)]
pub struct SagaEngine {
    inner: Arc<Inner>,
}

impl SagaEngine {
    #[must_use]
    pub fn new(log: Arc<dyn StepLog>, config: EngineConfig) -> Self {
        let permits = match config.max_concurrent_sagas() {
            0 => None,
            max => Some(Arc::new(Semaphore::new(max))),
        };
        Self {
            inner: Arc::new(Inner {
                log,
                config,
                registry: Registry::default(),
                drivers: Mutex::new(HashMap::new()),
                permits,
            }),
        }
    }

    /// Engine backed by a file log under `log_dir`, or an in-memory log if
    /// none is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be initialized.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let log: Arc<dyn StepLog> = match config.log_dir() {
            Some(dir) => Arc::new(FileStepLog::open(dir)?),
            None => Arc::new(MemoryStepLog::new()),
        };
        Ok(Self::new(log, config))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn StepLog> {
        &self.inner.log
    }

    /// Registers a definition, applying configured overrides to its steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, or configured overrides are
    /// invalid or name steps the definition does not have.
    pub fn register(&self, definition: SagaDefinition) -> Result<()> {
        self.inner.registry.register(definition, &self.inner.config)
    }

    /// Starts a new saga instance.
    ///
    /// Returns once the instance is durably recorded; execution continues in
    /// the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is unknown or the creation record
    /// cannot be written.
    pub async fn create_saga(&self, definition: &str, input: Value) -> Result<SagaId> {
        let resolved = self.inner.registry.get(definition)?;
        let saga_id = SagaId::new();
        let created = LogRecord::Created {
            saga_id,
            definition: definition.to_string(),
            input,
            created_at: Utc::now(),
        };
        self.inner.writer().append(&created).await?;
        info!(%saga_id, definition, "saga created");

        let replay = Replay::from_history(saga_id, std::slice::from_ref(&created))?;
        self.spawn_driver(replay, resolved);
        Ok(saga_id)
    }

    /// Starts a new saga instance with typed input.
    ///
    /// # Errors
    ///
    /// See [`SagaEngine::create_saga`]; also fails if `input` cannot be
    /// encoded as JSON.
    pub async fn create_saga_with<T: Serialize>(
        &self,
        definition: &str,
        input: &T,
    ) -> Result<SagaId> {
        let input = serde_json::to_value(input).map_err(EngineError::InvalidInput)?;
        self.create_saga(definition, input).await
    }

    /// Current state of a saga, rebuilt from its log history.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownSaga` if the log has no such saga.
    pub async fn get_status(&self, saga_id: SagaId) -> Result<StatusReport> {
        let replay = self.inner.replay(saga_id).await?;
        let definition = self.inner.registry.get(&replay.definition)?;
        Ok(StatusReport::new(&replay, &definition))
    }

    /// Requests cancellation of a running saga.
    ///
    /// The request is durable. It takes effect at the next point the saga is
    /// not inside an action invocation: completed steps are compensated in
    /// reverse order. Requesting cancellation of a compensating saga is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyTerminal` for finished sagas.
    pub async fn cancel(&self, saga_id: SagaId) -> Result<()> {
        let replay = self.inner.replay(saga_id).await?;
        if replay.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                saga_id,
                status: replay.status,
            });
        }
        if replay.status == SagaStatus::Compensating || replay.cancel_requested {
            debug!(%saga_id, status = %replay.status, "cancellation already in effect");
            return Ok(());
        }

        let record = LogRecord::CancelRequested {
            saga_id,
            at: Utc::now(),
        };
        match self.inner.writer().append(&record).await {
            Err(EngineError::LogUnavailable {
                source: LogWriteError::Archived(_),
                ..
            }) => {
                let status = self.inner.replay(saga_id).await?.status;
                return Err(EngineError::AlreadyTerminal { saga_id, status });
            }
            other => other?,
        }
        info!(%saga_id, "cancellation requested");

        if let Some(handle) = self.inner.drivers.lock().get(&saga_id) {
            handle.cancel.send_replace(true);
        }
        Ok(())
    }

    /// Waits for the driver of a saga to finish and returns its final state.
    ///
    /// For sagas without a driver in this engine the current state is
    /// returned immediately.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Halted` if the driver stopped before the saga
    /// reached a terminal status, e.g. because the log became unavailable.
    pub async fn wait(&self, saga_id: SagaId) -> Result<StatusReport> {
        let exit = self
            .inner
            .drivers
            .lock()
            .get(&saga_id)
            .map(|handle| handle.exit.clone());
        if let Some(mut exit) = exit {
            let outcome = exit.wait_for(Option::is_some).await.ok().and_then(|v| (*v).clone());
            match outcome {
                Some(DriverExit::Finished(_)) => {}
                Some(DriverExit::Halted(reason)) => {
                    return Err(EngineError::Halted { saga_id, reason });
                }
                None => {
                    return Err(EngineError::Halted {
                        saga_id,
                        reason: "driver was stopped".to_string(),
                    });
                }
            }
        }
        self.get_status(saga_id).await
    }

    /// Resumes every non-terminal saga in the log and archives terminal ones.
    ///
    /// Call once after registering definitions on startup. Sagas already
    /// driven by this engine are left alone, so calling it again is harmless.
    ///
    /// A saga whose history cannot be read or folded is skipped and left in
    /// the log; the others are still recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be listed.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for saga_id in self.inner.log.active_sagas().await? {
            if self
                .inner
                .drivers
                .lock()
                .get(&saga_id)
                .is_some_and(DriverHandle::is_live)
            {
                continue;
            }
            let replay = match self.inner.replay(saga_id).await {
                Ok(replay) => replay,
                Err(err) => {
                    error!(%saga_id, error = %err, "cannot recover saga");
                    report.skipped.push(saga_id);
                    continue;
                }
            };
            if replay.status.is_terminal() {
                self.inner.retire(saga_id).await;
                report.archived.push(saga_id);
                continue;
            }
            match self.inner.registry.get(&replay.definition) {
                Ok(definition) => {
                    info!(%saga_id, status = %replay.status, "resuming saga");
                    self.spawn_driver(replay, definition);
                    report.resumed.push(saga_id);
                }
                Err(err) => {
                    error!(%saga_id, error = %err, "cannot recover saga");
                    report.skipped.push(saga_id);
                }
            }
        }
        info!(
            resumed = report.resumed.len(),
            archived = report.archived.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Stops every driver at its next await point without recording anything.
    ///
    /// The log is left exactly as a crash would leave it; [`SagaEngine::recover`]
    /// on a new engine picks the sagas up again.
    pub fn shutdown(&self) {
        let drivers: Vec<_> = self.inner.drivers.lock().drain().collect();
        for (saga_id, handle) in drivers {
            debug!(%saga_id, "stopping saga driver");
            handle.abort.abort();
        }
    }

    /// Number of sagas currently driven by this engine.
    #[must_use]
    pub fn active_drivers(&self) -> usize {
        self.inner
            .drivers
            .lock()
            .values()
            .filter(|handle| handle.is_live())
            .count()
    }

    fn spawn_driver(&self, replay: Replay, definition: Arc<ResolvedDefinition>) {
        let saga_id = replay.saga_id;
        let (cancel_tx, cancel_rx) = watch::channel(replay.cancel_requested);
        let (exit_tx, exit_rx) = watch::channel(None);
        let inner = Arc::clone(&self.inner);
        let driver = Driver::new(replay, definition, inner.writer(), cancel_rx);

        let mut drivers = self.inner.drivers.lock();
        let task = tokio::spawn(async move {
            let _permit = match &inner.permits {
                Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
                None => None,
            };
            let exit = match driver.run().await {
                Ok(status) => {
                    inner.retire(saga_id).await;
                    inner.drivers.lock().remove(&saga_id);
                    DriverExit::Finished(status)
                }
                Err(err) => {
                    error!(%saga_id, error = %err, "saga driver halted, recovery will resume it");
                    DriverExit::Halted(err.to_string())
                }
            };
            exit_tx.send_replace(Some(exit));
        });
        drivers.insert(
            saga_id,
            DriverHandle {
                cancel: cancel_tx,
                exit: exit_rx,
                abort: task.abort_handle(),
            },
        );
    }
}
