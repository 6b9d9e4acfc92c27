use saga_config::ConfigError;
use saga_core::{SagaId, SagaStatus, TransitionError};
use saga_log::{LogError, LogWriteError};
use thiserror::Error;

/// A compensating action ran out of attempts.
///
/// Never discarded: it is attached to the status report of the `Failed`
/// saga so an operator can finish the undo by hand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "compensation for step '{step}' of saga {saga_id} exhausted its retry policy after {attempts} attempt(s): {reason}"
)]
pub struct CompensationExhaustedError {
    pub saga_id: SagaId,
    /// Name of the step whose side effect remains in place.
    pub step: String,
    pub step_index: usize,
    /// Attempts of the undo that gave up. For a step that failed with
    /// effects it could not undo itself, its forward attempts.
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("saga definition name cannot be empty")]
    EmptyName,

    #[error("saga '{definition}' has more than one step named '{step}'")]
    DuplicateStep { definition: String, step: String },

    #[error("step name cannot be empty in saga '{0}'")]
    EmptyStepName(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no saga definition registered under '{0}'")]
    UnknownDefinition(String),

    #[error("a saga definition named '{0}' is already registered")]
    DuplicateDefinition(String),

    #[error("saga input cannot be encoded as JSON")]
    InvalidInput(#[source] serde_json::Error),

    #[error("unknown saga {0}")]
    UnknownSaga(SagaId),

    #[error("saga {saga_id} already reached terminal status {status}")]
    AlreadyTerminal { saga_id: SagaId, status: SagaStatus },

    #[error("step log unavailable for saga {saga_id} after {attempts} write attempt(s)")]
    LogUnavailable {
        saga_id: SagaId,
        attempts: u32,
        #[source]
        source: LogWriteError,
    },

    #[error(transparent)]
    Log(LogError),

    #[error("history of saga {saga_id} is inconsistent: {reason}")]
    CorruptHistory { saga_id: SagaId, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("driver for saga {saga_id} halted: {reason}")]
    Halted { saga_id: SagaId, reason: String },
}

impl From<LogError> for EngineError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::UnknownSaga(id) => Self::UnknownSaga(id),
            other => Self::Log(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
