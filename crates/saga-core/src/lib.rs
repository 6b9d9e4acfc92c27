//! Core data model for durable saga orchestration.
//!
//! Everything the engine persists lives here: saga identifiers, idempotency
//! tokens, the status state machine, attempt records and the error taxonomy
//! external actions use to classify their failures.

pub mod error;
mod ids;
mod record;
mod status;

pub use error::{ActionError, ErrorKind, TransitionError};
pub use ids::{ActionKind, IdempotencyToken, SagaId};
pub use record::{AttemptOutcome, LogRecord, StepAttempt};
pub use status::SagaStatus;
