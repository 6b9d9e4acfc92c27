use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::SagaStatus;

/// Classification an external collaborator attaches to its own failures.
///
/// The orchestrator uses it as the sole input to the retry-versus-compensate
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable: triggers a backoff retry up to the policy limit.
    Transient,
    /// Non-retryable application error: triggers compensation immediately.
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}

/// Error returned by a forward or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} action error: {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Partial side effects the action made and could not undo before
    /// failing. A non-empty list makes the failure terminal and keeps the
    /// saga from ending `Compensated`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uncompensated: Vec<String>,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            uncompensated: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Names effects left in place by this failure.
    #[must_use]
    pub fn with_uncompensated<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uncompensated.extend(effects.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }

    /// The action failed with part of its effect still in place.
    #[must_use]
    pub fn left_effects(&self) -> bool {
        !self.uncompensated.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal saga status transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SagaStatus,
    pub to: SagaStatus,
}
