use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ActionError;
use crate::ids::{ActionKind, SagaId};
use crate::status::SagaStatus;

/// What happened to a single action attempt.
///
/// `Started` is written before the action is invoked. A `Started` record
/// without a later outcome for the same attempt means the action may or may
/// not have run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Started,
    Success {
        payload: Value,
    },
    Failure {
        error: ActionError,
        /// No further attempt of this action will be made.
        terminal: bool,
    },
    Timeout {
        timeout_ms: u64,
        terminal: bool,
    },
    /// No-op compensation for a step without a compensating action.
    Skipped,
}

impl AttemptOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Skipped)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Failure { terminal: true, .. } | Self::Timeout { terminal: true, .. }
        )
    }

    /// Human-readable error text for failure outcomes.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Failure { error, .. } => Some(error.to_string()),
            Self::Timeout { timeout_ms, .. } => Some(format!("timed out after {timeout_ms}ms")),
            Self::Started | Self::Success { .. } | Self::Skipped => None,
        }
    }
}

/// One record of one attempt of one action of one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub saga_id: SagaId,
    pub step_index: usize,
    /// 1-based attempt number within this step and kind.
    pub attempt: u32,
    pub kind: ActionKind,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl StepAttempt {
    #[must_use]
    pub fn started(saga_id: SagaId, step_index: usize, attempt: u32, kind: ActionKind) -> Self {
        Self {
            saga_id,
            step_index,
            attempt,
            kind,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Started,
        }
    }

    /// The outcome record belonging to this started attempt.
    #[must_use]
    pub fn finish(&self, outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            ..self.clone()
        }
    }
}

/// An entry in the durable step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Created {
        saga_id: SagaId,
        definition: String,
        input: Value,
        created_at: DateTime<Utc>,
    },
    Transition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
        at: DateTime<Utc>,
    },
    CancelRequested {
        saga_id: SagaId,
        at: DateTime<Utc>,
    },
    Attempt(StepAttempt),
}

impl LogRecord {
    #[must_use]
    pub fn saga_id(&self) -> SagaId {
        match self {
            Self::Created { saga_id, .. }
            | Self::Transition { saga_id, .. }
            | Self::CancelRequested { saga_id, .. } => *saga_id,
            Self::Attempt(attempt) => attempt.saga_id,
        }
    }

    #[must_use]
    pub fn transition(saga_id: SagaId, from: SagaStatus, to: SagaStatus) -> Self {
        Self::Transition {
            saga_id,
            from,
            to,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn as_attempt(&self) -> Option<&StepAttempt> {
        match self {
            Self::Attempt(attempt) => Some(attempt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn finish_keeps_identity_of_attempt() {
        let id = SagaId::new();
        let started = StepAttempt::started(id, 1, 2, ActionKind::Forward);
        let done = started.finish(AttemptOutcome::Success {
            payload: json!({"reservation": "R-1"}),
        });

        assert_eq!(done.saga_id, id);
        assert_eq!(done.step_index, 1);
        assert_eq!(done.attempt, 2);
        assert_eq!(done.started_at, started.started_at);
        assert!(done.outcome.is_success());
        assert!(started.outcome.is_started());
    }

    #[test]
    fn skipped_counts_as_success() {
        assert!(AttemptOutcome::Skipped.is_success());
    }

    #[test]
    fn terminal_failures_are_detected() {
        let terminal = AttemptOutcome::Failure {
            error: ActionError::permanent("no rooms"),
            terminal: true,
        };
        let retryable = AttemptOutcome::Timeout {
            timeout_ms: 50,
            terminal: false,
        };
        assert!(terminal.is_terminal_failure());
        assert!(!retryable.is_terminal_failure());
        assert_eq!(
            retryable.error_message().as_deref(),
            Some("timed out after 50ms")
        );
    }

    #[test]
    fn attempt_record_json_is_flat() {
        let id = SagaId::new();
        let record = LogRecord::Attempt(StepAttempt::started(id, 0, 1, ActionKind::Forward));

        let value = serde_json::to_value(&record).expect("serialize");

        assert_eq!(value["record"], "attempt");
        assert_eq!(value["outcome"], "started");
        assert_eq!(value["kind"], "forward");
        assert_eq!(value["step_index"], 0);
    }

    #[test]
    fn records_survive_json_encoding() {
        let id = SagaId::new();
        let records = vec![
            LogRecord::Created {
                saga_id: id,
                definition: "booking".to_string(),
                input: json!({"customer": "ada"}),
                created_at: Utc::now(),
            },
            LogRecord::transition(id, SagaStatus::Pending, SagaStatus::Running),
            LogRecord::Attempt(
                StepAttempt::started(id, 0, 1, ActionKind::Forward).finish(
                    AttemptOutcome::Failure {
                        error: ActionError::transient("busy"),
                        terminal: false,
                    },
                ),
            ),
            LogRecord::CancelRequested {
                saga_id: id,
                at: Utc::now(),
            },
        ];

        for record in records {
            let line = serde_json::to_string(&record).expect("serialize");
            let back: LogRecord = serde_json::from_str(&line).expect("deserialize");
            assert_eq!(back, record);
            assert_eq!(back.saga_id(), id);
        }
    }
}
