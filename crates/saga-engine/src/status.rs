use saga_core::{SagaId, SagaStatus};
use serde_json::Value;

use crate::compensation;
use crate::error::CompensationExhaustedError;
use crate::registry::ResolvedDefinition;
use crate::replay::Replay;

/// State of a single step as implied by the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StepState {
    /// Not attempted yet.
    Pending,
    /// Attempted, no success or terminal failure yet.
    InProgress,
    /// Forward action succeeded.
    Succeeded,
    /// Forward action failed terminally.
    Failed,
    /// Undo attempted, not finished.
    Compensating,
    /// Undone, or had nothing to undo.
    Compensated,
    /// Undo exhausted its retry policy; the side effect remains.
    CompensationFailed,
}

impl StepState {
    fn symbol(self) -> &'static str {
        match self {
            Self::Pending => "·",
            Self::InProgress | Self::Compensating => "…",
            Self::Succeeded => "✓",
            Self::Failed => "✗",
            Self::Compensated => "↩",
            Self::CompensationFailed => "⚠",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub state: StepState,
    /// Forward attempts made so far.
    pub attempts: u32,
    pub compensation_attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot of a saga, rebuilt from its log history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    saga_id: SagaId,
    definition: String,
    status: SagaStatus,
    cancel_requested: bool,
    current_step: Option<usize>,
    last_error: Option<String>,
    result: Option<Value>,
    steps: Vec<StepReport>,
    compensation_failures: Vec<CompensationExhaustedError>,
}

impl StatusReport {
    pub(crate) fn new(replay: &Replay, definition: &ResolvedDefinition) -> Self {
        let step_count = definition.steps.len();
        let current_step = match replay.status {
            SagaStatus::Running => replay.next_forward_step(step_count),
            SagaStatus::Compensating => compensation::pending(replay, step_count).next(),
            _ => None,
        };
        let result = (replay.status == SagaStatus::Completed)
            .then(|| replay.final_result(step_count).cloned())
            .flatten();
        let compensation_failures = if replay.status == SagaStatus::Failed {
            compensation::exhausted(replay, definition)
        } else {
            Vec::new()
        };
        let steps = definition
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| step_report(replay, index, &step.name))
            .collect();

        Self {
            saga_id: replay.saga_id,
            definition: definition.name.clone(),
            status: replay.status,
            cancel_requested: replay.cancel_requested,
            current_step,
            last_error: replay.last_error.clone(),
            result,
            steps,
            compensation_failures,
        }
    }

    #[must_use]
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    #[must_use]
    pub fn definition(&self) -> &str {
        &self.definition
    }

    #[must_use]
    pub fn status(&self) -> SagaStatus {
        self.status
    }

    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// The step being executed or compensated, if the saga is active.
    #[must_use]
    pub fn current_step(&self) -> Option<&StepReport> {
        self.current_step.and_then(|index| self.steps.get(index))
    }

    /// Most recent failure of any attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Payload of the last step, once the saga completed.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Exhausted compensations of a `Failed` saga.
    #[must_use]
    pub fn compensation_failures(&self) -> &[CompensationExhaustedError] {
        &self.compensation_failures
    }

    /// Names of compensated steps, in the order they were undone.
    #[must_use]
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.state == StepState::Compensated)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Names of steps whose side effect is still in place after compensation
    /// started. Empty unless the saga is compensating or failed.
    #[must_use]
    pub fn uncompensated_steps(&self) -> Vec<&str> {
        if !matches!(
            self.status,
            SagaStatus::Compensating | SagaStatus::Failed
        ) {
            return Vec::new();
        }
        self.steps
            .iter()
            .rev()
            .filter(|s| {
                matches!(
                    s.state,
                    StepState::Succeeded | StepState::Compensating | StepState::CompensationFailed
                )
            })
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Human-readable overview, one line per step.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "saga {} ({}): {}",
            self.saga_id, self.definition, self.status
        )];
        for step in &self.steps {
            lines.push(format!("{} {}", step.state.symbol(), step.name));
        }
        lines.join("\n")
    }
}

fn step_report(replay: &Replay, index: usize, name: &str) -> StepReport {
    let forward = replay.forward(index);
    let compensation = replay.compensation(index);

    let state = match (forward, compensation) {
        (_, Some(c)) if c.succeeded() => StepState::Compensated,
        (_, Some(c)) if c.exhausted => StepState::CompensationFailed,
        (_, Some(_)) => StepState::Compensating,
        (Some(f), None) if f.succeeded() => StepState::Succeeded,
        (Some(f), None) if f.left_effects() => StepState::CompensationFailed,
        (Some(f), None) if f.exhausted => StepState::Failed,
        (Some(_), None) => StepState::InProgress,
        (None, None) => StepState::Pending,
    };
    let last_error = compensation
        .and_then(|c| c.last_error())
        .or_else(|| forward.and_then(|f| f.last_error()));

    StepReport {
        index,
        name: name.to_string(),
        state,
        attempts: forward.map_or(0, |f| f.attempts),
        compensation_attempts: compensation.map_or(0, |c| c.attempts),
        last_error,
    }
}
