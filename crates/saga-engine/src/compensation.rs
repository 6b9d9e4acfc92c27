//! Reverse-order undo of completed steps.
//!
//! Only steps whose forward action succeeded are compensated, highest index
//! first. A compensation that exhausts its retry policy does not stop the
//! remaining undo; the saga ends `Failed` and the exhausted steps are
//! reported as uncompensated. So is a failed step that reported effects it
//! could not undo itself, such as a fan-out whose rollback gave up.

use std::cmp::Reverse;
use std::sync::Arc;

use saga_core::{ActionKind, AttemptOutcome, LogRecord, SagaStatus, StepAttempt};
use tracing::{debug, error, info, warn};

use crate::error::{CompensationExhaustedError, Result};
use crate::orchestrator::Driver;
use crate::registry::ResolvedDefinition;
use crate::replay::{NextAction, PlannedAttempt, Replay, StepProgress};

/// Steps still awaiting compensation, in the order they will run.
pub(crate) fn pending(replay: &Replay, step_count: usize) -> impl Iterator<Item = usize> + '_ {
    (0..step_count).rev().filter(move |&index| {
        replay.forward_succeeded(index)
            && !replay
                .compensation(index)
                .is_some_and(|p| p.succeeded() || p.exhausted)
    })
}

pub(crate) fn plan(replay: &Replay, definition: &ResolvedDefinition) -> NextAction {
    if let Some(index) = pending(replay, definition.steps.len()).next() {
        return NextAction::Execute(PlannedAttempt::next(
            ActionKind::Compensation,
            index,
            replay.compensation(index),
            &definition.steps[index].compensation_retry,
        ));
    }
    if exhausted(replay, definition).is_empty() {
        NextAction::Finish(SagaStatus::Compensated)
    } else {
        NextAction::Finish(SagaStatus::Failed)
    }
}

/// Undo that ran out of attempts, highest step first. Includes failed
/// forward steps that left effects behind.
pub(crate) fn exhausted(
    replay: &Replay,
    definition: &ResolvedDefinition,
) -> Vec<CompensationExhaustedError> {
    let stranded = replay
        .forward
        .iter()
        .filter(|(_, progress)| progress.left_effects());
    let given_up = replay
        .compensation
        .iter()
        .filter(|(_, progress)| progress.exhausted);
    let mut failures: Vec<_> = stranded
        .chain(given_up)
        .map(|(&index, progress)| CompensationExhaustedError {
            saga_id: replay.saga_id,
            step: definition.step_name(index).to_string(),
            step_index: index,
            attempts: progress.attempts,
            reason: progress
                .last_error()
                .unwrap_or_else(|| "unknown error".to_string()),
        })
        .collect();
    failures.sort_by_key(|failure| Reverse(failure.step_index));
    failures
}

/// Steps whose forward effect is in place and not (yet) undone.
pub(crate) fn uncompensated(replay: &Replay, step_count: usize) -> Vec<usize> {
    (0..step_count)
        .rev()
        .filter(|&index| {
            (replay.forward_succeeded(index) && !replay.compensated(index))
                || replay.forward_left_effects(index)
        })
        .collect()
}

impl Driver {
    pub(crate) async fn compensate_step(&mut self, planned: PlannedAttempt) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let step = &definition.steps[planned.index];
        let saga_id = self.replay.saga_id;

        let Some(action) = step.compensate.clone() else {
            debug!(%saga_id, step = %step.name, "no compensating action, recording no-op");
            let noop = StepAttempt::started(saga_id, planned.index, planned.attempt, planned.kind)
                .finish(AttemptOutcome::Skipped);
            return self.record(LogRecord::Attempt(noop)).await;
        };

        if !planned.delay.is_zero() {
            tokio::time::sleep(planned.delay).await;
        }
        let forward_result = self
            .replay
            .forward(planned.index)
            .and_then(|p: &StepProgress| p.result.clone());
        let outcome = self
            .attempt(
                &planned,
                action,
                step.timeout,
                &step.compensation_retry,
                forward_result,
            )
            .await?;

        match &outcome {
            AttemptOutcome::Success { .. } => {
                info!(%saga_id, step = %step.name, attempt = planned.attempt, "step compensated");
            }
            failure if failure.is_terminal_failure() => error!(
                %saga_id,
                step = %step.name,
                attempts = planned.attempt,
                error = failure.error_message().as_deref().unwrap_or_default(),
                "compensation exhausted its retry policy, manual intervention required"
            ),
            failure => warn!(
                %saga_id,
                step = %step.name,
                attempt = planned.attempt,
                error = failure.error_message().as_deref().unwrap_or_default(),
                "compensation attempt failed, will retry"
            ),
        }
        Ok(())
    }
}
