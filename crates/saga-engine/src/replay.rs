//! Reconstruction of saga state from its log history.
//!
//! [`plan`] is the only place that decides what a saga does next. Live
//! drivers and recovery both call it on the same folded state, which is what
//! makes resuming after a crash indistinguishable from never having crashed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use saga_core::{ActionKind, AttemptOutcome, LogRecord, SagaId, SagaStatus, StepAttempt};
use saga_retry::RetryPolicy;
use serde_json::Value;

use crate::compensation;
use crate::error::{EngineError, Result};
use crate::registry::ResolvedDefinition;

/// Folded attempts of one action (forward or compensation) of one step.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepProgress {
    /// Highest attempt number seen.
    pub(crate) attempts: u32,
    /// Started attempt with no recorded outcome.
    pub(crate) in_flight: Option<StepAttempt>,
    pub(crate) result: Option<Value>,
    pub(crate) skipped: bool,
    pub(crate) last_failure: Option<AttemptOutcome>,
    /// A terminal failure was recorded; no further attempts.
    pub(crate) exhausted: bool,
    /// Effects a failed attempt reported as left in place.
    pub(crate) stranded: Vec<String>,
}

impl StepProgress {
    fn apply(&mut self, attempt: &StepAttempt) {
        self.attempts = self.attempts.max(attempt.attempt);
        match &attempt.outcome {
            AttemptOutcome::Started => self.in_flight = Some(attempt.clone()),
            AttemptOutcome::Success { payload } => {
                self.in_flight = None;
                self.result = Some(payload.clone());
            }
            AttemptOutcome::Skipped => {
                self.in_flight = None;
                self.result = Some(Value::Null);
                self.skipped = true;
            }
            failure @ (AttemptOutcome::Failure { .. } | AttemptOutcome::Timeout { .. }) => {
                self.in_flight = None;
                self.exhausted = failure.is_terminal_failure();
                if let AttemptOutcome::Failure { error, .. } = failure {
                    self.stranded.extend(error.uncompensated.iter().cloned());
                }
                self.last_failure = Some(failure.clone());
            }
        }
    }

    pub(crate) fn succeeded(&self) -> bool {
        self.result.is_some()
    }

    /// The action failed and left part of its effect behind.
    pub(crate) fn left_effects(&self) -> bool {
        !self.stranded.is_empty()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_failure.as_ref().and_then(AttemptOutcome::error_message)
    }
}

/// Saga state as implied by its history.
#[derive(Debug, Clone)]
pub(crate) struct Replay {
    pub(crate) saga_id: SagaId,
    pub(crate) definition: String,
    pub(crate) input: Arc<Value>,
    pub(crate) status: SagaStatus,
    pub(crate) cancel_requested: bool,
    pub(crate) forward: BTreeMap<usize, StepProgress>,
    pub(crate) compensation: BTreeMap<usize, StepProgress>,
    pub(crate) last_error: Option<String>,
}

impl Replay {
    pub(crate) fn from_history(saga_id: SagaId, history: &[LogRecord]) -> Result<Self> {
        let Some((
            LogRecord::Created {
                definition, input, ..
            },
            rest,
        )) = history.split_first()
        else {
            return Err(corrupt(saga_id, "history does not begin with a creation record"));
        };

        let mut replay = Self {
            saga_id,
            definition: definition.clone(),
            input: Arc::new(input.clone()),
            status: SagaStatus::Pending,
            cancel_requested: false,
            forward: BTreeMap::new(),
            compensation: BTreeMap::new(),
            last_error: None,
        };
        for record in rest {
            replay.apply(record)?;
        }
        Ok(replay)
    }

    /// Folds one more record into the state.
    pub(crate) fn apply(&mut self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Created { .. } => {
                return Err(corrupt(self.saga_id, "duplicate creation record"));
            }
            LogRecord::Transition { from, to, .. } => {
                if *from != self.status {
                    return Err(corrupt(
                        self.saga_id,
                        format!("transition from {from} recorded while {}", self.status),
                    ));
                }
                self.status = from
                    .transition(*to)
                    .map_err(|err| corrupt(self.saga_id, err.to_string()))?;
            }
            LogRecord::CancelRequested { .. } => self.cancel_requested = true,
            LogRecord::Attempt(attempt) => {
                let progress = match attempt.kind {
                    ActionKind::Forward => &mut self.forward,
                    ActionKind::Compensation => &mut self.compensation,
                };
                progress.entry(attempt.step_index).or_default().apply(attempt);
                if let Some(message) = attempt.outcome.error_message() {
                    self.last_error = Some(message);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn forward(&self, index: usize) -> Option<&StepProgress> {
        self.forward.get(&index)
    }

    pub(crate) fn compensation(&self, index: usize) -> Option<&StepProgress> {
        self.compensation.get(&index)
    }

    pub(crate) fn forward_succeeded(&self, index: usize) -> bool {
        self.forward(index).is_some_and(StepProgress::succeeded)
    }

    pub(crate) fn compensated(&self, index: usize) -> bool {
        self.compensation(index).is_some_and(StepProgress::succeeded)
    }

    /// Failed forward step that left part of its effect in place.
    pub(crate) fn forward_left_effects(&self, index: usize) -> bool {
        self.forward(index).is_some_and(StepProgress::left_effects)
    }

    /// First step whose forward action has not succeeded.
    pub(crate) fn next_forward_step(&self, step_count: usize) -> Option<usize> {
        (0..step_count).find(|&index| !self.forward_succeeded(index))
    }

    /// Results of successful forward steps, keyed by step name in step order.
    pub(crate) fn step_results(&self, definition: &ResolvedDefinition) -> IndexMap<String, Value> {
        definition
            .steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| {
                let result = self.forward(index)?.result.clone()?;
                Some((step.name.to_string(), result))
            })
            .collect()
    }

    /// Result of the saga: the payload of its last step.
    pub(crate) fn final_result(&self, step_count: usize) -> Option<&Value> {
        let last = step_count.checked_sub(1)?;
        self.forward(last)?.result.as_ref()
    }
}

fn corrupt(saga_id: SagaId, reason: impl Into<String>) -> EngineError {
    EngineError::CorruptHistory {
        saga_id,
        reason: reason.into(),
    }
}

/// An attempt the driver should make next.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedAttempt {
    pub(crate) kind: ActionKind,
    pub(crate) index: usize,
    pub(crate) attempt: u32,
    /// Backoff to wait before invoking.
    pub(crate) delay: Duration,
    /// Set when re-invoking an in-doubt attempt; its `Started` record is
    /// already in the log.
    pub(crate) resume: Option<StepAttempt>,
}

impl PlannedAttempt {
    /// Next attempt of one action given its folded progress.
    pub(crate) fn next(
        kind: ActionKind,
        index: usize,
        progress: Option<&StepProgress>,
        policy: &RetryPolicy,
    ) -> Self {
        let planned = |attempt, delay, resume| Self {
            kind,
            index,
            attempt,
            delay,
            resume,
        };
        match progress {
            None => planned(1, Duration::ZERO, None),
            Some(p) => match &p.in_flight {
                Some(started) => planned(started.attempt, Duration::ZERO, Some(started.clone())),
                None if p.attempts == 0 => planned(1, Duration::ZERO, None),
                None => planned(p.attempts + 1, policy.next_delay(p.attempts), None),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NextAction {
    /// Move a pending saga to `Running`.
    Start,
    Execute(PlannedAttempt),
    /// Move a running saga to `Compensating`.
    BeginCompensation,
    /// Record the terminal status.
    Finish(SagaStatus),
    /// Nothing left to do.
    Done,
}

/// Decides the next action of a saga from its folded history alone.
pub(crate) fn plan(replay: &Replay, definition: &ResolvedDefinition) -> NextAction {
    match replay.status {
        SagaStatus::Pending => NextAction::Start,
        SagaStatus::Running => plan_forward(replay, definition),
        SagaStatus::Compensating => compensation::plan(replay, definition),
        SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => NextAction::Done,
    }
}

fn plan_forward(replay: &Replay, definition: &ResolvedDefinition) -> NextAction {
    let Some(index) = replay.next_forward_step(definition.steps.len()) else {
        return NextAction::Finish(SagaStatus::Completed);
    };
    let progress = replay.forward(index);

    // An in-doubt attempt is settled before cancellation takes effect, so
    // its side effect is either known or compensated.
    if progress.is_some_and(|p| p.in_flight.is_some()) {
        return NextAction::Execute(PlannedAttempt::next(
            ActionKind::Forward,
            index,
            progress,
            &definition.steps[index].retry,
        ));
    }
    if replay.cancel_requested || progress.is_some_and(|p| p.exhausted) {
        return NextAction::BeginCompensation;
    }
    NextAction::Execute(PlannedAttempt::next(
        ActionKind::Forward,
        index,
        progress,
        &definition.steps[index].retry,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use saga_config::EngineConfig;
    use saga_core::ActionError;
    use serde_json::json;

    use super::*;
    use crate::action::{ActionContext, action_fn};
    use crate::definition::{SagaDefinition, StepDefinition};

    pub(crate) fn three_step_definition() -> ResolvedDefinition {
        let noop = || action_fn(|_: ActionContext| async { Ok(json!(null)) });
        let definition = SagaDefinition::builder("booking")
            .step(StepDefinition::new("flight", noop()).with_compensation(noop()))
            .step(StepDefinition::new("hotel", noop()).with_compensation(noop()))
            .step(StepDefinition::new("car", noop()))
            .build()
            .expect("valid definition");
        let config = EngineConfig::default().with_retry(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_secs(1)),
        );
        ResolvedDefinition::resolve(definition, &config).expect("resolves")
    }

    pub(crate) struct History {
        pub(crate) id: SagaId,
        pub(crate) records: Vec<LogRecord>,
    }

    impl History {
        pub(crate) fn created() -> Self {
            let id = SagaId::new();
            Self {
                id,
                records: vec![LogRecord::Created {
                    saga_id: id,
                    definition: "booking".to_string(),
                    input: json!({"customer": "ada"}),
                    created_at: chrono::Utc::now(),
                }],
            }
        }

        pub(crate) fn transition(mut self, from: SagaStatus, to: SagaStatus) -> Self {
            self.records.push(LogRecord::transition(self.id, from, to));
            self
        }

        pub(crate) fn running() -> Self {
            Self::created().transition(SagaStatus::Pending, SagaStatus::Running)
        }

        pub(crate) fn started(mut self, kind: ActionKind, index: usize, attempt: u32) -> Self {
            self.records.push(LogRecord::Attempt(StepAttempt::started(
                self.id, index, attempt, kind,
            )));
            self
        }

        pub(crate) fn outcome(
            mut self,
            kind: ActionKind,
            index: usize,
            attempt: u32,
            outcome: AttemptOutcome,
        ) -> Self {
            self = self.started(kind, index, attempt);
            let finished = StepAttempt::started(self.id, index, attempt, kind).finish(outcome);
            self.records.push(LogRecord::Attempt(finished));
            self
        }

        pub(crate) fn success(self, kind: ActionKind, index: usize, attempt: u32) -> Self {
            self.outcome(
                kind,
                index,
                attempt,
                AttemptOutcome::Success {
                    payload: json!({ "step": index }),
                },
            )
        }

        pub(crate) fn failure(
            self,
            kind: ActionKind,
            index: usize,
            attempt: u32,
            terminal: bool,
        ) -> Self {
            self.outcome(
                kind,
                index,
                attempt,
                AttemptOutcome::Failure {
                    error: ActionError::transient("service unavailable"),
                    terminal,
                },
            )
        }

        pub(crate) fn cancel_requested(mut self) -> Self {
            self.records.push(LogRecord::CancelRequested {
                saga_id: self.id,
                at: chrono::Utc::now(),
            });
            self
        }

        pub(crate) fn replay(&self) -> Replay {
            Replay::from_history(self.id, &self.records).expect("consistent history")
        }

        pub(crate) fn plan(&self) -> NextAction {
            plan(&self.replay(), &three_step_definition())
        }
    }

    fn execute(kind: ActionKind, index: usize, attempt: u32, delay: Duration) -> NextAction {
        NextAction::Execute(PlannedAttempt {
            kind,
            index,
            attempt,
            delay,
            resume: None,
        })
    }

    use ActionKind::{Compensation, Forward};

    mod fold {
        use super::*;

        #[test]
        fn history_must_begin_with_creation() {
            let history = History::running();

            let err = Replay::from_history(history.id, &history.records[1..])
                .err()
                .expect("missing creation");

            assert!(matches!(err, EngineError::CorruptHistory { .. }));
        }

        #[test]
        fn illegal_transitions_are_corruption() {
            let history =
                History::created().transition(SagaStatus::Running, SagaStatus::Completed);

            let err = Replay::from_history(history.id, &history.records)
                .err()
                .expect("pending saga cannot complete");

            assert!(matches!(err, EngineError::CorruptHistory { .. }));
        }

        #[test]
        fn backwards_transition_is_corruption() {
            let history = History::running().transition(SagaStatus::Running, SagaStatus::Pending);

            let err = Replay::from_history(history.id, &history.records)
                .err()
                .expect("running saga cannot return to pending");

            let EngineError::CorruptHistory { saga_id, reason } = err else {
                panic!("expected corrupt history, got {err:?}");
            };
            assert_eq!(saga_id, history.id);
            assert!(reason.contains("illegal saga status transition"));
        }

        #[test]
        fn failure_with_stranded_effects_is_remembered() {
            let replay = History::running()
                .outcome(
                    Forward,
                    0,
                    1,
                    AttemptOutcome::Failure {
                        error: ActionError::permanent("car sold out").with_uncompensated(["hotel"]),
                        terminal: true,
                    },
                )
                .replay();

            assert!(replay.forward_left_effects(0));
            assert!(!replay.forward_succeeded(0));
        }

        #[test]
        fn tracks_results_and_last_error() {
            let replay = History::running()
                .success(Forward, 0, 1)
                .failure(Forward, 1, 1, false)
                .replay();

            assert_eq!(replay.status, SagaStatus::Running);
            assert!(replay.forward_succeeded(0));
            assert!(!replay.forward_succeeded(1));
            assert_eq!(
                replay.last_error.as_deref(),
                Some("transient action error: service unavailable")
            );
            let results = replay.step_results(&three_step_definition());
            assert_eq!(results.get("flight"), Some(&json!({"step": 0})));
            assert_eq!(results.len(), 1);
        }

        #[test]
        fn started_without_outcome_is_in_flight() {
            let replay = History::running().started(Forward, 0, 1).replay();

            let progress = replay.forward(0).expect("step 0 attempted");
            assert_eq!(progress.in_flight.as_ref().map(|a| a.attempt), Some(1));
        }
    }

    mod forward {
        use super::*;

        #[test]
        fn pending_saga_starts() {
            assert_eq!(History::created().plan(), NextAction::Start);
        }

        #[test]
        fn first_attempt_has_no_delay() {
            assert_eq!(
                History::running().plan(),
                execute(Forward, 0, 1, Duration::ZERO)
            );
        }

        #[test]
        fn retries_wait_for_backoff() {
            let plan = History::running()
                .success(Forward, 0, 1)
                .failure(Forward, 1, 1, false)
                .failure(Forward, 1, 2, false)
                .plan();

            assert_eq!(plan, execute(Forward, 1, 3, Duration::from_secs(2)));
        }

        #[test]
        fn in_doubt_attempt_is_resumed_with_same_number() {
            let history = History::running().success(Forward, 0, 1).started(Forward, 1, 1);

            let NextAction::Execute(planned) = history.plan() else {
                panic!("expected an attempt");
            };

            assert_eq!((planned.index, planned.attempt), (1, 1));
            assert_eq!(planned.delay, Duration::ZERO);
            assert!(planned.resume.is_some());
        }

        #[test]
        fn all_steps_done_completes() {
            let plan = History::running()
                .success(Forward, 0, 1)
                .success(Forward, 1, 1)
                .success(Forward, 2, 1)
                .plan();

            assert_eq!(plan, NextAction::Finish(SagaStatus::Completed));
        }

        #[test]
        fn terminal_failure_begins_compensation() {
            let plan = History::running()
                .success(Forward, 0, 1)
                .failure(Forward, 1, 3, true)
                .plan();

            assert_eq!(plan, NextAction::BeginCompensation);
        }

        #[test]
        fn cancellation_waits_for_in_doubt_attempt() {
            let history = History::running()
                .started(Forward, 0, 1)
                .cancel_requested();
            assert!(matches!(history.plan(), NextAction::Execute(_)));

            let history = History::running()
                .success(Forward, 0, 1)
                .cancel_requested();
            assert_eq!(history.plan(), NextAction::BeginCompensation);
        }

        #[test]
        fn terminal_sagas_are_done() {
            let plan = History::running()
                .success(Forward, 0, 1)
                .success(Forward, 1, 1)
                .success(Forward, 2, 1)
                .transition(SagaStatus::Running, SagaStatus::Completed)
                .plan();

            assert_eq!(plan, NextAction::Done);
        }
    }

    mod compensating {
        use super::*;

        fn failed_at_car() -> History {
            History::running()
                .success(Forward, 0, 1)
                .success(Forward, 1, 1)
                .failure(Forward, 2, 1, true)
                .transition(SagaStatus::Running, SagaStatus::Compensating)
        }

        #[test]
        fn compensates_highest_succeeded_step_first() {
            assert_eq!(
                failed_at_car().plan(),
                execute(Compensation, 1, 1, Duration::ZERO)
            );
        }

        #[test]
        fn moves_down_after_success() {
            let plan = failed_at_car().success(Compensation, 1, 1).plan();

            assert_eq!(plan, execute(Compensation, 0, 1, Duration::ZERO));
        }

        #[test]
        fn all_compensated_finishes() {
            let plan = failed_at_car()
                .success(Compensation, 1, 1)
                .success(Compensation, 0, 1)
                .plan();

            assert_eq!(plan, NextAction::Finish(SagaStatus::Compensated));
        }

        #[test]
        fn exhausted_compensation_fails_after_remaining_undo() {
            let history = failed_at_car().failure(Compensation, 1, 10, true);
            assert_eq!(
                history.plan(),
                execute(Compensation, 0, 1, Duration::ZERO)
            );

            let plan = history.success(Compensation, 0, 1).plan();
            assert_eq!(plan, NextAction::Finish(SagaStatus::Failed));
        }

        #[test]
        fn nothing_to_undo_compensates_immediately() {
            let plan = History::running()
                .failure(Forward, 0, 1, true)
                .transition(SagaStatus::Running, SagaStatus::Compensating)
                .plan();

            assert_eq!(plan, NextAction::Finish(SagaStatus::Compensated));
        }
    }
}
