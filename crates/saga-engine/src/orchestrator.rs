use std::sync::Arc;
use std::time::Duration;

use saga_core::{
    ActionError, ActionKind, AttemptOutcome, ErrorKind, IdempotencyToken, LogRecord, SagaStatus,
    StepAttempt,
};
use saga_retry::RetryPolicy;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionContext};
use crate::durable::DurableWriter;
use crate::error::Result;
use crate::registry::ResolvedDefinition;
use crate::replay::{NextAction, PlannedAttempt, Replay, plan};

/// Drives one saga instance until it reaches a terminal status.
///
/// Every decision comes from [`plan`] over the folded history, and every
/// record is appended before the in-memory state moves on.
pub(crate) struct Driver {
    pub(crate) replay: Replay,
    pub(crate) definition: Arc<ResolvedDefinition>,
    writer: DurableWriter,
    cancel: watch::Receiver<bool>,
}

enum Invocation {
    Failed(ActionError),
    TimedOut,
}

impl Driver {
    pub(crate) fn new(
        replay: Replay,
        definition: Arc<ResolvedDefinition>,
        writer: DurableWriter,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            replay,
            definition,
            writer,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) -> Result<SagaStatus> {
        loop {
            if *self.cancel.borrow_and_update() {
                self.replay.cancel_requested = true;
            }
            match plan(&self.replay, &self.definition) {
                NextAction::Done => return Ok(self.replay.status),
                NextAction::Start => self.transition(SagaStatus::Running).await?,
                NextAction::BeginCompensation => {
                    if self.replay.cancel_requested {
                        info!(saga_id = %self.replay.saga_id, "saga cancelled, compensating");
                    } else {
                        warn!(
                            saga_id = %self.replay.saga_id,
                            error = self.replay.last_error.as_deref().unwrap_or("unknown"),
                            "saga step failed, compensating"
                        );
                    }
                    self.transition(SagaStatus::Compensating).await?;
                }
                NextAction::Finish(status) => self.transition(status).await?,
                NextAction::Execute(planned) => match planned.kind {
                    ActionKind::Forward => self.execute_step(planned).await?,
                    ActionKind::Compensation => self.compensate_step(planned).await?,
                },
            }
        }
    }

    pub(crate) async fn record(&mut self, record: LogRecord) -> Result<()> {
        self.writer.append(&record).await?;
        self.replay.apply(&record)
    }

    async fn transition(&mut self, to: SagaStatus) -> Result<()> {
        let from = self.replay.status;
        from.transition(to)?;
        self.record(LogRecord::transition(self.replay.saga_id, from, to))
            .await?;
        info!(
            saga_id = %self.replay.saga_id,
            definition = %self.definition.name,
            %from,
            %to,
            "saga status changed"
        );
        Ok(())
    }

    async fn execute_step(&mut self, planned: PlannedAttempt) -> Result<()> {
        if !planned.delay.is_zero() && !self.backoff(planned.delay).await {
            return Ok(());
        }
        let definition = Arc::clone(&self.definition);
        let step = &definition.steps[planned.index];
        let outcome = self
            .attempt(&planned, Arc::clone(&step.forward), step.timeout, &step.retry, None)
            .await?;

        let saga_id = self.replay.saga_id;
        match &outcome {
            AttemptOutcome::Success { .. } => {
                debug!(%saga_id, step = %step.name, attempt = planned.attempt, "step succeeded");
            }
            failure if failure.is_terminal_failure() => warn!(
                %saga_id,
                step = %step.name,
                attempt = planned.attempt,
                error = failure.error_message().as_deref().unwrap_or_default(),
                "step failed permanently"
            ),
            failure => warn!(
                %saga_id,
                step = %step.name,
                attempt = planned.attempt,
                error = failure.error_message().as_deref().unwrap_or_default(),
                "step attempt failed, will retry"
            ),
        }
        Ok(())
    }

    /// Runs one write-ahead attempt: `Started`, invoke, outcome.
    ///
    /// An in-doubt attempt is re-invoked under its existing `Started` record.
    pub(crate) async fn attempt(
        &mut self,
        planned: &PlannedAttempt,
        action: Arc<dyn Action>,
        timeout: Duration,
        policy: &RetryPolicy,
        forward_result: Option<Value>,
    ) -> Result<AttemptOutcome> {
        let saga_id = self.replay.saga_id;
        let started = if let Some(started) = &planned.resume {
            info!(
                %saga_id,
                step = planned.index,
                kind = %planned.kind,
                attempt = planned.attempt,
                "re-invoking in-doubt attempt"
            );
            started.clone()
        } else {
            let started = StepAttempt::started(saga_id, planned.index, planned.attempt, planned.kind);
            self.record(LogRecord::Attempt(started.clone())).await?;
            started
        };

        let ctx = self.context(planned, policy, forward_result);
        let outcome = match invoke(action, ctx, timeout).await {
            Ok(payload) => AttemptOutcome::Success { payload },
            Err(Invocation::Failed(error)) => {
                let terminal =
                    error.left_effects() || !policy.should_retry(planned.attempt, error.kind);
                AttemptOutcome::Failure { error, terminal }
            }
            Err(Invocation::TimedOut) => AttemptOutcome::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                terminal: !policy.should_retry(planned.attempt, ErrorKind::Transient),
            },
        };
        self.record(LogRecord::Attempt(started.finish(outcome.clone())))
            .await?;
        Ok(outcome)
    }

    fn context(
        &self,
        planned: &PlannedAttempt,
        policy: &RetryPolicy,
        forward_result: Option<Value>,
    ) -> ActionContext {
        let saga_id = self.replay.saga_id;
        ActionContext {
            saga_id,
            step_name: Arc::clone(&self.definition.steps[planned.index].name),
            step_index: planned.index,
            kind: planned.kind,
            attempt: planned.attempt,
            token: IdempotencyToken::derive(saga_id, planned.index, planned.kind),
            input: Arc::clone(&self.replay.input),
            step_results: Arc::new(self.replay.step_results(&self.definition)),
            forward_result,
            final_attempt: !policy.should_retry(planned.attempt, ErrorKind::Transient),
        }
    }

    /// Waits out a retry delay. Returns `false` if cancellation arrived first.
    async fn backoff(&mut self, delay: Duration) -> bool {
        debug!(
            saga_id = %self.replay.saga_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before retry"
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                changed = self.cancel.changed() => match changed {
                    Ok(()) if *self.cancel.borrow_and_update() => {
                        self.replay.cancel_requested = true;
                        return false;
                    }
                    Ok(()) => {}
                    Err(_) => {
                        sleep.await;
                        return true;
                    }
                },
            }
        }
    }
}

/// Invokes an action on its own task so a panic or an overrun cannot take
/// the driver down with it.
async fn invoke(
    action: Arc<dyn Action>,
    ctx: ActionContext,
    timeout: Duration,
) -> std::result::Result<Value, Invocation> {
    let mut task = tokio::spawn(async move { action.invoke(ctx).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result.map_err(Invocation::Failed),
        Ok(Err(join)) => Err(Invocation::Failed(ActionError::transient(format!(
            "action task failed: {join}"
        )))),
        Err(_) => {
            task.abort();
            Err(Invocation::TimedOut)
        }
    }
}
