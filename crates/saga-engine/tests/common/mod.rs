#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use saga_core::{ActionKind, AttemptOutcome, LogRecord, SagaId};
use saga_engine::{
    Action, ActionContext, ActionError, EngineConfig, MemoryStepLog, RetryPolicy, SagaEngine,
    StepLog, action_fn,
};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub step: String,
    pub kind: ActionKind,
    pub attempt: u32,
    pub token: String,
}

/// Shared record of every action invocation, in call order.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, step: &str, kind: ActionKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.step == step && c.kind == kind)
            .count()
    }

    /// Steps whose compensation was invoked, in invocation order.
    pub fn compensations(&self) -> Vec<String> {
        let mut steps: Vec<String> = Vec::new();
        for call in self.calls.lock().iter() {
            if call.kind == ActionKind::Compensation && steps.last() != Some(&call.step) {
                steps.push(call.step.clone());
            }
        }
        steps
    }

    /// Always succeeds, returning the step name and token.
    pub fn ok(&self, step: &str) -> Arc<dyn Action> {
        self.scripted(step, Vec::new())
    }

    /// Fails attempt `n` with `failures[n - 1]`, succeeds once the script
    /// runs out.
    pub fn scripted(&self, step: &str, failures: Vec<ActionError>) -> Arc<dyn Action> {
        let calls = Arc::clone(&self.calls);
        let step = step.to_string();
        action_fn(move |ctx: ActionContext| {
            calls.lock().push(Call {
                step: step.clone(),
                kind: ctx.kind(),
                attempt: ctx.attempt(),
                token: ctx.token().to_string(),
            });
            let index = usize::try_from(ctx.attempt()).unwrap_or(usize::MAX) - 1;
            let outcome = match failures.get(index) {
                Some(err) => Err(err.clone()),
                None => Ok(json!({ "step": step.clone(), "token": ctx.token().to_string() })),
            };
            async move { outcome }
        })
    }

    /// Never succeeds.
    pub fn failing(&self, step: &str, error: ActionError) -> Arc<dyn Action> {
        self.scripted(step, vec![error; 64])
    }
}

/// Millisecond backoff so retry tests run fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(5),
        2.0,
    )
    .expect("valid policy")
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(fast_retry(3))
        .with_compensation_retry(fast_retry(3))
        .with_log_write_retry(fast_retry(5))
        .with_step_timeout(Duration::from_secs(5))
}

pub fn engine(log: &Arc<MemoryStepLog>) -> SagaEngine {
    SagaEngine::new(Arc::clone(log) as Arc<dyn StepLog>, fast_config())
}

pub async fn history(log: &Arc<MemoryStepLog>, id: SagaId) -> Vec<LogRecord> {
    log.read_history(id).await.expect("saga has history")
}

/// `(step, kind, outcome)` of every finished attempt, `Started` records
/// omitted.
pub async fn outcomes(
    log: &Arc<MemoryStepLog>,
    id: SagaId,
) -> Vec<(usize, ActionKind, &'static str)> {
    history(log, id)
        .await
        .iter()
        .filter_map(LogRecord::as_attempt)
        .filter_map(|a| {
            let outcome = match a.outcome {
                AttemptOutcome::Started => return None,
                AttemptOutcome::Success { .. } => "success",
                AttemptOutcome::Failure { .. } => "failure",
                AttemptOutcome::Timeout { .. } => "timeout",
                AttemptOutcome::Skipped => "skipped",
            };
            Some((a.step_index, a.kind, outcome))
        })
        .collect()
}

pub fn payload(step: &str, token: &str) -> Value {
    json!({ "step": step, "token": token })
}
