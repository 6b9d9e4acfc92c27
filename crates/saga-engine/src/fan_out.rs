use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use saga_core::{ActionError, ActionKind, ErrorKind};
use saga_retry::RetryPolicy;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::action::{Action, ActionContext};

struct Branch {
    name: String,
    forward: Arc<dyn Action>,
    compensate: Option<Arc<dyn Action>>,
}

/// Several independent actions run concurrently as a single step.
///
/// The step succeeds only if every branch succeeds; its payload is an object
/// keyed by branch name. When the step fails for good (a permanent branch
/// error, or a transient one on the final attempt) the branches that did
/// succeed are rolled back before the failure is reported. Each branch gets
/// its own idempotency token derived from the step token.
pub struct FanOut {
    branches: Vec<Branch>,
    rollback_retry: RetryPolicy,
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            rollback_retry: RetryPolicy::compensation_default(),
        }
    }
}

impl FanOut {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A branch with nothing to undo.
    #[must_use]
    pub fn branch(mut self, name: impl Into<String>, forward: Arc<dyn Action>) -> Self {
        self.branches.push(Branch {
            name: name.into(),
            forward,
            compensate: None,
        });
        self
    }

    #[must_use]
    pub fn compensated_branch(
        mut self,
        name: impl Into<String>,
        forward: Arc<dyn Action>,
        compensate: Arc<dyn Action>,
    ) -> Self {
        self.branches.push(Branch {
            name: name.into(),
            forward,
            compensate: Some(compensate),
        });
        self
    }

    /// Retry policy for rolling back succeeded branches after a partial
    /// failure.
    #[must_use]
    pub fn with_rollback_retry(mut self, policy: RetryPolicy) -> Self {
        self.rollback_retry = policy;
        self
    }

    pub(crate) fn has_compensation(&self) -> bool {
        self.branches.iter().any(|b| b.compensate.is_some())
    }

    pub(crate) fn compensation(self: &Arc<Self>) -> Arc<FanOutCompensation> {
        Arc::new(FanOutCompensation {
            fan_out: Arc::clone(self),
        })
    }

    /// Undoes one branch, retrying per the rollback policy. Returns the last
    /// error if the policy is exhausted.
    async fn roll_back(
        &self,
        branch: &Branch,
        ctx: &ActionContext,
        result: &Value,
    ) -> Result<(), ActionError> {
        let Some(compensate) = &branch.compensate else {
            return Ok(());
        };
        let mut attempt = 1;
        loop {
            let mut branch_ctx =
                ctx.for_branch(ActionKind::Compensation, &branch.name, Some(result.clone()));
            branch_ctx.attempt = attempt;
            match compensate.invoke(branch_ctx).await {
                Ok(_) => return Ok(()),
                Err(err) if self.rollback_retry.should_retry(attempt, err.kind) => {
                    warn!(
                        saga_id = %ctx.saga_id(),
                        step = %ctx.step_name(),
                        branch = %branch.name,
                        attempt,
                        error = %err,
                        "fan-out branch rollback failed, retrying"
                    );
                    tokio::time::sleep(self.rollback_retry.next_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Action for FanOut {
    async fn invoke(&self, ctx: ActionContext) -> Result<Value, ActionError> {
        let results = join_all(self.branches.iter().map(|branch| {
            branch
                .forward
                .invoke(ctx.for_branch(ActionKind::Forward, &branch.name, None))
        }))
        .await;

        let mut succeeded = Map::new();
        let mut failed = Vec::new();
        for (branch, result) in self.branches.iter().zip(results) {
            match result {
                Ok(payload) => {
                    succeeded.insert(branch.name.clone(), payload);
                }
                Err(err) => failed.push((branch.name.as_str(), err)),
            }
        }
        if failed.is_empty() {
            return Ok(Value::Object(succeeded));
        }

        let permanent = failed.iter().any(|(_, err)| err.is_permanent());
        let mut message = format!(
            "fan-out branches failed: {}",
            failed
                .iter()
                .map(|(name, err)| format!("{name} ({err})"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        // Retrying re-invokes every branch under the same tokens, so succeeded
        // branches are only undone once no retry will follow.
        if !permanent && !ctx.is_final_attempt() {
            return Err(ActionError::transient(message));
        }

        let ctx = &ctx;
        let rollbacks = join_all(
            self.branches
                .iter()
                .filter_map(|branch| Some((branch, succeeded.get(&branch.name)?)))
                .map(|(branch, result)| async move {
                    (branch.name.as_str(), self.roll_back(branch, ctx, result).await)
                }),
        )
        .await;
        let unresolved: Vec<&str> = rollbacks
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(name, _)| *name)
            .collect();

        if unresolved.is_empty() {
            let kind = if permanent {
                ErrorKind::Permanent
            } else {
                ErrorKind::Transient
            };
            return Err(ActionError::new(kind, message));
        }
        error!(
            saga_id = %ctx.saga_id(),
            step = %ctx.step_name(),
            branches = %unresolved.join(", "),
            "fan-out rollback incomplete, manual intervention required"
        );
        message.push_str(&format!("; rollback incomplete for: {}", unresolved.join(", ")));
        Err(ActionError::permanent(message).with_uncompensated(unresolved))
    }
}

/// Compensation of a whole fan-out step: every branch is undone.
pub(crate) struct FanOutCompensation {
    fan_out: Arc<FanOut>,
}

#[async_trait]
impl Action for FanOutCompensation {
    async fn invoke(&self, ctx: ActionContext) -> Result<Value, ActionError> {
        let outcomes = join_all(self.fan_out.branches.iter().filter_map(|branch| {
            let compensate = branch.compensate.as_ref()?;
            let result = ctx.forward_result().and_then(|r| r.get(&branch.name)).cloned();
            let branch_ctx = ctx.for_branch(ActionKind::Compensation, &branch.name, result);
            Some(async move { (branch.name.as_str(), compensate.invoke(branch_ctx).await) })
        }))
        .await;

        let failed: Vec<_> = outcomes
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|err| (name, err)))
            .collect();
        if failed.is_empty() {
            return Ok(Value::Null);
        }
        let all_permanent = failed.iter().all(|(_, err)| err.is_permanent());
        let message = format!(
            "fan-out branch compensation failed: {}",
            failed
                .iter()
                .map(|(name, err)| format!("{name} ({err})"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let kind = if all_permanent {
            ErrorKind::Permanent
        } else {
            ErrorKind::Transient
        };
        Err(ActionError::new(kind, message))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use saga_core::SagaId;
    use serde_json::json;

    use super::*;
    use crate::action::action_fn;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn recording(calls: &Calls, label: &'static str, fail: Option<ActionError>) -> Arc<dyn Action> {
        let calls = Arc::clone(calls);
        action_fn(move |ctx: ActionContext| {
            let calls = Arc::clone(&calls);
            let fail = fail.clone();
            async move {
                calls.lock().push(format!("{label}@{}", ctx.token()));
                match fail {
                    Some(err) => Err(err),
                    None => Ok(json!(label)),
                }
            }
        })
    }

    fn ctx(id: SagaId) -> ActionContext {
        ActionContext::detached(id, 1, ActionKind::Forward, json!({}))
    }

    fn fast_rollback() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(2)
            .with_initial_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn all_branches_succeed() {
        let calls = Calls::default();
        let fan_out = FanOut::new()
            .branch("hotel", recording(&calls, "hotel", None))
            .branch("car", recording(&calls, "car", None));
        let id = SagaId::new();

        let payload = fan_out.invoke(ctx(id)).await.expect("both succeed");

        assert_eq!(payload, json!({"hotel": "hotel", "car": "car"}));
        let calls = calls.lock();
        assert!(calls.contains(&format!("hotel@{id}:1:forward/hotel")));
        assert!(calls.contains(&format!("car@{id}:1:forward/car")));
    }

    #[tokio::test]
    async fn transient_failure_defers_rollback_to_the_last_attempt() {
        let calls = Calls::default();
        let fan_out = FanOut::new()
            .compensated_branch(
                "hotel",
                recording(&calls, "hotel", None),
                recording(&calls, "undo-hotel", None),
            )
            .branch("car", recording(&calls, "car", Some(ActionError::transient("busy"))));

        let err = fan_out
            .invoke(ctx(SagaId::new()))
            .await
            .expect_err("car failed");

        assert!(!err.is_permanent());
        assert!(!calls.lock().iter().any(|c| c.starts_with("undo-hotel")));
    }

    #[tokio::test]
    async fn permanent_failure_rolls_back_succeeded_branches() {
        let calls = Calls::default();
        let fan_out = FanOut::new()
            .compensated_branch(
                "hotel",
                recording(&calls, "hotel", None),
                recording(&calls, "undo-hotel", None),
            )
            .compensated_branch(
                "car",
                recording(&calls, "car", Some(ActionError::permanent("sold out"))),
                recording(&calls, "undo-car", None),
            );
        let id = SagaId::new();

        let err = fan_out.invoke(ctx(id)).await.expect_err("car failed");

        assert!(err.is_permanent());
        assert!(err.message.contains("car"));
        assert!(!err.left_effects());
        let calls = calls.lock();
        assert!(calls.contains(&format!("undo-hotel@{id}:1:compensation/hotel")));
        assert!(!calls.iter().any(|c| c.starts_with("undo-car")));
    }

    #[tokio::test]
    async fn final_attempt_rolls_back_and_stays_transient() {
        let calls = Calls::default();
        let fan_out = FanOut::new()
            .compensated_branch(
                "hotel",
                recording(&calls, "hotel", None),
                recording(&calls, "undo-hotel", None),
            )
            .branch("car", recording(&calls, "car", Some(ActionError::transient("busy"))));

        let err = fan_out
            .invoke(ctx(SagaId::new()).with_final_attempt(true))
            .await
            .expect_err("car failed");

        assert!(!err.is_permanent());
        assert!(calls.lock().iter().any(|c| c.starts_with("undo-hotel")));
    }

    #[tokio::test]
    async fn failed_rollback_is_permanent_and_named() {
        let calls = Calls::default();
        let fan_out = FanOut::new()
            .compensated_branch(
                "hotel",
                recording(&calls, "hotel", None),
                recording(&calls, "undo-hotel", Some(ActionError::transient("down"))),
            )
            .branch("car", recording(&calls, "car", Some(ActionError::permanent("sold out"))))
            .with_rollback_retry(fast_rollback());

        let err = fan_out
            .invoke(ctx(SagaId::new()))
            .await
            .expect_err("car failed");

        assert!(err.is_permanent());
        assert!(err.message.contains("rollback incomplete for: hotel"));
        assert_eq!(err.uncompensated, vec!["hotel".to_string()]);
        let undo_attempts = calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("undo-hotel"))
            .count();
        assert_eq!(undo_attempts, 2);
    }

    #[tokio::test]
    async fn step_compensation_undoes_every_branch() {
        let calls = Calls::default();
        let fan_out = Arc::new(
            FanOut::new()
                .compensated_branch(
                    "hotel",
                    recording(&calls, "hotel", None),
                    recording(&calls, "undo-hotel", None),
                )
                .branch("car", recording(&calls, "car", None)),
        );
        let id = SagaId::new();
        let mut undo_ctx = ActionContext::detached(id, 1, ActionKind::Compensation, json!({}));
        undo_ctx.forward_result = Some(json!({"hotel": "H-1", "car": "C-1"}));

        fan_out
            .compensation()
            .invoke(undo_ctx)
            .await
            .expect("undo succeeds");

        assert_eq!(
            *calls.lock(),
            vec![format!("undo-hotel@{id}:1:compensation/hotel")]
        );
        assert!(fan_out.has_compensation());
    }
}
