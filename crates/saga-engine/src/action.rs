use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use saga_core::{ActionError, ActionKind, IdempotencyToken, SagaId};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Everything an action receives for one invocation.
///
/// The idempotency token is the same for every attempt of the same
/// `(saga, step, kind)`; an action must use it to key its external effect so
/// a repeated call has no duplicate effect.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub(crate) saga_id: SagaId,
    pub(crate) step_name: Arc<str>,
    pub(crate) step_index: usize,
    pub(crate) kind: ActionKind,
    pub(crate) attempt: u32,
    pub(crate) token: IdempotencyToken,
    pub(crate) input: Arc<Value>,
    pub(crate) step_results: Arc<IndexMap<String, Value>>,
    pub(crate) forward_result: Option<Value>,
    pub(crate) final_attempt: bool,
}

impl ActionContext {
    /// Context for invoking an action outside a running saga, e.g. in tests
    /// of the action itself.
    #[must_use]
    pub fn detached(saga_id: SagaId, step_index: usize, kind: ActionKind, input: Value) -> Self {
        Self {
            saga_id,
            step_name: Arc::from(""),
            step_index,
            kind,
            attempt: 1,
            token: IdempotencyToken::derive(saga_id, step_index, kind),
            input: Arc::new(input),
            step_results: Arc::new(IndexMap::new()),
            forward_result: None,
            final_attempt: false,
        }
    }

    /// Marks the invocation as the last one the retry policy allows.
    #[must_use]
    pub fn with_final_attempt(mut self, final_attempt: bool) -> Self {
        self.final_attempt = final_attempt;
        self
    }

    #[must_use]
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    #[must_use]
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// 1-based attempt number of this invocation.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// No further attempt follows if this one fails transiently.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.final_attempt
    }

    #[must_use]
    pub fn token(&self) -> &IdempotencyToken {
        &self.token
    }

    /// The input the saga was triggered with.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Decodes the saga input.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the input does not match `T`; retrying
    /// cannot fix malformed input.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, ActionError> {
        T::deserialize(&*self.input)
            .map_err(|e| ActionError::permanent(format!("invalid saga input: {e}")))
    }

    /// Recorded result of an earlier, successful step.
    #[must_use]
    pub fn step_result(&self, step: &str) -> Option<&Value> {
        self.step_results.get(step)
    }

    /// Results of all earlier successful steps, in step order.
    #[must_use]
    pub fn step_results(&self) -> &IndexMap<String, Value> {
        &self.step_results
    }

    /// For compensations: the recorded result of this step's forward action.
    #[must_use]
    pub fn forward_result(&self) -> Option<&Value> {
        self.forward_result.as_ref()
    }

    /// Context for one branch of a fan-out step. Branch tokens extend the
    /// step token of the given kind.
    pub(crate) fn for_branch(
        &self,
        kind: ActionKind,
        branch: &str,
        forward_result: Option<Value>,
    ) -> Self {
        Self {
            kind,
            token: IdempotencyToken::derive(self.saga_id, self.step_index, kind).branch(branch),
            forward_result,
            ..self.clone()
        }
    }
}

/// A forward or compensating action.
///
/// Implementations classify their own failures as transient or permanent and
/// must be safe to invoke more than once with the same token.
#[async_trait]
pub trait Action: Send + Sync {
    /// # Errors
    ///
    /// Returns an `ActionError` classified at the source.
    async fn invoke(&self, ctx: ActionContext) -> Result<Value, ActionError>;
}

/// Adapter letting an async closure act as an [`Action`].
pub struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send,
{
    async fn invoke(&self, ctx: ActionContext) -> Result<Value, ActionError> {
        (self.f)(ctx).await
    }
}

/// Wraps an async closure as a shareable action.
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    Arc::new(FnAction { f })
}
