use std::sync::Arc;

use async_trait::async_trait;
use saga_core::ActionError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::action::{Action, ActionContext};

/// An action with typed input and output.
///
/// The saga input is decoded into `Input` before `run` is called, and the
/// returned `Output` is encoded into the JSON payload stored in the log.
#[async_trait]
pub trait TypedAction: Send + Sync + 'static {
    /// Decoded from the saga input.
    type Input: DeserializeOwned + Send;

    /// Recorded as the step result.
    type Output: Serialize + Send;

    /// # Errors
    ///
    /// Returns an `ActionError` classified at the source.
    async fn run(&self, ctx: &ActionContext, input: Self::Input)
    -> Result<Self::Output, ActionError>;
}

pub(crate) struct TypedWrapper<A> {
    action: A,
}

#[async_trait]
impl<A: TypedAction> Action for TypedWrapper<A> {
    async fn invoke(&self, ctx: ActionContext) -> Result<Value, ActionError> {
        let input = ctx.input_as::<A::Input>()?;
        let output = self.action.run(&ctx, input).await?;
        serde_json::to_value(output)
            .map_err(|e| ActionError::permanent(format!("unencodable action output: {e}")))
    }
}

/// Erases a [`TypedAction`] so it can be used as a step action.
pub fn typed<A: TypedAction>(action: A) -> Arc<dyn Action> {
    Arc::new(TypedWrapper { action })
}
