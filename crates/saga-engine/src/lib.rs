//! Durable saga orchestration.
//!
//! A saga is a named, ordered list of steps. Each step has a forward action
//! and, optionally, a compensating action that undoes it. The engine runs the
//! forward actions in order, retrying transient failures with exponential
//! backoff; when a step fails for good (or the saga is cancelled) it undoes
//! the completed steps in reverse order.
//!
//! Every attempt is written to a [`StepLog`] before and after the action runs.
//! The log is the only source of truth: status reports and crash recovery are
//! both rebuilt from it, and an attempt whose outcome was never recorded is
//! re-invoked with the same [`IdempotencyToken`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use saga_engine::{
//!     ActionContext, ActionError, EngineConfig, SagaDefinition, SagaEngine, StepDefinition,
//!     action_fn,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SagaEngine::from_config(EngineConfig::default())?;
//! engine.register(
//!     SagaDefinition::builder("booking")
//!         .step(
//!             StepDefinition::new(
//!                 "flight",
//!                 action_fn(|ctx: ActionContext| async move {
//!                     Ok(json!({ "reservation": ctx.token().to_string() }))
//!                 }),
//!             )
//!             .with_compensation(action_fn(|_: ActionContext| async { Ok(json!(null)) })),
//!         )
//!         .step(StepDefinition::new(
//!             "payment",
//!             action_fn(|_: ActionContext| async {
//!                 Err::<serde_json::Value, _>(ActionError::permanent("card declined"))
//!             }),
//!         ))
//!         .build()?,
//! )?;
//!
//! engine.recover().await?;
//! let id = engine.create_saga("booking", json!({ "customer": "ada" })).await?;
//! let report = engine.wait(id).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

mod action;
mod compensation;
mod definition;
mod durable;
mod engine;
mod error;
mod fan_out;
mod orchestrator;
mod registry;
mod replay;
mod status;
mod typed;

pub use action::{Action, ActionContext, FnAction, action_fn};
pub use definition::{DefinitionBuilder, Empty, HasSteps, SagaDefinition, StepDefinition};
pub use engine::{RecoveryReport, SagaEngine};
pub use error::{CompensationExhaustedError, DefinitionError, EngineError, Result};
pub use fan_out::FanOut;
pub use saga_config::EngineConfig;
pub use saga_core::{
    ActionError, ActionKind, ErrorKind, IdempotencyToken, SagaId, SagaStatus,
};
pub use saga_log::{FileStepLog, MemoryStepLog, StepLog};
pub use saga_retry::RetryPolicy;
pub use status::{StatusReport, StepReport, StepState};
pub use typed::{TypedAction, typed};
