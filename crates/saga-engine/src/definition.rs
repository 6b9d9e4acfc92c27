use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use saga_retry::RetryPolicy;

use crate::action::Action;
use crate::error::DefinitionError;
use crate::fan_out::FanOut;

/// One step of a saga: a forward action and, optionally, its compensation.
///
/// Retry policies and the timeout fall back to engine defaults when unset.
#[derive(Clone)]
pub struct StepDefinition {
    pub(crate) name: String,
    pub(crate) forward: Arc<dyn Action>,
    pub(crate) compensate: Option<Arc<dyn Action>>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) compensation_retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
}

impl StepDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, forward: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            forward,
            compensate: None,
            retry: None,
            compensation_retry: None,
            timeout: None,
        }
    }

    /// A step running several branches concurrently as one unit.
    ///
    /// The step is compensated by compensating every branch.
    #[must_use]
    pub fn fan_out(name: impl Into<String>, fan_out: FanOut) -> Self {
        let fan_out = Arc::new(fan_out);
        let compensate = fan_out
            .has_compensation()
            .then(|| fan_out.compensation() as Arc<dyn Action>);
        Self {
            compensate,
            ..Self::new(name, fan_out)
        }
    }

    #[must_use]
    pub fn with_compensation(mut self, compensate: Arc<dyn Action>) -> Self {
        self.compensate = Some(compensate);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Some(policy);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .field("retry", &self.retry)
            .field("compensation_retry", &self.compensation_retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Marker type for a builder with no steps.
pub struct Empty;

/// Marker type for a builder with at least one step.
pub struct HasSteps;

/// Type-state builder for saga definitions.
///
/// A definition without steps cannot be built:
///
/// ```compile_fail
/// use saga_engine::SagaDefinition;
///
/// // `build()` is only available after the first `step()`
/// let definition = SagaDefinition::builder("empty").build();
/// ```
pub struct DefinitionBuilder<State> {
    name: String,
    steps: Vec<StepDefinition>,
    _state: PhantomData<State>,
}

impl<State> DefinitionBuilder<State> {
    /// Append a step. Steps run in the order they are added.
    #[must_use]
    pub fn step(self, step: StepDefinition) -> DefinitionBuilder<HasSteps> {
        let mut steps = self.steps;
        steps.push(step);
        DefinitionBuilder {
            name: self.name,
            steps,
            _state: PhantomData,
        }
    }
}

impl DefinitionBuilder<HasSteps> {
    /// # Errors
    ///
    /// Returns `DefinitionError` if the definition or a step has an empty
    /// name, or two steps share a name.
    pub fn build(self) -> Result<SagaDefinition, DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(DefinitionError::EmptyStepName(self.name));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    definition: self.name.clone(),
                    step: step.name.clone(),
                });
            }
        }
        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
        })
    }
}

/// Named, ordered list of steps. Immutable once built.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder<Empty> {
        DefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub(crate) fn into_steps(self) -> (String, Vec<StepDefinition>) {
        (self.name, self.steps)
    }
}
