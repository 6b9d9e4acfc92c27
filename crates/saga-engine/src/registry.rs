use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use saga_config::{DefinitionOverrides, EngineConfig, StepOverrides};
use saga_retry::RetryPolicy;
use tracing::debug;

use crate::action::Action;
use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{EngineError, Result};

/// A step with every policy resolved against engine configuration.
pub(crate) struct ResolvedStep {
    pub(crate) name: Arc<str>,
    pub(crate) forward: Arc<dyn Action>,
    pub(crate) compensate: Option<Arc<dyn Action>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) compensation_retry: RetryPolicy,
    pub(crate) timeout: Duration,
}

/// A registered definition; what drivers execute.
pub(crate) struct ResolvedDefinition {
    pub(crate) name: String,
    pub(crate) steps: Vec<ResolvedStep>,
}

impl ResolvedDefinition {
    /// Later sources win: engine defaults, then the definition's own
    /// settings, then configured per-definition and per-step overrides.
    pub(crate) fn resolve(definition: SagaDefinition, config: &EngineConfig) -> Result<Self> {
        let (name, steps) = definition.into_steps();
        let no_overrides = DefinitionOverrides::default();
        let overrides = config.definition(&name).unwrap_or(&no_overrides);
        overrides.check_steps(&name, steps.iter().map(StepDefinition::name))?;

        let steps = steps
            .into_iter()
            .map(|step| resolve_step(&name, step, config, overrides))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { name, steps })
    }

    pub(crate) fn step_name(&self, index: usize) -> &str {
        self.steps.get(index).map_or("<unknown>", |s| &s.name)
    }
}

fn resolve_step(
    definition: &str,
    step: StepDefinition,
    config: &EngineConfig,
    overrides: &DefinitionOverrides,
) -> Result<ResolvedStep> {
    let no_step_overrides = StepOverrides::default();
    let step_overrides = overrides.step(&step.name).unwrap_or(&no_step_overrides);
    let section = format!("definitions.{definition}");
    let step_section = format!("{section}.steps.{}", step.name);

    let mut retry = step.retry.unwrap_or(*config.retry());
    if let Some(o) = overrides.retry() {
        retry = o.apply(&retry, &format!("{section}.retry"))?;
    }
    if let Some(o) = step_overrides.retry() {
        retry = o.apply(&retry, &format!("{step_section}.retry"))?;
    }

    let mut compensation_retry = step
        .compensation_retry
        .unwrap_or(*config.compensation_retry());
    if let Some(o) = overrides.compensation_retry() {
        compensation_retry = o.apply(&compensation_retry, &format!("{section}.compensation_retry"))?;
    }
    if let Some(o) = step_overrides.compensation_retry() {
        compensation_retry =
            o.apply(&compensation_retry, &format!("{step_section}.compensation_retry"))?;
    }

    let timeout = step_overrides
        .timeout()
        .or(overrides.step_timeout())
        .or(step.timeout)
        .unwrap_or(config.step_timeout());

    Ok(ResolvedStep {
        name: Arc::from(step.name),
        forward: step.forward,
        compensate: step.compensate,
        retry,
        compensation_retry,
        timeout,
    })
}

/// Definitions known to an engine, by name.
#[derive(Default)]
pub(crate) struct Registry {
    definitions: RwLock<HashMap<String, Arc<ResolvedDefinition>>>,
}

impl Registry {
    pub(crate) fn register(&self, definition: SagaDefinition, config: &EngineConfig) -> Result<()> {
        let resolved = ResolvedDefinition::resolve(definition, config)?;
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&resolved.name) {
            return Err(EngineError::DuplicateDefinition(resolved.name));
        }
        debug!(
            definition = %resolved.name,
            steps = resolved.steps.len(),
            "registered saga definition"
        );
        definitions.insert(resolved.name.clone(), Arc::new(resolved));
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Result<Arc<ResolvedDefinition>> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))
    }
}
