use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use saga_retry::RetryPolicy;

use crate::Result;
use crate::error::ConfigError;
use crate::raw::{RawConfig, RawDefinition, RawRetry, RawStep};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Partial retry policy; unset fields keep the value of the policy it is
/// applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryOverride {
    max_attempts: Option<u32>,
    initial_interval: Option<Duration>,
    max_interval: Option<Duration>,
    backoff_coefficient: Option<f64>,
}

impl RetryOverride {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = Some(coefficient);
        self
    }

    /// Overlay onto `base`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPolicy` if the merged policy is invalid.
    pub fn apply(&self, base: &RetryPolicy, section: &str) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.max_attempts.unwrap_or(base.max_attempts()),
            self.initial_interval.unwrap_or(base.initial_interval()),
            self.max_interval.unwrap_or(base.max_interval()),
            self.backoff_coefficient
                .unwrap_or(base.backoff_coefficient()),
        )
        .map_err(|source| ConfigError::InvalidPolicy {
            section: section.to_string(),
            source,
        })
    }
}

impl From<RawRetry> for RetryOverride {
    fn from(raw: RawRetry) -> Self {
        Self {
            max_attempts: raw.max_attempts,
            initial_interval: raw.initial_interval_ms.map(Duration::from_millis),
            max_interval: raw.max_interval_ms.map(Duration::from_millis),
            backoff_coefficient: raw.backoff_coefficient,
        }
    }
}

/// Per-step overrides from `[definitions.<name>.steps.<step>]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOverrides {
    timeout: Option<Duration>,
    retry: Option<RetryOverride>,
    compensation_retry: Option<RetryOverride>,
}

impl StepOverrides {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_compensation_retry(mut self, retry: RetryOverride) -> Self {
        self.compensation_retry = Some(retry);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn retry(&self) -> Option<&RetryOverride> {
        self.retry.as_ref()
    }

    #[must_use]
    pub fn compensation_retry(&self) -> Option<&RetryOverride> {
        self.compensation_retry.as_ref()
    }
}

impl From<RawStep> for StepOverrides {
    fn from(raw: RawStep) -> Self {
        Self {
            timeout: raw.timeout_ms.map(Duration::from_millis),
            retry: raw.retry.map(Into::into),
            compensation_retry: raw.compensation_retry.map(Into::into),
        }
    }
}

/// Overrides for one saga definition from `[definitions.<name>]`.
///
/// Applied once, when the definition is registered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionOverrides {
    step_timeout: Option<Duration>,
    retry: Option<RetryOverride>,
    compensation_retry: Option<RetryOverride>,
    steps: HashMap<String, StepOverrides>,
}

impl DefinitionOverrides {
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_compensation_retry(mut self, retry: RetryOverride) -> Self {
        self.compensation_retry = Some(retry);
        self
    }

    #[must_use]
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    #[must_use]
    pub fn retry(&self) -> Option<&RetryOverride> {
        self.retry.as_ref()
    }

    #[must_use]
    pub fn compensation_retry(&self) -> Option<&RetryOverride> {
        self.compensation_retry.as_ref()
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepOverrides> {
        self.steps.get(name)
    }

    #[must_use]
    pub fn with_step(mut self, name: impl Into<String>, step: StepOverrides) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    /// Rejects overrides for steps the definition does not have.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownStep` naming the first unknown step.
    pub fn check_steps<'a>(
        &self,
        definition: &str,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let known: Vec<&str> = step_names.into_iter().collect();
        let mut configured: Vec<&String> = self.steps.keys().collect();
        configured.sort();
        match configured.into_iter().find(|name| !known.contains(&name.as_str())) {
            Some(step) => Err(ConfigError::UnknownStep {
                definition: definition.to_string(),
                step: step.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl From<RawDefinition> for DefinitionOverrides {
    fn from(raw: RawDefinition) -> Self {
        Self {
            step_timeout: raw.step_timeout_ms.map(Duration::from_millis),
            retry: raw.retry.map(Into::into),
            compensation_retry: raw.compensation_retry.map(Into::into),
            steps: raw
                .steps
                .into_iter()
                .map(|(name, step)| (name, step.into()))
                .collect(),
        }
    }
}

/// Engine configuration.
///
/// ```toml
/// [engine]
/// log_dir = "/var/lib/sagas"
/// max_concurrent_sagas = 64
///
/// [defaults]
/// step_timeout_ms = 300000
///
/// [defaults.retry]
/// max_attempts = 3
/// initial_interval_ms = 1000
///
/// [definitions.booking.steps.book_hotel]
/// timeout_ms = 5000
/// retry = { max_attempts = 5 }
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    log_dir: Option<PathBuf>,
    max_concurrent_sagas: usize,
    log_write_retry: RetryPolicy,
    step_timeout: Duration,
    retry: RetryPolicy,
    compensation_retry: RetryPolicy,
    definitions: HashMap<String, DefinitionOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_concurrent_sagas: 0,
            log_write_retry: default_log_write_retry(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::compensation_default(),
            definitions: HashMap::new(),
        }
    }
}

fn default_log_write_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(5)
        .with_max_interval(Duration::from_secs(1))
        .with_initial_interval(Duration::from_millis(10))
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from TOML text. Missing sections keep defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let defaults = Self::default();

        let log_write_retry = resolve(
            raw.engine.log_write_retry,
            &defaults.log_write_retry,
            "engine.log_write_retry",
        )?;
        let retry = resolve(raw.defaults.retry, &defaults.retry, "defaults.retry")?;
        let compensation_retry = resolve(
            raw.defaults.compensation_retry,
            &defaults.compensation_retry,
            "defaults.compensation_retry",
        )?;

        let definitions: HashMap<String, DefinitionOverrides> = raw
            .definitions
            .into_iter()
            .map(|(name, def)| (name, def.into()))
            .collect();
        for (name, overrides) in &definitions {
            validate_overrides(name, overrides, &retry, &compensation_retry)?;
        }

        Ok(Self {
            log_dir: raw.engine.log_dir,
            max_concurrent_sagas: raw.engine.max_concurrent_sagas.unwrap_or(0),
            log_write_retry,
            step_timeout: raw
                .defaults
                .step_timeout_ms
                .map_or(defaults.step_timeout, Duration::from_millis),
            retry,
            compensation_retry,
            definitions,
        })
    }

    #[must_use]
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Maximum sagas driven at once; `0` means unbounded.
    #[must_use]
    pub fn max_concurrent_sagas(&self) -> usize {
        self.max_concurrent_sagas
    }

    #[must_use]
    pub fn log_write_retry(&self) -> &RetryPolicy {
        &self.log_write_retry
    }

    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn compensation_retry(&self) -> &RetryPolicy {
        &self.compensation_retry
    }

    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&DefinitionOverrides> {
        self.definitions.get(name)
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_max_concurrent_sagas(mut self, max: usize) -> Self {
        self.max_concurrent_sagas = max;
        self
    }

    #[must_use]
    pub fn with_log_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.log_write_retry = policy;
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = policy;
        self
    }

    #[must_use]
    pub fn with_definition(mut self, name: impl Into<String>, overrides: DefinitionOverrides) -> Self {
        self.definitions.insert(name.into(), overrides);
        self
    }
}

fn resolve(raw: Option<RawRetry>, base: &RetryPolicy, section: &str) -> Result<RetryPolicy> {
    match raw {
        Some(raw) => RetryOverride::from(raw).apply(base, section),
        None => Ok(*base),
    }
}

/// Overrides are re-applied to each step's own policy at registration; this
/// catches obviously invalid values at load time.
fn validate_overrides(
    name: &str,
    overrides: &DefinitionOverrides,
    retry: &RetryPolicy,
    compensation_retry: &RetryPolicy,
) -> Result<()> {
    if let Some(o) = overrides.retry() {
        o.apply(retry, &format!("definitions.{name}.retry"))?;
    }
    if let Some(o) = overrides.compensation_retry() {
        o.apply(
            compensation_retry,
            &format!("definitions.{name}.compensation_retry"),
        )?;
    }
    for (step, step_overrides) in &overrides.steps {
        if let Some(o) = step_overrides.retry() {
            o.apply(retry, &format!("definitions.{name}.steps.{step}.retry"))?;
        }
        if let Some(o) = step_overrides.compensation_retry() {
            o.apply(
                compensation_retry,
                &format!("definitions.{name}.steps.{step}.compensation_retry"),
            )?;
        }
    }
    Ok(())
}
