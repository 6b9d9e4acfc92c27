use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawConfig {
    #[serde(default)]
    pub(crate) engine: RawEngine,
    #[serde(default)]
    pub(crate) defaults: RawDefaults,
    #[serde(default)]
    pub(crate) definitions: HashMap<String, RawDefinition>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawEngine {
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) max_concurrent_sagas: Option<usize>,
    pub(crate) log_write_retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDefaults {
    pub(crate) step_timeout_ms: Option<u64>,
    pub(crate) retry: Option<RawRetry>,
    pub(crate) compensation_retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDefinition {
    pub(crate) step_timeout_ms: Option<u64>,
    pub(crate) retry: Option<RawRetry>,
    pub(crate) compensation_retry: Option<RawRetry>,
    #[serde(default)]
    pub(crate) steps: HashMap<String, RawStep>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawStep {
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) retry: Option<RawRetry>,
    pub(crate) compensation_retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRetry {
    pub(crate) max_attempts: Option<u32>,
    pub(crate) initial_interval_ms: Option<u64>,
    pub(crate) max_interval_ms: Option<u64>,
    pub(crate) backoff_coefficient: Option<f64>,
}
