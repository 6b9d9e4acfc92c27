mod config;
mod error;
mod raw;

pub use config::{DefinitionOverrides, EngineConfig, RetryOverride, StepOverrides};
pub use error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;
