use std::path::PathBuf;

use saga_retry::RetryPolicyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid retry policy in [{section}]")]
    InvalidPolicy {
        section: String,
        #[source]
        source: RetryPolicyError,
    },

    #[error("config for saga '{definition}' names unknown step '{step}'")]
    UnknownStep { definition: String, step: String },
}
