//! Configuration and catalog errors.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("invalid quantity for {field}: {value:?}")]
    InvalidQuantity { field: String, value: String },

    #[error("unknown game: {0}")]
    UnknownGame(String),

    #[error("unknown plan {plan:?} for game {game:?}")]
    UnknownPlan { game: String, plan: String },

    #[error("missing required value: {0}")]
    Missing(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
