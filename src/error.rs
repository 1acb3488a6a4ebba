use std::path::PathBuf;

use thiserror::Error;

/// Configuration problems. All of them are fatal and surface before any
/// worker thread is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("properties file does not exist: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("unable to read properties file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'groupNames' is not defined or empty")]
    MissingGroupNames,

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("parsing error: {operation}.sleep={value}")]
    InvalidPause { operation: String, value: String },

    #[error("operation '{name}' is not defined (referenced by '{referrer}')")]
    UnknownOperation { name: String, referrer: String },

    #[error("reference cycle detected while resolving operation '{0}'")]
    ReferenceCycle(String),

    #[error("{operation}.{field} must be positive, got {value}")]
    NonPositive {
        operation: String,
        field: &'static str,
        value: i64,
    },

    #[error("unknown data object factory '{class}' for operation '{operation}'")]
    UnknownFactory { operation: String, class: String },

    #[error(
        "data object factory not set for group {group}, operation {operation}; set '{operation}.factory.class'"
    )]
    MissingFactory { group: String, operation: String },
}
