// src/error.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations at every subsystem boundary.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("spec repository error: {0}")]
    Spec(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("redfish error: {0}")]
    Redfish(String),

    #[error("configuration runner error: {0}")]
    Runner(String),

    #[error("hook error: {0}")]
    Hook(String),

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors raised while loading and validating the YAML configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file at '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML from '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing required configuration key: '{path}'")]
    MissingKey { path: String },

    #[error("invalid value for '{path}': {reason}")]
    InvalidValue { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
