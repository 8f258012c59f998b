//! Error types for every subsystem.
//!
//! Transport and sampling failures are handled at the smallest scope that can
//! absorb them (per call retry, per sampler abort). Only permanent transport
//! failures and configuration errors end a scenario.

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Top-level error
// ----------------------------------------------------------------------------

/// The crate-level error. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum PerfError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PerfError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            PerfError::Config(_) => false,
            PerfError::Sink(e) => e.is_transient(),
            PerfError::Sampler(_) => false,
            PerfError::Stats(_) => true,
            PerfError::Artifact(_) => true,
            PerfError::Io(_) => true,
            PerfError::Internal(_) => false,
        }
    }

    /// Category label used in log fields
    pub fn category(&self) -> &'static str {
        match self {
            PerfError::Config(_) => "config",
            PerfError::Sink(_) => "sink",
            PerfError::Sampler(_) => "sampler",
            PerfError::Stats(_) => "stats",
            PerfError::Artifact(_) => "artifact",
            PerfError::Io(_) => "io",
            PerfError::Internal(_) => "internal",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PerfError::Config(_) => RecoveryHint::FixConfiguration,
            PerfError::Sink(e) => e.recovery_hint(),
            PerfError::Sampler(_) => RecoveryHint::RestartComponent,
            PerfError::Stats(_) => RecoveryHint::Skip,
            _ => RecoveryHint::None,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry the same call after a fixed pause
    RetryWithBackoff,
    /// Restart the component (e.g. a new sampling session)
    RestartComponent,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// Configuration errors
// ----------------------------------------------------------------------------

/// Errors raised while loading configuration or resolving a scenario setup.
/// All of them are fatal at startup, before any event is sent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unsupported resource path: {path}")]
    UnsupportedResource { path: String },

    #[error("Unknown event factory '{name}' (registered: {registered})")]
    UnknownFactory { name: String, registered: String },

    #[error("Invalid event factory descriptor: {message}")]
    InvalidDescriptor { message: String },

    #[error("Invalid constructor parameters for factory '{name}': {message}")]
    InvalidFactoryParams { name: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn factory_params(name: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidFactoryParams {
            name: name.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Sink errors
// ----------------------------------------------------------------------------

/// Failure of a single sink call, classified by whether retrying the same call
/// can be expected to succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient failure (status {status}): {message}")]
    Transient { status: u16, message: String },

    #[error("permanent failure{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Permanent { status: Option<u16>, message: String },
}

impl SinkError {
    /// Classify an HTTP status: the 5xx class is transient, anything else is not.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status / 100 == 5 {
            SinkError::Transient { status, message: message.into() }
        } else {
            SinkError::Permanent { status: Some(status), message: message.into() }
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        SinkError::Permanent { status: None, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SinkError::Transient { status, .. } => Some(*status),
            SinkError::Permanent { status, .. } => *status,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SinkError::Transient { .. } => RecoveryHint::RetryWithBackoff,
            SinkError::Permanent { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// Sampler errors
// ----------------------------------------------------------------------------

/// Errors from status providers and sampler tasks. Fatal to that sampler only.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Status fetch from '{endpoint}' failed: {message}")]
    FetchFailed { endpoint: String, message: String },

    #[error("Invalid status response from '{endpoint}': {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("Failed to persist sample: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Sampler task '{name}' terminated abnormally: {message}")]
    TaskFailed { name: String, message: String },
}

impl SamplerError {
    pub fn fetch_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        SamplerError::FetchFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        SamplerError::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },
}

impl StatsError {
    pub fn insufficient(message: impl Into<String>) -> Self {
        StatsError::InsufficientData { message: message.into() }
    }
}

// ----------------------------------------------------------------------------
// Artifact errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to serialize {what}: {message}")]
    Serialize { what: String, message: String },
}

// ----------------------------------------------------------------------------
// Result aliases
// ----------------------------------------------------------------------------

pub type PerfResult<T> = Result<T, PerfError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SinkResult<T> = Result<T, SinkError>;
pub type SamplerResult<T> = Result<T, SamplerError>;
pub type StatsResult<T> = Result<T, StatsError>;
