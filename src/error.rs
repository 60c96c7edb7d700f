//! Error types for AI Relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Role error: {0}")]
    Role(#[from] RoleError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("No channel registered under {name}")]
    UnknownChannel { name: String },

    #[error("Channel health check failed: {name}")]
    HealthCheckFailed { name: String },
}

/// Text-generation backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Backend {backend} returned HTTP {status}: {body}")]
    HttpStatus {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Backend {backend} is not configured")]
    NotConfigured { backend: String },

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process {program} exited with code {code:?}: {stderr}")]
    ProcessFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Backend call panicked: {0}")]
    Panicked(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session unavailable: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job queue is full ({max} pending)")]
    QueueFull { max: usize },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Role table errors.
#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("Failed to read role table {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write role table {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed role table {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Per-user session directory errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create session directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
