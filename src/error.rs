use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the pipeline coordinator and session lifecycle.
///
/// Stage-internal failures (a failed transcription window, a dropped TTS
/// segment) stay inside the stage as counters and log records; this enum
/// covers the session-fatal and caller-visible cases.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("session quota exceeded: {active} active, limit {limit}")]
    SessionQuota { active: usize, limit: usize },

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("no such session: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
