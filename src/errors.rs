use thiserror::Error;

/// Failures surfaced by the streaming pipeline.
///
/// The first five variants are the pipeline's failure taxonomy; the rest wrap
/// ambient failures (configuration, I/O, outbound HTTP, camera backend).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("No compatible camera: {0}")]
    HardwareUnavailable(String),

    #[error("Failed to start {role}: {message}")]
    ProcessStartFailure { role: String, message: String },

    #[error("{role} exited unexpectedly (exit code {code:?})")]
    ProcessExitedUnexpectedly {
        role: String,
        code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No data available: {0}")]
    StaleDataTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn start_failure(role: impl Into<String>, message: impl Into<String>) -> Self {
        StreamError::ProcessStartFailure {
            role: role.into(),
            message: message.into(),
        }
    }

    /// Whether the pipeline may fall back to a degraded mode after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StreamError::HardwareUnavailable(_))
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
