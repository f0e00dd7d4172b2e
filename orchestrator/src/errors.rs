use crate::config::ValidationError;
use crate::types::Step;
use http::StatusCode;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Errors that stop the service itself (startup, listeners)
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a transport before a response body was obtained
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no response within {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Request(String),
}

/// Normalized outcome of a failed upstream call, always tagged with its step
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{step}: request failed: {message}")]
    Transport { step: Step, message: String },

    #[error("{step}: no response within {timeout_secs}s")]
    Timeout { step: Step, timeout_secs: u64 },

    #[error("{step}: upstream returned status {status}: {excerpt}")]
    Status {
        step: Step,
        status: StatusCode,
        excerpt: String,
    },

    #[error("{step}: response is not JSON (status {status}): {excerpt}")]
    NotJson {
        step: Step,
        status: StatusCode,
        excerpt: String,
    },
}

impl FetchError {
    pub fn from_transport(step: Step, error: TransportError) -> Self {
        match error {
            TransportError::Timeout(timeout_secs) => FetchError::Timeout { step, timeout_secs },
            TransportError::Request(message) => FetchError::Transport { step, message },
        }
    }

    pub fn step(&self) -> Step {
        match self {
            FetchError::Transport { step, .. }
            | FetchError::Timeout { step, .. }
            | FetchError::Status { step, .. }
            | FetchError::NotJson { step, .. } => *step,
        }
    }

    /// Short outcome tag used in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport { .. } => "transport_error",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Status { .. } => "status_error",
            FetchError::NotJson { .. } => "not_json",
        }
    }
}

/// Terminal failure of the student chain
#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Upstream(#[from] FetchError),

    #[error("{step}: response is missing required field {field}")]
    MissingField { step: Step, field: &'static str },
}

impl ChainError {
    pub fn step(&self) -> Step {
        match self {
            ChainError::Upstream(e) => e.step(),
            ChainError::MissingField { step, .. } => *step,
        }
    }
}

/// Rejections of an inbound request, decided before any upstream call
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Request body is not a valid JSON object: {0}")]
    InvalidBody(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("Target host is not allowed: {0}")]
    HostNotAllowed(String),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::HostNotAllowed(_) => StatusCode::FORBIDDEN,
            RequestError::InvalidBody(_)
            | RequestError::MissingField(_)
            | RequestError::InvalidField { .. } => StatusCode::BAD_REQUEST,
        }
    }
}
