/// Failures raised by the computation engine while a run is being observed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("undecodable trace record: {0}")]
    Decode(String),
    /// The engine reported an exception in-band.
    #[error("{0}")]
    Raised(String),
    #[error("execution cancelled: {0}")]
    Cancelled(String),
}

impl EngineError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Status { .. } => "status_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Decode(_) => "decode_error",
            Self::Raised(_) => "engine_raised",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Failures shaping the terminal completion into a structured result.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("completion has no field '{0}'")]
    MissingField(String),
    #[error("field '{field}' is not valid JSON: {reason}")]
    InvalidJson { field: String, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Failures from the persistence collaborator. Never surfaced to observers.
#[derive(Debug, thiserror::Error)]
#[error("record failed: {0}")]
pub struct RecordError(pub String);
