use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to open line source '{source_id}': {message}")]
    Connection { source_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write to '{source_id}' failed: {message}")]
    Write { source_id: String, message: String },

    #[error("Line source '{0}' closed")]
    SourceClosed(String),

    #[error("No line from '{0}' within the poll interval")]
    ReadTimeout(String),

    #[error("Malformed response field '{field}': {text}")]
    MalformedResponse { field: String, text: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown line source: {0}")]
    UnknownSource(String),

    #[error("Sweep point {0} has no attempted trials")]
    EmptySweepPoint(String),

    #[error("Experiment cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ProbeError {
    /// Errors that end the whole run rather than a single trial
    pub fn is_source_level(&self) -> bool {
        matches!(
            self,
            ProbeError::Connection { .. }
                | ProbeError::Write { .. }
                | ProbeError::SourceClosed(_)
                | ProbeError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
