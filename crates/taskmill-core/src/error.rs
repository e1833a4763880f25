use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskmillError {
    /// Short error code string used in CLI diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            TaskmillError::Config(_) => "CONFIG_ERROR",
            TaskmillError::Serialization(_) => "SERIALIZATION_ERROR",
            TaskmillError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskmillError>;
