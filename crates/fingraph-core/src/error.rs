use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingraphError {
    // Stage errors
    #[error("{stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("Fatal: {0}")]
    Validation(String),

    // Merge errors
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    // Routing errors
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Query parse failed: {0}")]
    Parse(String),

    // Graph errors
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Workflow cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FingraphError {
    /// Shorthand for a recoverable failure raised inside a capability.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Only validation failures abort the remaining graph.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, FingraphError>;
