use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid pipeline topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config not found at {0} (run `handoff init`)")]
    NotInitialized(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}
