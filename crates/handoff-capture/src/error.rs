use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to read source {source_name}: {reason}")]
    SourceRead { source_name: String, reason: String },

    #[error("Clipboard unavailable: {0}")]
    ClipboardUnavailable(String),

    #[error("Handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error("Failed to spawn capture worker: {0}")]
    Spawn(String),
}

impl CaptureError {
    pub fn handler(handler: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Handler {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }
}
