use handoff_core::error::CoreError;

/// Failure of the messaging collaborator. A hand-off that fails this way is not latched.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("IO error delivering to {recipient}: {source}")]
    Io {
        recipient: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Delivery to {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Agent not found in pipeline: {0}")]
    UnknownAgent(String),

    #[error("Agent {0} is the end of the pipeline and has no one to hand off to")]
    Terminal(String),

    #[error("Failed to spawn pipeline monitor: {0}")]
    Spawn(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}
