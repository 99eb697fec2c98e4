mod settings;

pub use settings::{AgentTopology, HandoffConfig, PipelineConfig, DEFAULT_CONFIG_FILE};
