pub mod agent;
pub mod capture;

pub use agent::{AgentState, GasReason, PipelineAgent, RepoRange};
pub use capture::{
    CaptureConfig, CaptureStatus, CaptureStatusReport, CaptureStrategy, CapturedResponse,
    OcrParams, ResponseSource, ScreenRegion,
};
