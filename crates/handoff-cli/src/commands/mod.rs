pub mod capture;
pub mod init;
pub mod pipeline;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;

use handoff_core::config::HandoffConfig;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter config and agent workspace directories
    Init(init::InitArgs),
    /// Run, stop, inspect or feed the response capture service
    Capture(capture::CaptureArgs),
    /// Run and operate the auto-gas pipeline
    Pipeline(pipeline::PipelineArgs),
}

pub(crate) fn load_config(path: &Path) -> Result<HandoffConfig> {
    HandoffConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
}
