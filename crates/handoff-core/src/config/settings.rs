use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{CaptureConfig, PipelineAgent, RepoRange};

pub const DEFAULT_CONFIG_FILE: &str = "handoff.json";

const PIPELINE_STATE_FILE: &str = "pipeline-state.json";
const CAPTURE_RUNTIME_FILE: &str = "capture-runtime.json";
const CAPTURE_STOP_FILE: &str = "capture.stop";
const PIPELINE_STOP_FILE: &str = "pipeline.stop";
const RESPONSE_ARCHIVE_FILE: &str = "responses.jsonl";

/// One node of the pipeline topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTopology {
    pub agent_id: String,
    pub repos: RepoRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
}

impl AgentTopology {
    pub fn to_agent(&self) -> PipelineAgent {
        PipelineAgent::new(self.agent_id.clone(), self.repos, self.next_agent.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Status artifacts live at `{status_root}/{agent_id}/{status_filename}`.
    #[serde(default = "default_agent_root")]
    pub status_root: PathBuf,
    #[serde(default = "default_status_filename")]
    pub status_filename: String,
    /// Hand-off messages land in `{inbox_root}/{agent_id}/inbox/`.
    #[serde(default = "default_agent_root")]
    pub inbox_root: PathBuf,
    #[serde(default)]
    pub agents: Vec<AgentTopology>,
}

impl PipelineConfig {
    /// Check agent ids are unique and every `next_agent` points at another known agent.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut ids = HashSet::new();
        for agent in &self.agents {
            if agent.agent_id.trim().is_empty() {
                return Err(CoreError::InvalidTopology("empty agent_id".into()));
            }
            if !ids.insert(agent.agent_id.as_str()) {
                return Err(CoreError::InvalidTopology(format!(
                    "duplicate agent_id '{}'",
                    agent.agent_id
                )));
            }
        }
        for agent in &self.agents {
            if let Some(next) = &agent.next_agent {
                if next == &agent.agent_id {
                    return Err(CoreError::InvalidTopology(format!(
                        "agent '{next}' hands off to itself"
                    )));
                }
                if !ids.contains(next.as_str()) {
                    return Err(CoreError::InvalidTopology(format!(
                        "agent '{}' hands off to unknown agent '{next}'",
                        agent.agent_id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            status_root: default_agent_root(),
            status_filename: default_status_filename(),
            inbox_root: default_agent_root(),
            agents: Vec::new(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_agent_root() -> PathBuf {
    PathBuf::from("agent_workspaces")
}

fn default_status_filename() -> String {
    "status.json".into()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".handoff")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl HandoffConfig {
    /// Read and validate a config file. Relative paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(CoreError::NotInitialized(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: HandoffConfig = serde_json::from_str(&raw)?;
        config.pipeline.validate()?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        tracing::debug!(path = %path.display(), agents = config.pipeline.agents.len(), "Loaded config");
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Default config for `handoff init`: a two-agent example pipeline.
    pub fn default_init() -> Self {
        let first = RepoRange::new_unchecked(1, 10);
        let second = RepoRange::new_unchecked(11, 20);
        Self {
            capture: CaptureConfig::default(),
            pipeline: PipelineConfig {
                agents: vec![
                    AgentTopology {
                        agent_id: "Agent-1".into(),
                        repos: first,
                        next_agent: Some("Agent-2".into()),
                    },
                    AgentTopology {
                        agent_id: "Agent-2".into(),
                        repos: second,
                        next_agent: None,
                    },
                ],
                ..PipelineConfig::default()
            },
            state_dir: default_state_dir(),
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.capture.watch_root);
        resolve(&mut self.pipeline.status_root);
        resolve(&mut self.pipeline.inbox_root);
        resolve(&mut self.state_dir);
    }

    pub fn pipeline_state_path(&self) -> PathBuf {
        self.state_dir.join(PIPELINE_STATE_FILE)
    }

    pub fn capture_runtime_path(&self) -> PathBuf {
        self.state_dir.join(CAPTURE_RUNTIME_FILE)
    }

    pub fn capture_stop_path(&self) -> PathBuf {
        self.state_dir.join(CAPTURE_STOP_FILE)
    }

    pub fn pipeline_stop_path(&self) -> PathBuf {
        self.state_dir.join(PIPELINE_STOP_FILE)
    }

    pub fn response_archive_path(&self) -> PathBuf {
        self.state_dir.join(RESPONSE_ARCHIVE_FILE)
    }
}
