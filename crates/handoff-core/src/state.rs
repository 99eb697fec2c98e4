use std::fs;
use std::io::{Read as _, Write as _};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{CaptureStatusReport, PipelineAgent};

/// Persisted pipeline records, rewritten after every monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub updated_at: DateTime<Utc>,
    pub agents: Vec<PipelineAgent>,
}

impl PipelineState {
    pub fn new(agents: Vec<PipelineAgent>) -> Self {
        Self {
            updated_at: Utc::now(),
            agents,
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&PipelineAgent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}

/// Heartbeat written by a foreground capture service so other processes can report on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRuntime {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub report: CaptureStatusReport,
}

/// Serialize `value` to `path` under an exclusive file lock.
pub fn save_locked<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    fs2::FileExt::lock_exclusive(&file).map_err(CoreError::Io)?;
    // Truncate only once the lock is held so readers never see a half-empty file
    let result = file
        .set_len(0)
        .and_then(|_| (&file).write_all(json.as_bytes()))
        .and_then(|_| (&file).flush());
    fs2::FileExt::unlock(&file).map_err(CoreError::Io)?;
    result.map_err(CoreError::Io)
}

/// Load `path` under a shared lock. `Ok(None)` when the file does not exist.
pub fn load_locked<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    let file = match fs::OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::Io(e)),
    };
    fs2::FileExt::lock_shared(&file).map_err(CoreError::Io)?;
    let mut data = String::new();
    let read = (&file).read_to_string(&mut data);
    fs2::FileExt::unlock(&file).ok();
    read?;
    if data.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&data)?))
}

/// Remove a state or marker file, ignoring absence.
pub fn remove(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {e}", path.display());
        }
    }
}

/// Create an empty marker file (used for cross-process stop requests).
pub fn touch(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}
