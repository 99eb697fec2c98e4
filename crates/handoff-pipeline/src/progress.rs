use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use handoff_core::config::PipelineConfig;
use handoff_core::model::{PipelineAgent, RepoRange};

use crate::fsm::{clamp_progress, COMPLETE};

/// How a progress value was derived from the status artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressBasis {
    /// No artifact, or one that could not be parsed.
    Missing,
    /// An explicit numeric `progress` field.
    Explicit,
    /// Distinct `Repo #N complete` markers inside the agent's range.
    RepoMarkers,
    /// Length of `completed_tasks`.
    TaskCount,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    pub progress: f64,
    pub current_repo: u32,
    pub basis: ProgressBasis,
}

impl ProgressReading {
    pub fn missing(range: RepoRange) -> Self {
        Self {
            progress: 0.0,
            current_repo: range.start(),
            basis: ProgressBasis::Missing,
        }
    }
}

/// Agent-owned status file. Unknown fields are ignored, and a field of the
/// wrong type reads as absent instead of failing the whole artifact.
#[derive(Debug, Default, Deserialize)]
struct StatusArtifact {
    #[serde(default)]
    completed_tasks: Option<serde_json::Value>,
    #[serde(default)]
    progress: Option<serde_json::Value>,
}

impl StatusArtifact {
    /// `progress` as a number; numeric strings such as `"80"` are accepted.
    fn explicit_progress(&self) -> Option<f64> {
        match self.progress.as_ref()? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
    }

    fn completed_count(&self) -> usize {
        self.completed_tasks
            .as_ref()
            .and_then(serde_json::Value::as_array)
            .map_or(0, Vec::len)
    }
}

/// Derive progress for an agent assigned `range` from the raw artifact text.
pub fn progress_from_artifact(raw: &str, range: RepoRange) -> Result<ProgressReading, serde_json::Error> {
    let artifact: StatusArtifact = serde_json::from_str(raw)?;
    let total = range.len() as f64;

    if let Some(explicit) = artifact.explicit_progress() {
        let progress = clamp_progress(explicit);
        let done = ((progress / COMPLETE) * total).floor() as u32;
        return Ok(ProgressReading {
            progress,
            current_repo: cursor_after(range, done),
            basis: ProgressBasis::Explicit,
        });
    }

    let completed: BTreeSet<u32> = repo_markers(raw)
        .into_iter()
        .filter(|n| range.contains(*n))
        .collect();
    if !completed.is_empty() {
        let current_repo = (range.start()..=range.end())
            .find(|n| !completed.contains(n))
            .unwrap_or(range.end());
        return Ok(ProgressReading {
            progress: clamp_progress(completed.len() as f64 * COMPLETE / total),
            current_repo,
            basis: ProgressBasis::RepoMarkers,
        });
    }

    let done = artifact.completed_count();
    Ok(ProgressReading {
        progress: clamp_progress(done as f64 * COMPLETE / total),
        current_repo: cursor_after(range, u32::try_from(done).unwrap_or(u32::MAX)),
        basis: ProgressBasis::TaskCount,
    })
}

fn cursor_after(range: RepoRange, done: u32) -> u32 {
    range.start().saturating_add(done).min(range.end())
}

/// Repo numbers N from every `Repo #N complete` (or `completed`) marker, case-insensitive.
pub fn repo_markers(text: &str) -> Vec<u32> {
    const PREFIX: &str = "repo #";
    let lower = text.to_ascii_lowercase();
    let mut found = Vec::new();
    let mut rest = lower.as_str();
    while let Some(at) = rest.find(PREFIX) {
        rest = &rest[at + PREFIX.len()..];
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            continue;
        }
        let Ok(n) = rest[..digits_end].parse::<u32>() else {
            continue;
        };
        if rest[digits_end..].trim_start().starts_with("complete") {
            found.push(n);
        }
    }
    found
}

/// Reads `{status_root}/{agent_id}/{status_filename}`.
#[derive(Debug, Clone)]
pub struct StatusReader {
    root: PathBuf,
    filename: String,
}

impl StatusReader {
    pub fn new(root: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            filename: filename.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.status_root.clone(), config.status_filename.clone())
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id).join(&self.filename)
    }

    /// Progress for `agent`. Absent or unreadable artifacts read as zero progress.
    pub fn read(&self, agent: &PipelineAgent) -> ProgressReading {
        read_progress(&self.path_for(&agent.agent_id), agent.repos_assigned)
    }
}

pub fn read_progress(path: &Path, range: RepoRange) -> ProgressReading {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ProgressReading::missing(range),
        Err(e) => {
            tracing::warn!("Failed to read status artifact {}: {e}", path.display());
            return ProgressReading::missing(range);
        }
    };
    if raw.trim().is_empty() {
        return ProgressReading::missing(range);
    }
    match progress_from_artifact(&raw, range) {
        Ok(reading) => reading,
        Err(e) => {
            tracing::warn!("Malformed status artifact {}: {e}", path.display());
            ProgressReading::missing(range)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn range() -> RepoRange {
        RepoRange::new(1, 10).unwrap()
    }

    #[test]
    fn test_repo_markers() {
        let found =
            repo_markers("Repo #1 complete, repo #12 COMPLETED, Repo #3 in progress, Repo # complete");
        assert_eq!(found, vec![1, 12]);
    }

    #[test]
    fn test_progress_from_markers() {
        let raw = r#"{"completed_tasks": ["Repo #1 complete", "Repo #2 complete"]}"#;
        let reading = progress_from_artifact(raw, range()).unwrap();
        assert_eq!(reading.progress, 20.0);
        assert_eq!(reading.current_repo, 3);
        assert_eq!(reading.basis, ProgressBasis::RepoMarkers);
    }

    #[test]
    fn test_markers_are_distinct_and_in_range() {
        let raw = r#"{"completed_tasks": ["Repo #1 complete", "Repo #1 complete", "Repo #44 complete"],
                      "notes": "Repo #3 complete"}"#;
        let reading = progress_from_artifact(raw, range()).unwrap();
        assert_eq!(reading.progress, 20.0);
        assert_eq!(reading.current_repo, 2);
    }

    #[test]
    fn test_progress_from_task_count() {
        let raw = r#"{"completed_tasks": ["lint", "tests", "docs"]}"#;
        let reading = progress_from_artifact(raw, range()).unwrap();
        assert_eq!(reading.progress, 30.0);
        assert_eq!(reading.current_repo, 4);
        assert_eq!(reading.basis, ProgressBasis::TaskCount);
    }

    #[test]
    fn test_explicit_progress_wins_and_is_clamped() {
        let raw = r#"{"progress": 130, "completed_tasks": ["Repo #1 complete"]}"#;
        let reading = progress_from_artifact(raw, range()).unwrap();
        assert_eq!(reading.progress, 100.0);
        assert_eq!(reading.current_repo, 10);
        assert_eq!(reading.basis, ProgressBasis::Explicit);
    }

    #[test]
    fn test_lenient_field_types() {
        let reading = progress_from_artifact(r#"{"progress": "80"}"#, range()).unwrap();
        assert_eq!(reading.progress, 80.0);
        assert_eq!(reading.basis, ProgressBasis::Explicit);

        let raw = r#"{"progress": "soon", "completed_tasks": ["lint", "tests"]}"#;
        let reading = progress_from_artifact(raw, range()).unwrap();
        assert_eq!(reading.progress, 20.0);
        assert_eq!(reading.basis, ProgressBasis::TaskCount);

        let reading = progress_from_artifact(r#"{"completed_tasks": null}"#, range()).unwrap();
        assert_eq!(reading.progress, 0.0);
        assert_eq!(reading.basis, ProgressBasis::TaskCount);
    }

    #[test]
    fn test_full_width_range_does_not_overflow() {
        let wide = RepoRange::new(0, u32::MAX).unwrap();
        let reading = progress_from_artifact(r#"{"completed_tasks": ["a"]}"#, wide).unwrap();
        assert!(reading.progress > 0.0 && reading.progress < 1.0);
        assert_eq!(reading.current_repo, 1);
        assert_eq!(reading.basis, ProgressBasis::TaskCount);
    }

    #[test]
    fn test_empty_task_list_is_zero() {
        let reading = progress_from_artifact(r#"{"completed_tasks": []}"#, range()).unwrap();
        assert_eq!(reading.progress, 0.0);
        assert_eq!(reading.current_repo, 1);
    }

    #[test]
    fn test_all_repos_complete() {
        let tasks: Vec<String> = (1..=10).map(|n| format!("Repo #{n} complete")).collect();
        let raw = serde_json::json!({ "completed_tasks": tasks }).to_string();
        let reading = progress_from_artifact(&raw, range()).unwrap();
        assert_eq!(reading.progress, 100.0);
        assert_eq!(reading.current_repo, 10);
    }

    #[test]
    fn test_reader_missing_and_malformed() {
        let tmp = TempDir::new().unwrap();
        let reader = StatusReader::new(tmp.path(), "status.json");
        let agent = PipelineAgent::new("Agent-1", range(), None);

        assert_eq!(reader.read(&agent).basis, ProgressBasis::Missing);

        let path = reader.path_for("Agent-1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        let reading = reader.read(&agent);
        assert_eq!(reading.progress, 0.0);
        assert_eq!(reading.basis, ProgressBasis::Missing);

        std::fs::write(&path, r#"{"completed_tasks": ["Repo #5 complete"]}"#).unwrap();
        assert_eq!(reader.read(&agent).progress, 10.0);
    }
}
