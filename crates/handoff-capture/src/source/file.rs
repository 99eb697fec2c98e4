use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::CaptureError;

const CLAIM_SUFFIX: &str = ".claimed";

/// A response file polled for modification-time changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub agent_id: String,
    pub last_modified: SystemTime,
}

/// Find every `{watch_root}/{agent_id}/{response_filename}` that exists right now.
///
/// A missing watch root yields an empty set with a warning.
pub fn discover_response_files(watch_root: &Path, response_filename: &str) -> Vec<WatchedFile> {
    if !watch_root.is_dir() {
        tracing::warn!(
            "Watch root {} does not exist, no response files will be watched",
            watch_root.display()
        );
        return Vec::new();
    }

    let mut watched = Vec::new();
    for entry in WalkDir::new(watch_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("Skipping walk error: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name().to_str() != Some(response_filename) {
            continue;
        }
        let Some(agent_id) = agent_id_for(entry.path()) else {
            continue;
        };
        match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(last_modified) => watched.push(WatchedFile {
                path: entry.path().to_path_buf(),
                agent_id,
                last_modified,
            }),
            None => tracing::debug!("No mtime for {}, skipping", entry.path().display()),
        }
    }
    watched
}

/// The agent a response file belongs to: its immediate parent directory name.
pub fn agent_id_for(path: &Path) -> Option<String> {
    path.parent()?
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

pub fn modified_time(path: &Path) -> Result<SystemTime, CaptureError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| CaptureError::SourceRead {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Content taken out of a response file, still parked under its claim name.
#[derive(Debug)]
pub struct ClaimedResponse {
    pub content: String,
    claimed_path: PathBuf,
}

/// Atomically take ownership of the current response file by renaming it aside, then read it.
///
/// A producer that writes to a temp file and renames it into place either lands
/// before the claim (and is read in full) or after it (and is picked up next poll).
pub fn claim(path: &Path) -> Result<ClaimedResponse, CaptureError> {
    let claimed_path = claim_path(path);
    fs::rename(path, &claimed_path).map_err(|e| CaptureError::SourceRead {
        source_name: path.display().to_string(),
        reason: format!("claim failed: {e}"),
    })?;

    match fs::read(&claimed_path) {
        Ok(bytes) => Ok(ClaimedResponse {
            content: String::from_utf8_lossy(&bytes).to_string(),
            claimed_path,
        }),
        Err(e) => {
            // Put it back so the content is not lost
            if let Err(restore) = fs::rename(&claimed_path, path) {
                tracing::warn!("Failed to restore {}: {restore}", claimed_path.display());
            }
            Err(CaptureError::SourceRead {
                source_name: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Consume a claim: delete it and leave an empty response file in place.
///
/// Returns the mtime of the fresh empty file, or `None` when a producer has
/// already written a new response at `path` (it must not be marked as seen).
pub fn acknowledge(path: &Path, claimed: ClaimedResponse) -> Result<Option<SystemTime>, CaptureError> {
    fs::remove_file(&claimed.claimed_path)?;
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file.metadata()?.modified()?)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(CaptureError::Io(e)),
    }
}

fn claim_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(CLAIM_SUFFIX);
    path.with_file_name(name)
}
