use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use handoff_core::model::{GasReason, PipelineAgent, RepoRange};

use crate::error::DeliveryError;

/// One hand-off notification from an agent to the next one in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasMessage {
    pub id: Uuid,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: GasReason,
    pub progress: f64,
    pub upstream_repos: RepoRange,
    pub upstream_current_repo: u32,
    pub created_at: DateTime<Utc>,
}

impl GasMessage {
    pub fn new(from: &PipelineAgent, to_agent: impl Into<String>, reason: GasReason, progress: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_agent: from.agent_id.clone(),
            to_agent: to_agent.into(),
            reason,
            progress,
            upstream_repos: from.repos_assigned,
            upstream_current_repo: from.current_repo,
            created_at: Utc::now(),
        }
    }

    /// Metadata handed to the transport alongside the rendered text.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("message_id".to_string(), self.id.to_string()),
            ("from_agent".to_string(), self.from_agent.clone()),
            ("to_agent".to_string(), self.to_agent.clone()),
            ("reason".to_string(), self.reason.to_string()),
            ("progress".to_string(), format!("{:.1}", self.progress)),
        ])
    }

    /// Inbox file contents: a `---` delimited header of `key: value` metadata,
    /// then the markdown body.
    pub fn to_inbox_document(&self) -> String {
        let mut doc = String::from("---\n");
        for (key, value) in self.metadata() {
            doc.push_str(&format!("{key}: {value}\n"));
        }
        doc.push_str("---\n\n");
        doc.push_str(&self.render());
        doc
    }

    /// Markdown body of the hand-off.
    pub fn render(&self) -> String {
        format!(
            "# Gas: {reason}\n\
             \n\
             {headline}.\n\
             \n\
             - From: {from}\n\
             - To: {to}\n\
             - Upstream progress: {progress:.1}%\n\
             - Upstream repos: {range} (currently #{current})\n\
             - Sent: {sent}\n\
             - Message id: {id}\n",
            reason = self.reason,
            headline = self.reason.headline(),
            from = self.from_agent,
            to = self.to_agent,
            progress = self.progress,
            range = self.upstream_repos,
            current = self.upstream_current_repo,
            sent = self.created_at.to_rfc3339(),
            id = self.id,
        )
    }
}

/// The messaging transport. Implementations should bound their own latency.
pub trait MessageDelivery: Send + Sync {
    fn deliver(&self, message: &GasMessage) -> Result<(), DeliveryError>;
}

/// Drops each hand-off as a markdown file into `{root}/{to_agent}/inbox/`.
///
/// Files are written to a hidden temp name and renamed into place, so a
/// reader polling the inbox never sees a partial message.
#[derive(Debug, Clone)]
pub struct InboxDelivery {
    root: PathBuf,
}

impl InboxDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn inbox_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id).join("inbox")
    }

    fn file_name(message: &GasMessage) -> String {
        format!(
            "{}-{}-{}.md",
            message.created_at.format("%Y%m%dT%H%M%SZ"),
            message.reason.as_str().to_ascii_lowercase(),
            &message.id.simple().to_string()[..8]
        )
    }

    fn write_atomic(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".{name}.tmp"));
        let target = dir.join(name);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &target)?;
        Ok(target)
    }
}

impl MessageDelivery for InboxDelivery {
    fn deliver(&self, message: &GasMessage) -> Result<(), DeliveryError> {
        let dir = self.inbox_dir(&message.to_agent);
        let document = message.to_inbox_document();
        let path = Self::write_atomic(&dir, &Self::file_name(message), &document).map_err(|source| {
            DeliveryError::Io {
                recipient: message.to_agent.clone(),
                source,
            }
        })?;
        tracing::info!(
            to = %message.to_agent,
            reason = %message.reason,
            path = %path.display(),
            "Delivered hand-off"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn upstream() -> PipelineAgent {
        let mut agent = PipelineAgent::new("Agent-1", RepoRange::new(1, 10).unwrap(), Some("Agent-2".into()));
        agent.current_repo = 9;
        agent
    }

    #[test]
    fn test_render_carries_reason_and_progress() {
        let message = GasMessage::new(&upstream(), "Agent-2", GasReason::PrimaryHandoff75, 80.0);
        let body = message.render();
        assert!(body.starts_with("# Gas: PRIMARY_HANDOFF_75_PERCENT"));
        assert!(body.contains("Upstream progress: 80.0%"));
        assert!(body.contains("Upstream repos: 1-10 (currently #9)"));
        assert!(body.contains(&message.id.to_string()));
        assert_eq!(message.metadata()["reason"], "PRIMARY_HANDOFF_75_PERCENT");
    }

    #[test]
    fn test_inbox_delivery_writes_one_file() {
        let tmp = TempDir::new().unwrap();
        let inbox = InboxDelivery::new(tmp.path());
        let message = GasMessage::new(&upstream(), "Agent-2", GasReason::SafetyBackup90, 92.0);

        inbox.deliver(&message).unwrap();

        let entries: Vec<_> = fs::read_dir(inbox.inbox_dir("Agent-2"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".md"));
        assert!(name.contains("safety_backup_90_percent"));

        let doc = fs::read_to_string(&entries[0]).unwrap();
        let (header, body) = doc
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("---\n\n"))
            .unwrap();
        assert!(header.contains(&format!("message_id: {}\n", message.id)));
        assert!(header.contains("from_agent: Agent-1\n"));
        assert!(header.contains("to_agent: Agent-2\n"));
        assert!(header.contains("reason: SAFETY_BACKUP_90_PERCENT\n"));
        assert!(header.contains("progress: 92.0\n"));
        assert!(body.starts_with("# Gas: SAFETY_BACKUP_90_PERCENT"));
    }

    #[test]
    fn test_inbox_delivery_reports_io_failure() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the inbox root should be
        let blocker = tmp.path().join("root");
        fs::write(&blocker, "").unwrap();
        let inbox = InboxDelivery::new(&blocker);
        let message = GasMessage::new(&upstream(), "Agent-2", GasReason::Completion100, 100.0);

        let err = inbox.deliver(&message).unwrap_err();
        assert!(matches!(err, DeliveryError::Io { ref recipient, .. } if recipient == "Agent-2"));
    }
}
