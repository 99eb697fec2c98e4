use std::fs;
use std::io::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use handoff_core::model::CapturedResponse;

use crate::error::CaptureError;

/// Receives every captured response, synchronously, on the capturing thread.
pub trait ResponseHandler: Send + Sync {
    /// Identity used in logs when this handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_captured_response(&self, response: &CapturedResponse) -> Result<(), CaptureError>;
}

impl<F> ResponseHandler for F
where
    F: Fn(&CapturedResponse) -> Result<(), CaptureError> + Send + Sync,
{
    fn on_captured_response(&self, response: &CapturedResponse) -> Result<(), CaptureError> {
        self(response)
    }
}

/// Appends every response as one JSON line to a file.
pub struct JsonlArchiveHandler {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlArchiveHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResponseHandler for JsonlArchiveHandler {
    fn name(&self) -> &str {
        "jsonl-archive"
    }

    fn on_captured_response(&self, response: &CapturedResponse) -> Result<(), CaptureError> {
        let mut line = serde_json::to_string(response)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Emits one tracing line per response.
pub struct LogHandler;

impl ResponseHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn on_captured_response(&self, response: &CapturedResponse) -> Result<(), CaptureError> {
        tracing::info!(
            agent_id = %response.agent_id,
            source = %response.source,
            chars = response.content.chars().count(),
            "Captured response"
        );
        Ok(())
    }
}

/// Result of handing one response to every handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Invoke each handler in order. A failing or panicking handler is logged and skipped.
pub fn dispatch(handlers: &[Arc<dyn ResponseHandler>], response: &CapturedResponse) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler.on_captured_response(response))) {
            Ok(Ok(())) => outcome.delivered += 1,
            Ok(Err(e)) => {
                outcome.failed += 1;
                tracing::warn!(handler = handler.name(), agent_id = %response.agent_id, "Handler failed: {e}");
            }
            Err(panic) => {
                outcome.failed += 1;
                tracing::error!(
                    handler = handler.name(),
                    agent_id = %response.agent_id,
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
    outcome
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
