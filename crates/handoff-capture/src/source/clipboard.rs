use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::CaptureError;

/// Anything that can hand back the current clipboard text.
pub trait ClipboardSource {
    /// `Ok(None)` when the clipboard holds no text.
    fn read_text(&mut self) -> Result<Option<String>, CaptureError>;
}

/// Opens a clipboard on the thread that will poll it. `None` means clipboard capture is off.
pub type ClipboardFactory = Arc<dyn Fn() -> Option<Box<dyn ClipboardSource>> + Send + Sync>;

#[cfg(feature = "clipboard")]
pub struct SystemClipboard {
    inner: arboard::Clipboard,
}

#[cfg(feature = "clipboard")]
impl SystemClipboard {
    pub fn open() -> Result<Self, CaptureError> {
        arboard::Clipboard::new()
            .map(|inner| Self { inner })
            .map_err(|e| CaptureError::ClipboardUnavailable(e.to_string()))
    }
}

#[cfg(feature = "clipboard")]
impl ClipboardSource for SystemClipboard {
    fn read_text(&mut self) -> Result<Option<String>, CaptureError> {
        match self.inner.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(CaptureError::SourceRead {
                source_name: "clipboard".into(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Factory for the OS clipboard. Degrades to "no clipboard" when it cannot be opened.
pub fn system_clipboard() -> ClipboardFactory {
    Arc::new(open_system_clipboard)
}

#[cfg(feature = "clipboard")]
fn open_system_clipboard() -> Option<Box<dyn ClipboardSource>> {
    match SystemClipboard::open() {
        Ok(clipboard) => Some(Box::new(clipboard)),
        Err(e) => {
            tracing::info!("{e}; clipboard capture disabled");
            None
        }
    }
}

#[cfg(not(feature = "clipboard"))]
fn open_system_clipboard() -> Option<Box<dyn ClipboardSource>> {
    tracing::info!("Built without clipboard support; clipboard capture disabled");
    None
}

/// Throttled, de-duplicated clipboard poller.
pub struct ClipboardWatch {
    source: Box<dyn ClipboardSource>,
    interval: Duration,
    last_read: Option<Instant>,
    last_digest: Option<Vec<u8>>,
}

impl ClipboardWatch {
    pub fn new(source: Box<dyn ClipboardSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            last_read: None,
            last_digest: None,
        }
    }

    /// Return clipboard text that is non-empty and differs from the last value seen.
    ///
    /// Reads are skipped until `interval` has passed since the previous read.
    pub fn poll(&mut self) -> Result<Option<String>, CaptureError> {
        if self.last_read.is_some_and(|t| t.elapsed() < self.interval) {
            return Ok(None);
        }
        self.last_read = Some(Instant::now());

        let Some(text) = self.source.read_text()? else {
            return Ok(None);
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        let digest = Sha256::digest(text.as_bytes()).to_vec();
        if self.last_digest.as_ref() == Some(&digest) {
            return Ok(None);
        }
        self.last_digest = Some(digest);
        Ok(Some(text))
    }
}
