use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use handoff_core::model::{
    CaptureConfig, CaptureStatus, CaptureStatusReport, CapturedResponse, ResponseSource,
};

use crate::classify::looks_like_agent_response;
use crate::error::CaptureError;
use crate::handler::{dispatch, ResponseHandler};
use crate::source::{
    acknowledge, claim, discover_response_files, modified_time, system_clipboard, ClipboardFactory,
    ClipboardWatch, WatchedFile,
};

const LOOP_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Synthetic agent bucket for clipboard captures.
pub const CLIPBOARD_AGENT_ID: &str = "clipboard";

/// State shared between the service handle and its monitoring thread.
pub(crate) struct Shared {
    status: Mutex<CaptureStatus>,
    monitoring: AtomicBool,
    /// Bumped on every start so a detached, late-exiting loop cannot overwrite a newer one's status.
    generation: AtomicU64,
    watched_files: AtomicUsize,
    handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(CaptureStatus::Idle),
            monitoring: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            watched_files: AtomicUsize::new(0),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn status(&self) -> CaptureStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: CaptureStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Status update from a loop; ignored once that loop has been stopped or superseded.
    fn set_loop_status(&self, generation: u64, status: CaptureStatus) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if self.monitoring.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation {
            *current = status;
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn ResponseHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Polls response files (and optionally the clipboard) on a background thread and
/// dispatches each new response to the registered handlers exactly once.
pub struct ResponseCaptureService {
    config: CaptureConfig,
    shared: Arc<Shared>,
    clipboard: ClipboardFactory,
    worker: Mutex<Option<Worker>>,
}

impl ResponseCaptureService {
    /// Build a service that uses the OS clipboard when the strategy asks for it.
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_clipboard(config, system_clipboard())
    }

    pub fn with_clipboard(config: CaptureConfig, clipboard: ClipboardFactory) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            clipboard,
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Append a handler. Handlers run in registration order; duplicates are allowed.
    pub fn register_handler(&self, handler: Arc<dyn ResponseHandler>) {
        let mut handlers = self.shared.handlers.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(handler = handler.name(), "Registered response handler");
        handlers.push(handler);
    }

    /// Start the monitoring loop. Returns `false` if it is already running or cannot be spawned.
    pub fn start_capture(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.monitoring.load(Ordering::SeqCst) {
            tracing::warn!("Response capture is already running");
            return false;
        }

        let watched = if self.config.strategy.watches_files() {
            discover_response_files(&self.config.watch_root, &self.config.response_filename)
        } else {
            Vec::new()
        };
        if self.config.strategy.wants_ocr() {
            tracing::warn!("OCR capture is not available; continuing with the remaining sources");
        }
        let clipboard = self
            .config
            .strategy
            .watches_clipboard()
            .then(|| Arc::clone(&self.clipboard));
        let clipboard_interval = Duration::from_millis(self.config.clipboard_poll_interval_ms);

        self.shared.watched_files.store(watched.len(), Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.monitoring.store(true, Ordering::SeqCst);
        self.shared.set_status(CaptureStatus::Monitoring);

        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("response-capture".into())
            .spawn(move || {
                // The clipboard is opened on the thread that polls it
                let clipboard = clipboard
                    .and_then(|open| open())
                    .map(|source| ClipboardWatch::new(source, clipboard_interval));
                CaptureLoop::new(watched, clipboard, shared, generation).run(stop_rx);
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { stop_tx, handle });
                tracing::info!(
                    strategy = %self.config.strategy,
                    watched_files = self.shared.watched_files.load(Ordering::SeqCst),
                    "Response capture started"
                );
                true
            }
            Err(e) => {
                self.shared.monitoring.store(false, Ordering::SeqCst);
                self.shared.set_status(CaptureStatus::Error);
                tracing::error!("{}", CaptureError::Spawn(e.to_string()));
                false
            }
        }
    }

    /// Signal the loop to stop and wait up to two seconds for it to exit.
    ///
    /// A loop that does not exit in time is detached; the service still reports idle.
    /// Returns `false` only when the worker thread ended by panicking.
    pub fn stop_capture(&self) -> bool {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.shared.monitoring.store(false, Ordering::SeqCst);

        let Some(worker) = worker else {
            self.shared.set_status(CaptureStatus::Idle);
            return true;
        };

        // A send error means the loop already exited
        let _ = worker.stop_tx.send(());
        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }

        let joined = if worker.handle.is_finished() {
            match worker.handle.join() {
                Ok(()) => true,
                Err(_) => {
                    tracing::error!("Response capture worker panicked");
                    false
                }
            }
        } else {
            tracing::warn!(
                "Response capture worker did not stop within {}s; detaching it",
                STOP_JOIN_TIMEOUT.as_secs()
            );
            true
        };

        self.shared.set_status(CaptureStatus::Idle);
        tracing::info!("Response capture stopped");
        joined
    }

    /// Dispatch text immediately, bypassing the monitoring loop. Works whether or not it runs.
    pub fn capture_response(&self, agent_id: &str, text: &str, source: ResponseSource) -> bool {
        if text.trim().is_empty() {
            tracing::warn!(agent_id, "Ignoring empty manual capture");
            return false;
        }
        let response = CapturedResponse::new(agent_id, text, source);
        let outcome = dispatch(&self.shared.handlers(), &response);
        tracing::info!(
            agent_id,
            source = %source,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Captured response"
        );
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }

    pub fn get_status(&self) -> CaptureStatusReport {
        CaptureStatusReport {
            status: self.shared.status(),
            monitoring: self.is_monitoring(),
            watched_files: self.shared.watched_files.load(Ordering::SeqCst),
            handlers: self.shared.handlers().len(),
            strategy: self.config.strategy,
        }
    }
}

impl Drop for ResponseCaptureService {
    fn drop(&mut self) {
        if self.is_monitoring() {
            self.stop_capture();
        }
    }
}

/// Counts from one pass over every source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IterationReport {
    pub captured: usize,
    pub failures: usize,
}

/// The monitoring loop body. Owns the watched-file table; nothing else mutates it.
pub(crate) struct CaptureLoop {
    watched: Vec<WatchedFile>,
    clipboard: Option<ClipboardWatch>,
    shared: Arc<Shared>,
    generation: u64,
    missing: HashSet<PathBuf>,
}

impl CaptureLoop {
    pub(crate) fn new(
        watched: Vec<WatchedFile>,
        clipboard: Option<ClipboardWatch>,
        shared: Arc<Shared>,
        generation: u64,
    ) -> Self {
        Self {
            watched,
            clipboard,
            shared,
            generation,
            missing: HashSet::new(),
        }
    }

    fn run(mut self, stop_rx: Receiver<()>) {
        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let pause = match catch_unwind(AssertUnwindSafe(|| self.run_iteration())) {
                Ok(report) if report.failures == 0 => LOOP_INTERVAL,
                Ok(report) => {
                    tracing::debug!(failures = report.failures, "Capture iteration had failures, backing off");
                    ERROR_BACKOFF
                }
                Err(_) => {
                    tracing::error!("Capture iteration panicked, backing off");
                    self.shared.set_loop_status(self.generation, CaptureStatus::Error);
                    ERROR_BACKOFF
                }
            };

            match stop_rx.recv_timeout(pause) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        tracing::debug!("Capture loop exited");
    }

    /// One pass: every watched file first, then the clipboard.
    pub(crate) fn run_iteration(&mut self) -> IterationReport {
        let mut report = IterationReport::default();

        for idx in 0..self.watched.len() {
            match self.check_file(idx) {
                Ok(true) => report.captured += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!("{e}");
                }
            }
        }

        if let Some(clipboard) = self.clipboard.as_mut() {
            match clipboard.poll() {
                Ok(Some(text)) if looks_like_agent_response(&text) => {
                    let response = CapturedResponse::new(CLIPBOARD_AGENT_ID, text, ResponseSource::Clipboard);
                    let outcome = dispatch(&self.shared.handlers(), &response);
                    tracing::info!(delivered = outcome.delivered, "Captured clipboard response");
                    report.captured += 1;
                }
                Ok(Some(_)) => tracing::trace!("Clipboard text does not look like an agent response"),
                Ok(None) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!("{e}");
                }
            }
        }

        report
    }

    /// Returns `Ok(true)` when the file changed and its content was dispatched.
    fn check_file(&mut self, idx: usize) -> Result<bool, CaptureError> {
        let path = self.watched[idx].path.clone();
        let modified = match modified_time(&path) {
            Ok(m) => {
                self.missing.remove(&path);
                m
            }
            // Report a vanished file once, then stay quiet until it comes back
            Err(e) if self.missing.insert(path.clone()) => return Err(e),
            Err(_) => return Ok(false),
        };
        if modified <= self.watched[idx].last_modified {
            return Ok(false);
        }

        self.shared.set_loop_status(self.generation, CaptureStatus::Capturing);
        let result = self.capture_file(idx);
        let status = if result.is_ok() {
            CaptureStatus::Monitoring
        } else {
            CaptureStatus::Error
        };
        self.shared.set_loop_status(self.generation, status);
        result
    }

    fn capture_file(&mut self, idx: usize) -> Result<bool, CaptureError> {
        let watched = &mut self.watched[idx];
        let claimed = claim(&watched.path)?;
        let content = claimed.content.trim().to_string();

        let dispatched = !content.is_empty();
        if dispatched {
            let response = CapturedResponse::new(watched.agent_id.clone(), content, ResponseSource::File)
                .with_metadata("path", watched.path.display().to_string());
            let outcome = dispatch(&self.shared.handlers(), &response);
            tracing::info!(
                agent_id = %watched.agent_id,
                delivered = outcome.delivered,
                failed = outcome.failed,
                "Captured file response"
            );
        }

        watched.last_modified = match acknowledge(&watched.path, claimed)? {
            Some(empty_mtime) => empty_mtime,
            None => {
                tracing::debug!(agent_id = %watched.agent_id, "Newer response arrived during capture");
                // Force the next poll to treat the producer's new file as changed
                SystemTime::UNIX_EPOCH
            }
        };
        Ok(dispatched)
    }
}
