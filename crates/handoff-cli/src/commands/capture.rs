use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Args};

use handoff_capture::{
    CaptureError, ClipboardFactory, JsonlArchiveHandler, LogHandler, ResponseCaptureService,
    ResponseHandler,
};
use handoff_core::config::HandoffConfig;
use handoff_core::model::{
    CaptureConfig, CaptureStatus, CaptureStatusReport, CapturedResponse, ResponseSource,
};
use handoff_core::state::{self, CaptureRuntime};

use crate::output::{format, OutputFormat};

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
const SMOKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["test", "start", "stop", "status", "capture"])
))]
pub struct CaptureArgs {
    /// Run a start/capture/stop smoke test in a scratch directory
    #[arg(long)]
    pub test: bool,

    /// Run the capture service in the foreground until `capture --stop`
    #[arg(long)]
    pub start: bool,

    /// Ask a running capture service to stop
    #[arg(long)]
    pub stop: bool,

    /// Show the capture service status
    #[arg(long)]
    pub status: bool,

    /// Dispatch a response by hand: AGENT TEXT SOURCE
    #[arg(long, num_args = 3, value_names = ["AGENT", "TEXT", "SOURCE"])]
    pub capture: Option<Vec<String>>,
}

pub fn run(args: &CaptureArgs, config_path: &Path, format: OutputFormat) -> Result<()> {
    if args.test {
        smoke_test()
    } else if args.start {
        start(&super::load_config(config_path)?)
    } else if args.stop {
        stop(&super::load_config(config_path)?)
    } else if args.status {
        status(&super::load_config(config_path)?, format)
    } else if let Some(values) = &args.capture {
        let [agent, text, source] = values.as_slice() else {
            anyhow::bail!("--capture takes exactly AGENT TEXT SOURCE");
        };
        manual_capture(&super::load_config(config_path)?, agent, text, source)
    } else {
        anyhow::bail!("No capture action given. See `handoff capture --help`.")
    }
}

fn service_with_handlers(config: &HandoffConfig) -> ResponseCaptureService {
    let service = ResponseCaptureService::new(config.capture.clone());
    service.register_handler(Arc::new(JsonlArchiveHandler::new(config.response_archive_path())));
    service.register_handler(Arc::new(LogHandler));
    service
}

fn start(config: &HandoffConfig) -> Result<()> {
    let runtime_path = config.capture_runtime_path();
    let stop_path = config.capture_stop_path();
    if let Some(existing) = state::load_locked::<CaptureRuntime>(&runtime_path)? {
        tracing::warn!(pid = existing.pid, "Found capture runtime file from an earlier run; replacing it");
    }
    state::remove(&stop_path);

    let service = service_with_handlers(config);
    if !service.start_capture() {
        anyhow::bail!("Failed to start response capture");
    }

    let started_at = Utc::now();
    let write_runtime = |report: CaptureStatusReport| {
        let runtime = CaptureRuntime {
            pid: std::process::id(),
            started_at,
            updated_at: Utc::now(),
            report,
        };
        if let Err(e) = state::save_locked(&runtime_path, &runtime) {
            tracing::warn!("Failed to write capture runtime: {e}");
        }
    };

    let report = service.get_status();
    write_runtime(report.clone());
    eprintln!(
        "Capturing responses ({} strategy, {} watched files). Stop with `handoff capture --stop`.",
        report.strategy, report.watched_files
    );

    while !stop_path.exists() {
        std::thread::sleep(SUPERVISE_INTERVAL);
        write_runtime(service.get_status());
    }

    let clean = service.stop_capture();
    state::remove(&stop_path);
    state::remove(&runtime_path);
    if !clean {
        anyhow::bail!("Capture worker exited abnormally");
    }
    println!("Capture stopped.");
    Ok(())
}

fn stop(config: &HandoffConfig) -> Result<()> {
    if state::load_locked::<CaptureRuntime>(&config.capture_runtime_path())?.is_none() {
        println!("Capture service is not running.");
        return Ok(());
    }
    state::touch(&config.capture_stop_path()).context("Failed to write stop request")?;
    println!("Stop requested; the capture service exits within a few seconds.");
    Ok(())
}

fn status(config: &HandoffConfig, fmt: OutputFormat) -> Result<()> {
    let runtime = state::load_locked::<CaptureRuntime>(&config.capture_runtime_path())?;
    let report = match &runtime {
        Some(r) => r.report.clone(),
        None => CaptureStatusReport {
            status: CaptureStatus::Idle,
            monitoring: false,
            watched_files: 0,
            handlers: 0,
            strategy: config.capture.strategy,
        },
    };
    println!("{}", format::format_capture_status(&report, runtime.as_ref(), fmt));
    Ok(())
}

fn manual_capture(config: &HandoffConfig, agent: &str, text: &str, source: &str) -> Result<()> {
    let source: ResponseSource = source.parse().context("Invalid SOURCE")?;
    let service = service_with_handlers(config);
    if !service.capture_response(agent, text, source) {
        anyhow::bail!("Nothing captured: the response text is empty");
    }
    println!("Captured response from {agent} ({source}).");
    Ok(())
}

/// Counts dispatched responses for the smoke test.
struct CountingHandler(Arc<AtomicUsize>);

impl ResponseHandler for CountingHandler {
    fn name(&self) -> &str {
        "smoke-counter"
    }

    fn on_captured_response(&self, _response: &CapturedResponse) -> Result<(), CaptureError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn smoke_test() -> Result<()> {
    let scratch = std::env::temp_dir().join(format!("handoff-smoke-{}", std::process::id()));
    let result = run_smoke_test(&scratch);
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::debug!("Failed to clean up {}: {e}", scratch.display());
    }
    result?;
    println!("Capture smoke test passed.");
    Ok(())
}

fn run_smoke_test(scratch: &Path) -> Result<()> {
    let workspace = scratch.join("smoke-agent");
    std::fs::create_dir_all(&workspace).context("Failed to create scratch workspace")?;
    let response = workspace.join("response.txt");
    std::fs::write(&response, "")?;

    // No clipboard: the smoke test must not consume whatever the user copied
    let no_clipboard: ClipboardFactory = Arc::new(|| None);
    let service = ResponseCaptureService::with_clipboard(CaptureConfig::new(scratch), no_clipboard);
    let count = Arc::new(AtomicUsize::new(0));
    service.register_handler(Arc::new(CountingHandler(Arc::clone(&count))));

    if !service.capture_response("smoke-agent", "manual smoke response", ResponseSource::Manual) {
        anyhow::bail!("Capture smoke test failed: manual capture was rejected");
    }
    if count.load(Ordering::SeqCst) != 1 {
        anyhow::bail!("Capture smoke test failed: manual capture was not dispatched");
    }

    if !service.start_capture() {
        anyhow::bail!("Capture smoke test failed: service did not start");
    }
    if service.start_capture() {
        anyhow::bail!("Capture smoke test failed: second start was not rejected");
    }

    std::fs::write(&response, "file smoke response")?;
    std::fs::OpenOptions::new()
        .write(true)
        .open(&response)?
        .set_modified(SystemTime::now() + Duration::from_secs(1))?;

    let deadline = Instant::now() + SMOKE_TIMEOUT;
    while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    let stopped = service.stop_capture();
    let report = service.get_status();

    if count.load(Ordering::SeqCst) < 2 {
        anyhow::bail!("Capture smoke test failed: file response was not captured");
    }
    if !std::fs::read_to_string(&response)?.is_empty() {
        anyhow::bail!("Capture smoke test failed: response file was not acknowledged");
    }
    if !stopped || report.monitoring || report.status != CaptureStatus::Idle {
        anyhow::bail!("Capture smoke test failed: service did not stop cleanly");
    }
    Ok(())
}
