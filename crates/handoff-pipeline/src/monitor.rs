use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use handoff_core::model::{AgentState, PipelineAgent, RepoRange};
use handoff_core::state::{self, PipelineState};

use crate::error::PipelineError;
use crate::system::{AutoGasPipelineSystem, TickReport};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives an [`AutoGasPipelineSystem`] on a fixed interval in a background thread.
pub struct PipelineMonitor {
    system: Arc<Mutex<AutoGasPipelineSystem>>,
    interval: Duration,
    state_path: Option<PathBuf>,
    last_tick: Arc<Mutex<Option<DateTime<Utc>>>>,
    worker: Option<Worker>,
}

impl PipelineMonitor {
    pub fn new(system: AutoGasPipelineSystem, interval: Duration) -> Self {
        Self {
            system: Arc::new(Mutex::new(system)),
            interval,
            state_path: None,
            last_tick: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Persist agent records to `path` after every tick and restore them from it on start.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    /// Run `f` against the system under its lock (operator commands, tests).
    pub fn with_system<R>(&self, f: impl FnOnce(&mut AutoGasPipelineSystem) -> R) -> R {
        f(&mut lock(&self.system))
    }

    /// Load persisted latches into the system. Returns how many agents were restored.
    pub fn restore(&self) -> Result<usize, PipelineError> {
        let Some(path) = &self.state_path else {
            return Ok(0);
        };
        let Some(saved) = state::load_locked::<PipelineState>(path)? else {
            return Ok(0);
        };
        let restored = lock(&self.system).restore(&saved);
        tracing::info!(restored, path = %path.display(), "Restored pipeline state");
        Ok(restored)
    }

    /// Start ticking: once immediately, then every interval. `Ok(false)` if already running.
    pub fn start(&mut self) -> Result<bool, PipelineError> {
        if self.is_running() {
            tracing::warn!("Pipeline monitor is already running");
            return Ok(false);
        }
        self.restore()?;

        let (stop_tx, stop_rx) = mpsc::channel();
        let ctx = TickContext {
            system: Arc::clone(&self.system),
            state_path: self.state_path.clone(),
            last_tick: Arc::clone(&self.last_tick),
        };
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("pipeline-monitor".into())
            .spawn(move || run_loop(ctx, interval, stop_rx))
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        self.worker = Some(Worker { stop_tx, handle });
        tracing::info!(interval_secs = interval.as_secs(), "Pipeline monitor started");
        Ok(true)
    }

    /// Signal the loop and wait up to two seconds for it. A slow tick is detached.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let _ = worker.stop_tx.send(());
        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !worker.handle.is_finished() {
            tracing::warn!("Pipeline monitor did not stop within {}s; detaching it", STOP_JOIN_TIMEOUT.as_secs());
            return true;
        }
        match worker.handle.join() {
            Ok(()) => {
                tracing::info!("Pipeline monitor stopped");
                true
            }
            Err(_) => {
                tracing::error!("Pipeline monitor thread panicked");
                false
            }
        }
    }

    /// Run one tick on the calling thread, persisting afterwards.
    pub fn tick_now(&self) -> TickReport {
        TickContext {
            system: Arc::clone(&self.system),
            state_path: self.state_path.clone(),
            last_tick: Arc::clone(&self.last_tick),
        }
        .tick()
    }

    /// Write the current agent records to the state file, if one is configured.
    pub fn persist(&self) -> Result<(), PipelineError> {
        if let Some(path) = &self.state_path {
            let snapshot = lock(&self.system).snapshot();
            state::save_locked(path, &snapshot)?;
        }
        Ok(())
    }

    /// Read-only projection of every agent for operators.
    pub fn dashboard(&self) -> PipelineDashboard {
        let agents = lock(&self.system).agents().to_vec();
        let last_tick = *lock(&self.last_tick);
        PipelineDashboard::from_agents(&agents, Some(self.is_running()), Some(self.interval.as_secs()), last_tick)
    }
}

impl Drop for PipelineMonitor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

struct TickContext {
    system: Arc<Mutex<AutoGasPipelineSystem>>,
    state_path: Option<PathBuf>,
    last_tick: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl TickContext {
    fn tick(&self) -> TickReport {
        let (report, snapshot) = {
            let mut system = lock(&self.system);
            let report = system.tick();
            (report, system.snapshot())
        };
        *lock(&self.last_tick) = Some(snapshot.updated_at);

        if let Some(path) = &self.state_path {
            if let Err(e) = state::save_locked(path, &snapshot) {
                tracing::warn!("Failed to persist pipeline state to {}: {e}", path.display());
            }
        }
        if report.delivered() > 0 || report.failed() > 0 {
            tracing::info!(delivered = report.delivered(), failed = report.failed(), "Pipeline tick");
        }
        report
    }
}

fn run_loop(ctx: TickContext, interval: Duration, stop_rx: Receiver<()>) {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.tick())).is_err() {
            tracing::error!("Pipeline tick panicked; continuing");
        }
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    tracing::debug!("Pipeline monitor loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!("Recovering poisoned pipeline lock");
        e.into_inner()
    })
}

/// One dashboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRow {
    pub agent_id: String,
    pub repos: RepoRange,
    pub current_repo: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    pub state: AgentState,
    pub progress: f64,
    pub gas_sent_at_75: bool,
    pub gas_sent_at_90: bool,
    pub gas_sent_at_100: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_gas_sent: Option<DateTime<Utc>>,
}

impl From<&PipelineAgent> for AgentRow {
    fn from(agent: &PipelineAgent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            repos: agent.repos_assigned,
            current_repo: agent.current_repo,
            next_agent: agent.next_agent.clone(),
            state: agent.state,
            progress: agent.progress,
            gas_sent_at_75: agent.gas_sent_at_75,
            gas_sent_at_90: agent.gas_sent_at_90,
            gas_sent_at_100: agent.gas_sent_at_100,
            last_gas_sent: agent.last_gas_sent,
        }
    }
}

impl AgentRow {
    /// `75[x] 90[ ] 100[ ]` style latch marks.
    pub fn latch_summary(&self) -> String {
        let mark = |b: bool| if b { "x" } else { " " };
        format!(
            "75[{}] 90[{}] 100[{}]",
            mark(self.gas_sent_at_75),
            mark(self.gas_sent_at_90),
            mark(self.gas_sent_at_100)
        )
    }
}

/// Snapshot of the whole pipeline. `running` and `interval_secs` are unknown when
/// the dashboard is built from a state file by another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDashboard {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<DateTime<Utc>>,
    pub agents: Vec<AgentRow>,
}

impl PipelineDashboard {
    pub fn from_agents(
        agents: &[PipelineAgent],
        running: Option<bool>,
        interval_secs: Option<u64>,
        last_tick: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            running,
            interval_secs,
            last_tick,
            agents: agents.iter().map(AgentRow::from).collect(),
        }
    }

    pub fn from_state(state: &PipelineState) -> Self {
        Self::from_agents(&state.agents, None, None, Some(state.updated_at))
    }

    /// Agents whose latest hand-off attempt failed.
    pub fn overdue(&self) -> impl Iterator<Item = &AgentRow> {
        self.agents.iter().filter(|a| a.state == AgentState::OutOfGas)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let running = match self.running {
            Some(true) => "running",
            Some(false) => "stopped",
            None => "unknown",
        };
        let _ = write!(out, "Pipeline: {running}");
        if let Some(secs) = self.interval_secs {
            let _ = write!(out, ", every {secs}s");
        }
        if let Some(at) = self.last_tick {
            let _ = write!(out, ", last tick {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "{:<12} {:<9} {:>5} {:<11} {:>7}  {:<20} {}",
            "AGENT", "REPOS", "AT", "STATE", "PROG", "GAS", "NEXT"
        );
        for row in &self.agents {
            let _ = writeln!(
                out,
                "{:<12} {:<9} {:>5} {:<11} {:>6.1}%  {:<20} {}",
                row.agent_id,
                row.repos.to_string(),
                format!("#{}", row.current_repo),
                row.state.as_str(),
                row.progress,
                row.latch_summary(),
                row.next_agent.as_deref().unwrap_or("-"),
            );
        }

        let overdue: Vec<&str> = self.overdue().map(|a| a.agent_id.as_str()).collect();
        if !overdue.is_empty() {
            let _ = writeln!(out, "Overdue hand-offs: {}", overdue.join(", "));
        }
        out
    }
}
