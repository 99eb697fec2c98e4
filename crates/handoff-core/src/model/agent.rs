use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Inclusive range of repository numbers assigned to an agent.
/// Serialized as a two-element array: `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(u32, u32)", into = "(u32, u32)")]
pub struct RepoRange {
    start: u32,
    end: u32,
}

impl RepoRange {
    pub fn new(start: u32, end: u32) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvalidTopology(format!(
                "repo range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub(crate) const fn new_unchecked(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of repos in the range (never zero). `u64` so `[0, u32::MAX]` fits.
    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, repo: u32) -> bool {
        (self.start..=self.end).contains(&repo)
    }
}

impl TryFrom<(u32, u32)> for RepoRange {
    type Error = CoreError;

    fn try_from((start, end): (u32, u32)) -> Result<Self, Self::Error> {
        Self::new(start, end)
    }
}

impl From<RepoRange> for (u32, u32) {
    fn from(range: RepoRange) -> Self {
        (range.start, range.end)
    }
}

impl std::fmt::Display for RepoRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    /// Accepted from persisted state; progress alone never derives it.
    Starting,
    Executing,
    Completing,
    Complete,
    /// A due hand-off could not be delivered on the latest tick.
    OutOfGas,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Executing => "EXECUTING",
            Self::Completing => "COMPLETING",
            Self::Complete => "COMPLETE",
            Self::OutOfGas => "OUT_OF_GAS",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a hand-off ("gas") message is sent to the next agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GasReason {
    #[serde(rename = "PRIMARY_HANDOFF_75_PERCENT")]
    PrimaryHandoff75,
    #[serde(rename = "SAFETY_BACKUP_90_PERCENT")]
    SafetyBackup90,
    #[serde(rename = "COMPLETION_100_PERCENT")]
    Completion100,
    #[serde(rename = "MANUAL_OVERRIDE")]
    ManualOverride,
}

impl GasReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryHandoff75 => "PRIMARY_HANDOFF_75_PERCENT",
            Self::SafetyBackup90 => "SAFETY_BACKUP_90_PERCENT",
            Self::Completion100 => "COMPLETION_100_PERCENT",
            Self::ManualOverride => "MANUAL_OVERRIDE",
        }
    }

    /// Human-facing urgency line carried in the hand-off message.
    pub fn headline(self) -> &'static str {
        match self {
            Self::PrimaryHandoff75 => "Primary hand-off: prepare to start your repos now",
            Self::SafetyBackup90 => "Safety backup: upstream is nearly done, start immediately",
            Self::Completion100 => "Upstream complete: your repos are fully unblocked",
            Self::ManualOverride => "Operator override: start your repos",
        }
    }
}

impl std::fmt::Display for GasReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent pipeline record.
///
/// The three `gas_sent_at_*` flags are one-shot latches: `latch` only ever
/// sets them, and only `reset_latches` (operator recovery) clears them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineAgent {
    pub agent_id: String,
    pub repos_assigned: RepoRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    pub current_repo: u32,
    pub state: AgentState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_gas_sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gas_sent_at_75: bool,
    #[serde(default)]
    pub gas_sent_at_90: bool,
    #[serde(default)]
    pub gas_sent_at_100: bool,
}

impl PipelineAgent {
    pub fn new(agent_id: impl Into<String>, repos_assigned: RepoRange, next_agent: Option<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            repos_assigned,
            next_agent,
            current_repo: repos_assigned.start(),
            state: AgentState::Idle,
            progress: 0.0,
            last_gas_sent: None,
            gas_sent_at_75: false,
            gas_sent_at_90: false,
            gas_sent_at_100: false,
        }
    }

    /// True when nothing follows this agent in the pipeline.
    pub fn is_terminal(&self) -> bool {
        self.next_agent.is_none()
    }

    /// Whether the latch for `reason` has fired. Manual overrides have no latch.
    pub fn is_latched(&self, reason: GasReason) -> bool {
        match reason {
            GasReason::PrimaryHandoff75 => self.gas_sent_at_75,
            GasReason::SafetyBackup90 => self.gas_sent_at_90,
            GasReason::Completion100 => self.gas_sent_at_100,
            GasReason::ManualOverride => false,
        }
    }

    /// Record a successful delivery for `reason`.
    pub fn latch(&mut self, reason: GasReason, at: DateTime<Utc>) {
        match reason {
            GasReason::PrimaryHandoff75 => self.gas_sent_at_75 = true,
            GasReason::SafetyBackup90 => self.gas_sent_at_90 = true,
            GasReason::Completion100 => self.gas_sent_at_100 = true,
            GasReason::ManualOverride => {}
        }
        self.last_gas_sent = Some(at);
    }

    /// Operator recovery: clear latches and return to the initial state.
    pub fn reset_latches(&mut self) {
        self.gas_sent_at_75 = false;
        self.gas_sent_at_90 = false;
        self.gas_sent_at_100 = false;
        self.last_gas_sent = None;
        self.current_repo = self.repos_assigned.start();
        self.state = AgentState::Idle;
        self.progress = 0.0;
    }

    /// Carry persisted delivery history over onto a freshly built agent.
    pub fn restore_from(&mut self, saved: &PipelineAgent) {
        self.gas_sent_at_75 |= saved.gas_sent_at_75;
        self.gas_sent_at_90 |= saved.gas_sent_at_90;
        self.gas_sent_at_100 |= saved.gas_sent_at_100;
        if self.last_gas_sent.is_none() {
            self.last_gas_sent = saved.last_gas_sent;
        }
        self.progress = saved.progress;
        self.state = saved.state;
        if self.repos_assigned.contains(saved.current_repo) {
            self.current_repo = saved.current_repo;
        }
    }
}
