use chrono::Utc;
use uuid::Uuid;

use handoff_core::config::PipelineConfig;
use handoff_core::model::{AgentState, GasReason, PipelineAgent};
use handoff_core::state::PipelineState;

use crate::delivery::{GasMessage, MessageDelivery};
use crate::error::PipelineError;
use crate::fsm::{derive_state, due_reasons};
use crate::progress::{ProgressReading, StatusReader};

/// Result of one hand-off attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasOutcome {
    Delivered(Uuid),
    /// The agent ends the pipeline; nothing was sent and nothing was latched.
    Terminal,
}

/// What one tick did for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTick {
    pub agent_id: String,
    pub progress: f64,
    pub state: AgentState,
    pub delivered: Vec<GasReason>,
    pub failed: Vec<GasReason>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub agents: Vec<AgentTick>,
}

impl TickReport {
    pub fn delivered(&self) -> usize {
        self.agents.iter().map(|a| a.delivered.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.agents.iter().map(|a| a.failed.len()).sum()
    }
}

/// Owns every pipeline agent, reads their progress and sends threshold hand-offs.
pub struct AutoGasPipelineSystem {
    agents: Vec<PipelineAgent>,
    status: StatusReader,
    delivery: Box<dyn MessageDelivery>,
}

impl AutoGasPipelineSystem {
    /// Build the agent set from a validated topology.
    pub fn new(config: &PipelineConfig, delivery: Box<dyn MessageDelivery>) -> Self {
        let agents = config.agents.iter().map(|t| t.to_agent()).collect();
        Self::from_agents(agents, StatusReader::from_config(config), delivery)
    }

    pub fn from_agents(agents: Vec<PipelineAgent>, status: StatusReader, delivery: Box<dyn MessageDelivery>) -> Self {
        Self {
            agents,
            status,
            delivery,
        }
    }

    pub fn agents(&self) -> &[PipelineAgent] {
        &self.agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<&PipelineAgent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    fn index_of(&self, agent_id: &str) -> Result<usize, PipelineError> {
        self.agents
            .iter()
            .position(|a| a.agent_id == agent_id)
            .ok_or_else(|| PipelineError::UnknownAgent(agent_id.to_string()))
    }

    /// Current progress for `agent_id` from its status artifact.
    pub fn read_progress(&self, agent_id: &str) -> Result<ProgressReading, PipelineError> {
        let idx = self.index_of(agent_id)?;
        Ok(self.status.read(&self.agents[idx]))
    }

    /// Reasons due for `agent_id` at `progress` that have not been delivered yet.
    pub fn should_send_gas(&self, agent_id: &str, progress: f64) -> Result<Vec<GasReason>, PipelineError> {
        let idx = self.index_of(agent_id)?;
        Ok(due_reasons(&self.agents[idx], progress))
    }

    /// Deliver one hand-off for `reason` to the agent's successor.
    ///
    /// The latch is set only after the delivery succeeds; a delivery error
    /// leaves it clear so the next tick tries again.
    pub fn send_auto_gas(
        &mut self,
        agent_id: &str,
        reason: GasReason,
        progress: f64,
    ) -> Result<GasOutcome, PipelineError> {
        let idx = self.index_of(agent_id)?;
        send_gas(self.delivery.as_ref(), &mut self.agents[idx], reason, progress)
    }

    /// One pass over every agent: read status, derive state, send whatever is due.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        for agent in &mut self.agents {
            let reading = self.status.read(agent);
            agent.progress = reading.progress;
            agent.current_repo = reading.current_repo;
            agent.state = derive_state(reading.progress);

            let mut tick = AgentTick {
                agent_id: agent.agent_id.clone(),
                progress: reading.progress,
                state: agent.state,
                delivered: Vec::new(),
                failed: Vec::new(),
            };

            for reason in due_reasons(agent, reading.progress) {
                match send_gas(self.delivery.as_ref(), agent, reason, reading.progress) {
                    Ok(GasOutcome::Delivered(_)) => tick.delivered.push(reason),
                    Ok(GasOutcome::Terminal) => {}
                    Err(e) => {
                        tracing::warn!(agent_id = %agent.agent_id, reason = %reason, "Hand-off failed, will retry next tick: {e}");
                        tick.failed.push(reason);
                    }
                }
            }

            if !tick.failed.is_empty() {
                agent.state = AgentState::OutOfGas;
                tick.state = AgentState::OutOfGas;
            }
            tracing::debug!(
                agent_id = %agent.agent_id,
                progress = reading.progress,
                state = %agent.state,
                "Tick"
            );
            report.agents.push(tick);
        }
        report
    }

    /// Operator override: send a MANUAL_OVERRIDE hand-off now. Latches are untouched.
    pub fn force_gas(&mut self, agent_id: &str) -> Result<Uuid, PipelineError> {
        let idx = self.index_of(agent_id)?;
        let agent = &mut self.agents[idx];
        let progress = agent.progress;
        match send_gas(self.delivery.as_ref(), agent, GasReason::ManualOverride, progress)? {
            GasOutcome::Delivered(id) => Ok(id),
            GasOutcome::Terminal => Err(PipelineError::Terminal(agent_id.to_string())),
        }
    }

    /// Recovery: clear every latch of one agent so its hand-offs can fire again.
    pub fn reset_agent(&mut self, agent_id: &str) -> Result<(), PipelineError> {
        let idx = self.index_of(agent_id)?;
        self.agents[idx].reset_latches();
        tracing::info!(agent_id, "Reset pipeline agent");
        Ok(())
    }

    pub fn reset_all(&mut self) {
        for agent in &mut self.agents {
            agent.reset_latches();
        }
        tracing::info!(agents = self.agents.len(), "Reset all pipeline agents");
    }

    /// Carry latches and last-known progress over from persisted state.
    ///
    /// Agents no longer in the topology are ignored. Returns how many were restored.
    pub fn restore(&mut self, saved: &PipelineState) -> usize {
        let mut restored = 0;
        for agent in &mut self.agents {
            if let Some(previous) = saved.agent(&agent.agent_id) {
                agent.restore_from(previous);
                restored += 1;
            }
        }
        restored
    }

    pub fn snapshot(&self) -> PipelineState {
        PipelineState::new(self.agents.clone())
    }
}

fn send_gas(
    delivery: &dyn MessageDelivery,
    agent: &mut PipelineAgent,
    reason: GasReason,
    progress: f64,
) -> Result<GasOutcome, PipelineError> {
    let Some(next_agent) = agent.next_agent.clone() else {
        tracing::debug!(agent_id = %agent.agent_id, reason = %reason, "End of pipeline, no hand-off to send");
        return Ok(GasOutcome::Terminal);
    };

    let message = GasMessage::new(agent, next_agent, reason, progress);
    delivery.deliver(&message)?;
    agent.latch(reason, Utc::now());
    tracing::info!(
        agent_id = %agent.agent_id,
        to = %message.to_agent,
        reason = %reason,
        progress,
        "Sent hand-off"
    );
    Ok(GasOutcome::Delivered(message.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::RecordingDelivery;
    use handoff_core::model::RepoRange;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn chain() -> Vec<PipelineAgent> {
        vec![
            PipelineAgent::new("Agent-1", RepoRange::new(1, 10).unwrap(), Some("Agent-2".into())),
            PipelineAgent::new("Agent-2", RepoRange::new(11, 20).unwrap(), None),
        ]
    }

    fn system(root: &Path) -> (AutoGasPipelineSystem, RecordingDelivery) {
        let delivery = RecordingDelivery::default();
        let system = AutoGasPipelineSystem::from_agents(
            chain(),
            StatusReader::new(root, "status.json"),
            Box::new(delivery.clone()),
        );
        (system, delivery)
    }

    fn write_status(root: &Path, agent: &str, completed: &[u32]) {
        let tasks: Vec<String> = completed.iter().map(|n| format!("Repo #{n} complete")).collect();
        let dir = root.join(agent);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status.json"),
            serde_json::json!({ "completed_tasks": tasks }).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn test_handoff_scenario() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());

        write_status(tmp.path(), "Agent-1", &[1, 2]);
        let report = system.tick();
        let a1 = system.agent("Agent-1").unwrap();
        assert_eq!(a1.progress, 20.0);
        assert_eq!(a1.state, AgentState::Executing);
        assert_eq!(a1.current_repo, 3);
        assert_eq!(report.delivered(), 0);
        assert!(delivery.sent().is_empty());

        write_status(tmp.path(), "Agent-1", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let report = system.tick();
        assert_eq!(report.agents[0].delivered, vec![GasReason::PrimaryHandoff75]);
        let a1 = system.agent("Agent-1").unwrap();
        assert!(a1.gas_sent_at_75);
        assert!(!a1.gas_sent_at_90);

        // Same progress again: nothing new
        system.tick();
        let sent = delivery.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_agent, "Agent-2");
        assert_eq!(sent[0].reason, GasReason::PrimaryHandoff75);
    }

    #[test]
    fn test_latch_is_monotonic_across_progress_changes() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());

        let progressions: [Vec<u32>; 4] = [vec![1, 2, 3, 4, 5, 6, 7, 8], vec![1], vec![], vec![1, 2, 3, 4, 5, 6, 7, 8]];
        for completed in progressions {
            write_status(tmp.path(), "Agent-1", &completed);
            system.tick();
            assert!(system.agent("Agent-1").unwrap().gas_sent_at_75);
            assert!(!system
                .should_send_gas("Agent-1", 80.0)
                .unwrap()
                .contains(&GasReason::PrimaryHandoff75));
        }
        assert_eq!(delivery.sent().len(), 1);
    }

    #[test]
    fn test_jump_to_complete_sends_three() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());

        assert_eq!(
            system.should_send_gas("Agent-1", 100.0).unwrap(),
            vec![
                GasReason::PrimaryHandoff75,
                GasReason::SafetyBackup90,
                GasReason::Completion100
            ]
        );

        write_status(tmp.path(), "Agent-1", &(1..=10).collect::<Vec<u32>>());
        let report = system.tick();
        assert_eq!(report.delivered(), 3);

        let reasons: Vec<_> = delivery.sent().iter().map(|m| m.reason).collect();
        assert_eq!(
            reasons,
            vec![
                GasReason::PrimaryHandoff75,
                GasReason::SafetyBackup90,
                GasReason::Completion100
            ]
        );
        let a1 = system.agent("Agent-1").unwrap();
        assert!(a1.gas_sent_at_75 && a1.gas_sent_at_90 && a1.gas_sent_at_100);
        assert_eq!(a1.state, AgentState::Complete);
    }

    #[test]
    fn test_terminal_agent_is_a_silent_no_op() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());

        for reason in [
            GasReason::PrimaryHandoff75,
            GasReason::SafetyBackup90,
            GasReason::Completion100,
        ] {
            assert_eq!(
                system.send_auto_gas("Agent-2", reason, 100.0).unwrap(),
                GasOutcome::Terminal
            );
        }
        let a2 = system.agent("Agent-2").unwrap();
        assert!(!a2.gas_sent_at_75 && !a2.gas_sent_at_90 && !a2.gas_sent_at_100);
        assert!(a2.last_gas_sent.is_none());
        assert!(delivery.sent().is_empty());

        // Ticking a completed terminal agent never errors or marks it out of gas
        write_status(tmp.path(), "Agent-2", &(11..=20).collect::<Vec<u32>>());
        let report = system.tick();
        assert_eq!(report.agents[1].state, AgentState::Complete);
        assert!(report.agents[1].failed.is_empty());
    }

    #[test]
    fn test_failed_delivery_is_retried() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());
        delivery.fail_times(1);

        let err = system
            .send_auto_gas("Agent-1", GasReason::PrimaryHandoff75, 80.0)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Delivery(_)));
        assert!(!system.agent("Agent-1").unwrap().gas_sent_at_75);

        write_status(tmp.path(), "Agent-1", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let report = system.tick();
        assert_eq!(report.agents[0].delivered, vec![GasReason::PrimaryHandoff75]);
        assert!(system.agent("Agent-1").unwrap().gas_sent_at_75);
        assert_eq!(delivery.sent().len(), 1);
    }

    #[test]
    fn test_failed_tick_shows_out_of_gas_then_recovers() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());
        write_status(tmp.path(), "Agent-1", &[1, 2, 3, 4, 5, 6, 7, 8]);

        delivery.fail_times(1);
        let report = system.tick();
        assert_eq!(report.agents[0].failed, vec![GasReason::PrimaryHandoff75]);
        assert_eq!(system.agent("Agent-1").unwrap().state, AgentState::OutOfGas);

        system.tick();
        assert_eq!(system.agent("Agent-1").unwrap().state, AgentState::Executing);
        assert_eq!(delivery.sent().len(), 1);
    }

    #[test]
    fn test_force_gas_leaves_latches() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());

        let id = system.force_gas("Agent-1").unwrap();
        let sent = delivery.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].reason, GasReason::ManualOverride);
        let a1 = system.agent("Agent-1").unwrap();
        assert!(!a1.gas_sent_at_75);
        assert!(a1.last_gas_sent.is_some());

        assert!(matches!(system.force_gas("Agent-2"), Err(PipelineError::Terminal(_))));
        assert!(matches!(system.force_gas("Agent-9"), Err(PipelineError::UnknownAgent(_))));
    }

    #[test]
    fn test_reset_allows_resend() {
        let tmp = TempDir::new().unwrap();
        let (mut system, delivery) = system(tmp.path());
        write_status(tmp.path(), "Agent-1", &[1, 2, 3, 4, 5, 6, 7, 8]);
        system.tick();

        system.reset_agent("Agent-1").unwrap();
        assert!(!system.agent("Agent-1").unwrap().gas_sent_at_75);
        system.tick();
        assert_eq!(delivery.sent().len(), 2);

        system.reset_all();
        assert!(system.agents().iter().all(|a| !a.gas_sent_at_75));
        assert!(system.reset_agent("nobody").is_err());
    }

    #[test]
    fn test_restore_prevents_duplicate_after_restart() {
        let tmp = TempDir::new().unwrap();
        write_status(tmp.path(), "Agent-1", &[1, 2, 3, 4, 5, 6, 7, 8]);

        let (mut first, first_delivery) = system(tmp.path());
        first.tick();
        assert_eq!(first_delivery.sent().len(), 1);
        let saved = first.snapshot();

        let (mut second, second_delivery) = system(tmp.path());
        assert_eq!(second.restore(&saved), 2);
        second.tick();
        assert!(second_delivery.sent().is_empty());
    }

    #[test]
    fn test_unknown_agent_errors() {
        let tmp = TempDir::new().unwrap();
        let (mut system, _) = system(tmp.path());
        assert!(matches!(system.read_progress("ghost"), Err(PipelineError::UnknownAgent(_))));
        assert!(system.should_send_gas("ghost", 80.0).is_err());
        assert!(system.send_auto_gas("ghost", GasReason::PrimaryHandoff75, 80.0).is_err());
        assert_eq!(system.read_progress("Agent-1").unwrap().progress, 0.0);
    }
}
