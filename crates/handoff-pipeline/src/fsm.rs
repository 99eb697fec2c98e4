use handoff_core::model::{AgentState, GasReason, PipelineAgent};

pub const IDLE_CEILING: f64 = 10.0;
pub const PRIMARY_HANDOFF_THRESHOLD: f64 = 75.0;
pub const SAFETY_BACKUP_THRESHOLD: f64 = 90.0;
pub const COMPLETING_THRESHOLD: f64 = 95.0;
pub const COMPLETE: f64 = 100.0;

/// Lifecycle state as a pure function of progress.
///
/// ```text
/// p < 10        IDLE
/// 10 <= p < 95  EXECUTING
/// 95 <= p < 100 COMPLETING
/// p >= 100      COMPLETE
/// ```
///
/// `STARTING` and `OUT_OF_GAS` are never derived here. Progress alone folds
/// `STARTING` into the idle band; `OUT_OF_GAS` is an overlay applied after a
/// failed hand-off.
pub fn derive_state(progress: f64) -> AgentState {
    let p = clamp_progress(progress);
    if p < IDLE_CEILING {
        AgentState::Idle
    } else if p < COMPLETING_THRESHOLD {
        AgentState::Executing
    } else if p < COMPLETE {
        AgentState::Completing
    } else {
        AgentState::Complete
    }
}

/// Every hand-off reason that is due at `progress` and not yet latched, in threshold order.
///
/// Reasons are independent: a jump straight to 100 yields all three.
pub fn due_reasons(agent: &PipelineAgent, progress: f64) -> Vec<GasReason> {
    let p = clamp_progress(progress);
    [
        (GasReason::PrimaryHandoff75, p > PRIMARY_HANDOFF_THRESHOLD),
        (GasReason::SafetyBackup90, p > SAFETY_BACKUP_THRESHOLD),
        (GasReason::Completion100, p >= COMPLETE),
    ]
    .into_iter()
    .filter(|&(reason, crossed)| crossed && !agent.is_latched(reason))
    .map(|(reason, _)| reason)
    .collect()
}

/// Clamp into [0, 100]; NaN reads as no progress.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, COMPLETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use handoff_core::model::RepoRange;

    fn agent() -> PipelineAgent {
        PipelineAgent::new("Agent-1", RepoRange::new(1, 10).unwrap(), Some("Agent-2".into()))
    }

    #[test]
    fn test_derive_state_boundaries() {
        assert_eq!(derive_state(0.0), AgentState::Idle);
        assert_eq!(derive_state(-3.0), AgentState::Idle);
        assert_eq!(derive_state(f64::NAN), AgentState::Idle);
        assert_eq!(derive_state(5.0), AgentState::Idle);
        assert_eq!(derive_state(9.9), AgentState::Idle);
        assert_eq!(derive_state(10.0), AgentState::Executing);
        assert_eq!(derive_state(20.0), AgentState::Executing);
        assert_eq!(derive_state(94.9), AgentState::Executing);
        assert_eq!(derive_state(95.0), AgentState::Completing);
        assert_eq!(derive_state(99.9), AgentState::Completing);
        assert_eq!(derive_state(100.0), AgentState::Complete);
        assert_eq!(derive_state(140.0), AgentState::Complete);
    }

    #[test]
    fn test_thresholds_are_strict_for_75_and_90() {
        let a = agent();
        assert!(due_reasons(&a, 75.0).is_empty());
        assert_eq!(due_reasons(&a, 75.1), vec![GasReason::PrimaryHandoff75]);
        assert_eq!(
            due_reasons(&a, 90.0),
            vec![GasReason::PrimaryHandoff75]
        );
        assert_eq!(
            due_reasons(&a, 90.5),
            vec![GasReason::PrimaryHandoff75, GasReason::SafetyBackup90]
        );
    }

    #[test]
    fn test_jump_to_complete_fires_all_reasons() {
        assert_eq!(
            due_reasons(&agent(), 100.0),
            vec![
                GasReason::PrimaryHandoff75,
                GasReason::SafetyBackup90,
                GasReason::Completion100
            ]
        );
    }

    #[test]
    fn test_latched_reasons_never_return() {
        let mut a = agent();
        a.latch(GasReason::PrimaryHandoff75, Utc::now());
        for p in [0.0, 50.0, 76.0, 80.0, 91.0, 100.0, 10.0, 99.0] {
            assert!(!due_reasons(&a, p).contains(&GasReason::PrimaryHandoff75), "p = {p}");
        }
        assert_eq!(
            due_reasons(&a, 100.0),
            vec![GasReason::SafetyBackup90, GasReason::Completion100]
        );
    }

    #[test]
    fn test_derive_state_ignores_latches() {
        let mut a = agent();
        a.latch(GasReason::Completion100, Utc::now());
        assert_eq!(derive_state(20.0), AgentState::Executing);
        assert!(due_reasons(&a, 20.0).is_empty());
    }
}
