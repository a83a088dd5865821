//! Recovery protocol state machine.
//!
//! The protocol is a fixed sequence of steps; each step either succeeds and
//! moves to the next state or fails and ends in `Failed`. `transition` is
//! pure so the sequence can be checked without a database.

use std::fmt;
use std::time::{Duration, Instant};

use harbor_common::{NodeId, RecoveryStage};

use crate::events::{ClusterEventLog, EventCategory, EventSeverity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Preconditions checked, intent announced, primary connection opened.
    Init,
    /// First CHECKPOINT on the primary.
    Checkpoint1,
    /// First-stage base copy while the cluster keeps serving.
    Copy1,
    /// Waiting for client connections to drain.
    Quiesce,
    Checkpoint2,
    /// Second-stage delta copy.
    Copy2,
    RemoteStart,
    /// Polling the target until it accepts connections.
    AwaitReady,
    /// Waiting for the routing layer to put the node back in service.
    Failback,
    /// Terminal: node recovered.
    Done,
    /// Terminal: attempt aborted, target left down.
    Failed,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::Init => write!(f, "init"),
            RecoveryState::Checkpoint1 => write!(f, "checkpoint_1"),
            RecoveryState::Copy1 => write!(f, "copy_1"),
            RecoveryState::Quiesce => write!(f, "quiesce"),
            RecoveryState::Checkpoint2 => write!(f, "checkpoint_2"),
            RecoveryState::Copy2 => write!(f, "copy_2"),
            RecoveryState::RemoteStart => write!(f, "remote_start"),
            RecoveryState::AwaitReady => write!(f, "await_ready"),
            RecoveryState::Failback => write!(f, "failback"),
            RecoveryState::Done => write!(f, "done"),
            RecoveryState::Failed => write!(f, "failed"),
        }
    }
}

impl RecoveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecoveryState::Done | RecoveryState::Failed)
    }

    /// Which half of the protocol the state belongs to, if any.
    pub fn stage(self) -> Option<RecoveryStage> {
        match self {
            RecoveryState::Checkpoint1 | RecoveryState::Copy1 => Some(RecoveryStage::First),
            RecoveryState::Quiesce | RecoveryState::Checkpoint2 | RecoveryState::Copy2 => {
                Some(RecoveryStage::Second)
            }
            _ => None,
        }
    }

    /// Whether new client connections must be held back in this state.
    pub fn holds_traffic(self) -> bool {
        matches!(
            self,
            RecoveryState::Quiesce
                | RecoveryState::Checkpoint2
                | RecoveryState::Copy2
                | RecoveryState::RemoteStart
                | RecoveryState::AwaitReady
                | RecoveryState::Failback
        )
    }
}

/// Result of running the step for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// Next state after the current state's step finishes with `outcome`.
/// Terminal states have no successor.
pub fn transition(from: RecoveryState, outcome: StepOutcome) -> Option<RecoveryState> {
    use RecoveryState::*;

    if from.is_terminal() {
        return None;
    }
    if outcome == StepOutcome::Failed {
        return Some(Failed);
    }
    Some(match from {
        Init => Checkpoint1,
        Checkpoint1 => Copy1,
        Copy1 => Quiesce,
        Quiesce => Checkpoint2,
        Checkpoint2 => Copy2,
        Copy2 => RemoteStart,
        RemoteStart => AwaitReady,
        AwaitReady => Failback,
        Failback => Done,
        Done | Failed => return None,
    })
}

/// Tracks one recovery attempt and records each transition in the event log.
#[derive(Debug, Clone)]
pub struct RecoveryLifecycle {
    pub node_id: NodeId,
    pub state: RecoveryState,
    pub started_at: Instant,
    pub last_transition: Instant,
    pub error: Option<String>,
    history: Vec<RecoveryState>,
}

impl RecoveryLifecycle {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RecoveryState::Init,
            started_at: Instant::now(),
            last_transition: Instant::now(),
            error: None,
            history: vec![RecoveryState::Init],
        }
    }

    /// Apply the outcome of the current step. Returns the new state, or
    /// `None` if the lifecycle had already ended.
    pub fn advance(
        &mut self,
        outcome: StepOutcome,
        event_log: &ClusterEventLog,
    ) -> Option<RecoveryState> {
        let to = transition(self.state, outcome)?;
        let from = self.state;
        self.state = to;
        self.last_transition = Instant::now();
        self.history.push(to);

        let (severity, message) = match &self.error {
            Some(reason) if to == RecoveryState::Failed => (
                EventSeverity::Error,
                format!("node {} recovery failed in {}: {}", self.node_id, from, reason),
            ),
            _ => (
                EventSeverity::Info,
                format!("node {} recovery: {} -> {}", self.node_id, from, to),
            ),
        };
        event_log.log(
            EventCategory::Recovery,
            severity,
            self.node_id,
            from.to_string(),
            to.to_string(),
            message,
        );
        Some(to)
    }

    /// Mark the current step as failed.
    pub fn fail(&mut self, reason: &str, event_log: &ClusterEventLog) {
        self.error = Some(reason.to_string());
        let _ = self.advance(StepOutcome::Failed, event_log);
    }

    /// The state whose step failed, once the lifecycle has ended in `Failed`.
    pub fn failed_in(&self) -> Option<RecoveryState> {
        match self.history.as_slice() {
            [.., last, RecoveryState::Failed] => Some(*last),
            _ => None,
        }
    }

    pub fn history(&self) -> &[RecoveryState] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecoveryState::*;

    #[test]
    fn test_success_path_visits_every_step_in_order() {
        let mut state = Init;
        let mut path = vec![state];
        while let Some(next) = transition(state, StepOutcome::Succeeded) {
            path.push(next);
            state = next;
        }
        assert_eq!(
            path,
            vec![Init, Checkpoint1, Copy1, Quiesce, Checkpoint2, Copy2, RemoteStart, AwaitReady, Failback, Done]
        );
    }

    #[test]
    fn test_any_step_can_fail() {
        for s in [Init, Checkpoint1, Copy1, Quiesce, Checkpoint2, Copy2, RemoteStart, AwaitReady, Failback] {
            assert_eq!(transition(s, StepOutcome::Failed), Some(Failed), "from {}", s);
        }
    }

    #[test]
    fn test_terminal_states_have_no_successor() {
        for s in [Done, Failed] {
            assert_eq!(transition(s, StepOutcome::Succeeded), None);
            assert_eq!(transition(s, StepOutcome::Failed), None);
        }
    }

    #[test]
    fn test_stage_and_traffic_hold() {
        assert_eq!(Copy1.stage(), Some(RecoveryStage::First));
        assert_eq!(Quiesce.stage(), Some(RecoveryStage::Second));
        assert_eq!(RemoteStart.stage(), None);
        assert!(!Copy1.holds_traffic());
        assert!(Quiesce.holds_traffic());
        assert!(AwaitReady.holds_traffic());
        assert!(!Done.holds_traffic());
    }

    #[test]
    fn test_failed_in_requires_failure() {
        let log = ClusterEventLog::new(32);
        let mut lc = RecoveryLifecycle::new(NodeId(1));
        assert_eq!(lc.failed_in(), None);
        for _ in 0..3 {
            lc.advance(StepOutcome::Succeeded, &log);
        }
        assert_eq!(lc.state, Quiesce);
        lc.fail("timeout", &log);
        assert_eq!(lc.failed_in(), Some(Quiesce));
        assert!(lc.failed_in().is_some_and(RecoveryState::holds_traffic));
    }

    #[test]
    fn test_lifecycle_logs_transitions() {
        let log = ClusterEventLog::new(32);
        let mut lc = RecoveryLifecycle::new(NodeId(2));
        assert_eq!(lc.advance(StepOutcome::Succeeded, &log), Some(Checkpoint1));
        lc.fail("checkpoint refused", &log);
        assert!(lc.is_terminal());
        assert_eq!(lc.history(), &[Init, Checkpoint1, Failed]);
        assert_eq!(lc.failed_in(), Some(Checkpoint1));
        assert_eq!(lc.advance(StepOutcome::Succeeded, &log), None);

        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].severity, EventSeverity::Error);
        assert_eq!(events[1].from_state, "checkpoint_1");
        assert!(events[1].message.contains("checkpoint refused"));
    }
}
