//! Run lifecycle.

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityState, LifecycleEvent};
use crate::fsm::Lifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Assigned,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

named_enum!(RunState {
    Pending => "pending",
    Assigned => "assigned",
    Running => "running",
    Completing => "completing",
    Completed => "completed",
    Failed => "failed",
    Cancelling => "cancelling",
    Cancelled => "cancelled",
});

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// States in which the run occupies its agent.
    pub fn holds_agent(&self) -> bool {
        matches!(
            self,
            RunState::Assigned | RunState::Running | RunState::Completing | RunState::Cancelling
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Assign,
    Start,
    AllStepsDone,
    Finalize,
    Fail,
    Cancel,
}

named_enum!(RunEvent {
    Assign => "assign",
    Start => "start",
    AllStepsDone => "all_steps_done",
    Finalize => "finalize",
    Fail => "fail",
    Cancel => "cancel",
});

/// Hooks the applier runs after a run transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// Record the agent chosen by the scheduler.
    BindAgent,
    /// Stamp `started_at`.
    MarkStarted,
    /// Evaluate step predicates from the current position; skip or finish as needed.
    AdvanceSteps,
    /// Tell the assigned agent to stop working on the run.
    RevokeAgent,
    /// No agent has started executing, so cancellation completes immediately.
    FinalizeUnstarted,
    /// Stamp `finished_at` and settle leftover steps.
    Seal,
    /// Send the assigned agent back toward IDLE.
    ReleaseAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLifecycle;

impl Lifecycle for RunLifecycle {
    type State = RunState;
    type Event = RunEvent;
    type Action = RunAction;

    const KIND: EntityKind = EntityKind::Run;

    const STATES: &'static [RunState] = &[
        RunState::Pending,
        RunState::Assigned,
        RunState::Running,
        RunState::Completing,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelling,
        RunState::Cancelled,
    ];

    const EVENTS: &'static [RunEvent] = &[
        RunEvent::Assign,
        RunEvent::Start,
        RunEvent::AllStepsDone,
        RunEvent::Finalize,
        RunEvent::Fail,
        RunEvent::Cancel,
    ];

    fn edge(state: RunState, event: RunEvent) -> Option<(RunState, &'static [RunAction])> {
        use RunAction as A;
        use RunEvent as E;
        use RunState as S;

        match (state, event) {
            (S::Pending, E::Assign) => Some((S::Assigned, &[A::BindAgent])),
            (S::Assigned, E::Start) => Some((S::Running, &[A::MarkStarted, A::AdvanceSteps])),
            (S::Running, E::AllStepsDone) => Some((S::Completing, &[])),
            (S::Completing, E::Finalize) => Some((S::Completed, &[A::Seal, A::ReleaseAgent])),

            (S::Pending | S::Assigned | S::Running | S::Completing, E::Fail) => {
                Some((S::Failed, &[A::Seal, A::ReleaseAgent]))
            }

            (S::Pending, E::Cancel) => Some((S::Cancelling, &[A::FinalizeUnstarted])),
            (S::Assigned, E::Cancel) => {
                Some((S::Cancelling, &[A::RevokeAgent, A::FinalizeUnstarted]))
            }
            (S::Running, E::Cancel) => Some((S::Cancelling, &[A::RevokeAgent])),
            (S::Cancelling, E::Finalize) => Some((S::Cancelled, &[A::Seal, A::ReleaseAgent])),

            _ => None,
        }
    }

    fn wrap_state(state: RunState) -> EntityState {
        EntityState::Run(state)
    }

    fn wrap_event(event: RunEvent) -> LifecycleEvent {
        LifecycleEvent::Run(event)
    }

    fn unwrap_state(state: EntityState) -> Option<RunState> {
        match state {
            EntityState::Run(s) => Some(s),
            _ => None,
        }
    }

    fn unwrap_event(event: LifecycleEvent) -> Option<RunEvent> {
        match event {
            LifecycleEvent::Run(e) => Some(e),
            _ => None,
        }
    }
}
