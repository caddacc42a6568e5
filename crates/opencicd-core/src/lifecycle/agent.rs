//! Agent lifecycle.

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityState, LifecycleEvent};
use crate::fsm::Lifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Assigned,
    Running,
    Reporting,
    Failed,
    Offline,
}

named_enum!(AgentState {
    Idle => "idle",
    Assigned => "assigned",
    Running => "running",
    Reporting => "reporting",
    Failed => "failed",
    Offline => "offline",
});

impl AgentState {
    /// States in which the agent holds a run.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            AgentState::Assigned | AgentState::Running | AgentState::Reporting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    PollOrHeartbeat,
    Assign,
    Start,
    Complete,
    ReportAck,
    Fail,
    Reconnect,
    HeartbeatTimeout,
}

named_enum!(AgentEvent {
    PollOrHeartbeat => "poll_or_heartbeat",
    Assign => "assign",
    Start => "start",
    Complete => "complete",
    ReportAck => "report_ack",
    Fail => "fail",
    Reconnect => "reconnect",
    HeartbeatTimeout => "heartbeat_timeout",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Refresh last-heartbeat.
    Touch,
    /// Record the run handed over by the scheduler.
    BindRun,
    /// Clear the current run after a completed report.
    UnbindRun,
    /// Clear the current run and fail (or finish cancelling) it.
    DetachRun,
    /// The agent can take work; wake the scheduler.
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLifecycle;

impl Lifecycle for AgentLifecycle {
    type State = AgentState;
    type Event = AgentEvent;
    type Action = AgentAction;

    const KIND: EntityKind = EntityKind::Agent;

    const STATES: &'static [AgentState] = &[
        AgentState::Idle,
        AgentState::Assigned,
        AgentState::Running,
        AgentState::Reporting,
        AgentState::Failed,
        AgentState::Offline,
    ];

    const EVENTS: &'static [AgentEvent] = &[
        AgentEvent::PollOrHeartbeat,
        AgentEvent::Assign,
        AgentEvent::Start,
        AgentEvent::Complete,
        AgentEvent::ReportAck,
        AgentEvent::Fail,
        AgentEvent::Reconnect,
        AgentEvent::HeartbeatTimeout,
    ];

    fn edge(state: AgentState, event: AgentEvent) -> Option<(AgentState, &'static [AgentAction])> {
        use AgentAction as A;
        use AgentEvent as E;
        use AgentState as S;

        match (state, event) {
            (S::Idle, E::PollOrHeartbeat) => Some((S::Idle, &[A::Touch])),
            (S::Idle, E::Assign) => Some((S::Assigned, &[A::BindRun])),
            (S::Assigned, E::Start) => Some((S::Running, &[])),
            (S::Running, E::Complete) => Some((S::Reporting, &[])),
            // Release path for a run cancelled or finished before the agent started it.
            (S::Assigned, E::Complete) => Some((S::Reporting, &[])),
            (S::Reporting, E::ReportAck) => Some((S::Idle, &[A::UnbindRun, A::Available])),

            (S::Assigned, E::Fail) => Some((S::Failed, &[A::DetachRun])),
            (S::Running, E::Fail) => Some((S::Failed, &[A::DetachRun])),
            (S::Reporting, E::Fail) => Some((S::Failed, &[A::DetachRun])),

            (S::Idle, E::HeartbeatTimeout) => Some((S::Offline, &[A::DetachRun])),
            (S::Assigned, E::HeartbeatTimeout) => Some((S::Offline, &[A::DetachRun])),
            (S::Running, E::HeartbeatTimeout) => Some((S::Offline, &[A::DetachRun])),
            (S::Reporting, E::HeartbeatTimeout) => Some((S::Offline, &[A::DetachRun])),
            (S::Failed, E::HeartbeatTimeout) => Some((S::Offline, &[A::DetachRun])),

            (S::Failed, E::Reconnect) => Some((S::Idle, &[A::Available])),
            (S::Offline, E::Reconnect) => Some((S::Idle, &[A::Available])),

            _ => None,
        }
    }

    fn wrap_state(state: AgentState) -> EntityState {
        EntityState::Agent(state)
    }

    fn wrap_event(event: AgentEvent) -> LifecycleEvent {
        LifecycleEvent::Agent(event)
    }

    fn unwrap_state(state: EntityState) -> Option<AgentState> {
        match state {
            EntityState::Agent(s) => Some(s),
            _ => None,
        }
    }

    fn unwrap_event(event: LifecycleEvent) -> Option<AgentEvent> {
        match event {
            LifecycleEvent::Agent(e) => Some(e),
            _ => None,
        }
    }
}
