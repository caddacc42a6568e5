//! Step lifecycle.

use serde::{Deserialize, Serialize};

use super::{EntityKind, EntityState, LifecycleEvent};
use crate::fsm::Lifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
}

named_enum!(StepState {
    Queued => "queued",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Success | StepState::Failed | StepState::Skipped
        )
    }

    /// Terminal without failing: the next step may start.
    pub fn lets_successor_start(&self) -> bool {
        matches!(self, StepState::Success | StepState::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    Start,
    Succeed,
    Fail,
    Skip,
}

named_enum!(StepEvent {
    Start => "start",
    Succeed => "succeed",
    Fail => "fail",
    Skip => "skip",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    MarkStarted,
    MarkFinished,
    /// Move the run forward: evaluate the next predicate or finish the run.
    Advance,
    /// Fail the parent run.
    PropagateFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepLifecycle;

impl Lifecycle for StepLifecycle {
    type State = StepState;
    type Event = StepEvent;
    type Action = StepAction;

    const KIND: EntityKind = EntityKind::Step;

    const STATES: &'static [StepState] = &[
        StepState::Queued,
        StepState::Running,
        StepState::Success,
        StepState::Failed,
        StepState::Skipped,
    ];

    const EVENTS: &'static [StepEvent] = &[
        StepEvent::Start,
        StepEvent::Succeed,
        StepEvent::Fail,
        StepEvent::Skip,
    ];

    fn edge(state: StepState, event: StepEvent) -> Option<(StepState, &'static [StepAction])> {
        use StepAction as A;
        use StepEvent as E;
        use StepState as S;

        match (state, event) {
            (S::Queued, E::Start) => Some((S::Running, &[A::MarkStarted])),
            (S::Running, E::Succeed) => Some((S::Success, &[A::MarkFinished, A::Advance])),
            (S::Running, E::Fail) => Some((S::Failed, &[A::MarkFinished, A::PropagateFailure])),
            (S::Queued, E::Skip) => Some((S::Skipped, &[A::Advance])),
            _ => None,
        }
    }

    fn wrap_state(state: StepState) -> EntityState {
        EntityState::Step(state)
    }

    fn wrap_event(event: StepEvent) -> LifecycleEvent {
        LifecycleEvent::Step(event)
    }

    fn unwrap_state(state: EntityState) -> Option<StepState> {
        match state {
            EntityState::Step(s) => Some(s),
            _ => None,
        }
    }

    fn unwrap_event(event: LifecycleEvent) -> Option<StepEvent> {
        match event {
            LifecycleEvent::Step(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Machine;

    const EDGES: &[(StepState, StepEvent, StepState)] = &[
        (StepState::Queued, StepEvent::Start, StepState::Running),
        (StepState::Running, StepEvent::Succeed, StepState::Success),
        (StepState::Running, StepEvent::Fail, StepState::Failed),
        (StepState::Queued, StepEvent::Skip, StepState::Skipped),
    ];

    #[test]
    fn test_transition_table_is_exact() {
        let machine = Machine::<StepLifecycle>::new();
        for &state in StepLifecycle::STATES {
            for &event in StepLifecycle::EVENTS {
                let expected = EDGES
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, to)| *to);
                let actual = machine.apply(state, event).ok().map(|t| t.to);
                assert_eq!(actual, expected, "({state}, {event})");
            }
        }
    }

    #[test]
    fn test_duplicate_start_after_success_is_rejected() {
        let machine = Machine::<StepLifecycle>::new();
        assert!(machine.apply(StepState::Success, StepEvent::Start).is_err());
    }

    #[test]
    fn test_failure_propagates() {
        let machine = Machine::<StepLifecycle>::new();
        let t = machine.apply(StepState::Running, StepEvent::Fail).unwrap();
        assert!(t.actions.contains(&StepAction::PropagateFailure));
    }
}
