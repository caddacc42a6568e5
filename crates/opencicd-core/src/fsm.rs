//! Generic finite-state-machine engine.
//!
//! A [`Lifecycle`] declares a closed transition table: every legal `(state, event)` pair maps
//! to a target state plus the actions the caller must run once the transition is accepted.
//! Any pair missing from the table is illegal. The [`Machine`] holds no entity data and does
//! no locking, so one definition serves every live entity of that kind.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{EntityKind, EntityState, LifecycleEvent};

/// Transition table for one entity kind.
pub trait Lifecycle: fmt::Debug + Copy + 'static {
    type State: Copy + Eq + fmt::Debug + fmt::Display + 'static;
    type Event: Copy + Eq + fmt::Debug + fmt::Display + 'static;
    type Action: Copy + Eq + fmt::Debug + 'static;

    const KIND: EntityKind;

    /// Every state, in declaration order.
    const STATES: &'static [Self::State];

    /// Every event, in declaration order.
    const EVENTS: &'static [Self::Event];

    /// Look up the edge for `(state, event)`.
    fn edge(state: Self::State, event: Self::Event)
    -> Option<(Self::State, &'static [Self::Action])>;

    fn wrap_state(state: Self::State) -> EntityState;

    fn wrap_event(event: Self::Event) -> LifecycleEvent;

    fn unwrap_state(state: EntityState) -> Option<Self::State>;

    fn unwrap_event(event: LifecycleEvent) -> Option<Self::Event>;
}

/// An accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<L: Lifecycle> {
    pub from: L::State,
    pub event: L::Event,
    pub to: L::State,
    /// Post-transition hooks, in the order they must run.
    pub actions: &'static [L::Action],
}

impl<L: Lifecycle> Transition<L> {
    /// True for edges that do not change state (heartbeat self-loops).
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// Rejection of an event that has no edge from the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("invalid {entity} transition: event {event} is not allowed in state {state}")]
pub struct InvalidTransition {
    pub entity: EntityKind,
    pub state: EntityState,
    pub event: LifecycleEvent,
}

/// Stateless engine over a lifecycle table.
#[derive(Debug, Clone, Copy)]
pub struct Machine<L>(PhantomData<fn() -> L>);

impl<L: Lifecycle> Machine<L> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }

    /// Validate and compute a transition. Never mutates anything.
    pub fn apply(&self, state: L::State, event: L::Event) -> Result<Transition<L>, InvalidTransition> {
        match L::edge(state, event) {
            Some((to, actions)) => Ok(Transition {
                from: state,
                event,
                to,
                actions,
            }),
            None => Err(InvalidTransition {
                entity: L::KIND,
                state: L::wrap_state(state),
                event: L::wrap_event(event),
            }),
        }
    }

    pub fn is_legal(&self, state: L::State, event: L::Event) -> bool {
        L::edge(state, event).is_some()
    }

    /// All declared edges as `(from, event, to)`.
    pub fn edges(&self) -> impl Iterator<Item = (L::State, L::Event, L::State)> {
        L::STATES.iter().flat_map(|&state| {
            L::EVENTS
                .iter()
                .filter_map(move |&event| L::edge(state, event).map(|(to, _)| (state, event, to)))
        })
    }

    /// Fold a sequence of events over an initial state, stopping at the first illegal one.
    pub fn replay(
        &self,
        initial: L::State,
        events: impl IntoIterator<Item = L::Event>,
    ) -> Result<L::State, InvalidTransition> {
        events
            .into_iter()
            .try_fold(initial, |state, event| self.apply(state, event).map(|t| t.to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{RunEvent, RunLifecycle, RunState};

    #[test]
    fn test_apply_rejects_without_mutation() {
        let machine = Machine::<RunLifecycle>::new();
        let state = RunState::Completed;
        let err = machine.apply(state, RunEvent::Start).unwrap_err();
        assert_eq!(err.entity, EntityKind::Run);
        assert_eq!(err.state, EntityState::Run(RunState::Completed));
        assert_eq!(err.event, LifecycleEvent::Run(RunEvent::Start));
        assert_eq!(state, RunState::Completed);
    }

    #[test]
    fn test_replay_folds_accepted_events() {
        let machine = Machine::<RunLifecycle>::new();
        let end = machine
            .replay(
                RunState::Pending,
                [
                    RunEvent::Assign,
                    RunEvent::Start,
                    RunEvent::AllStepsDone,
                    RunEvent::Finalize,
                ],
            )
            .unwrap();
        assert_eq!(end, RunState::Completed);
    }

    #[test]
    fn test_replay_stops_at_illegal_event() {
        let machine = Machine::<RunLifecycle>::new();
        let result = machine.replay(RunState::Pending, [RunEvent::Start]);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_message_names_state_and_event() {
        let machine = Machine::<RunLifecycle>::new();
        let err = machine.apply(RunState::Failed, RunEvent::Finalize).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid run transition: event finalize is not allowed in state failed"
        );
    }
}
