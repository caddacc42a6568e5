//! Append-only audit records and replay.
//!
//! Every accepted transition is stored as a [`TransitionRecord`]. The store numbers records
//! twice: `seq` counts per entity (1, 2, 3, ...) and `position` is global across all entities,
//! so observers can resync from either an entity's history or the whole log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::fsm::{InvalidTransition, Lifecycle, Machine};
use crate::id::{AgentId, ResourceId};
use crate::lifecycle::{AgentState, EntityKind, EntityState, LifecycleEvent};

/// Identity of an entity that carries a lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EntityRef {
    Run { id: ResourceId },
    Step { run: ResourceId, index: usize },
    Agent { id: AgentId },
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Run { .. } => EntityKind::Run,
            EntityRef::Step { .. } => EntityKind::Step,
            EntityRef::Agent { .. } => EntityKind::Agent,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Run { id } => write!(f, "run/{id}"),
            EntityRef::Step { run, index } => write!(f, "run/{run}/step/{index}"),
            EntityRef::Agent { id } => write!(f, "agent/{id}"),
        }
    }
}

/// One accepted state transition. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub entity: EntityRef,
    /// Per-entity sequence, assigned by the store on commit.
    pub seq: u64,
    /// Global log position, assigned by the store on commit.
    pub position: u64,
    /// `None` for the record written when the entity is created.
    pub from: Option<EntityState>,
    pub to: EntityState,
    pub event: LifecycleEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Run involved in the transition. For agent records this is the run being bound or
    /// released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<ResourceId>,
    pub at: DateTime<Utc>,
}

impl TransitionRecord {
    /// Record for a newly created entity.
    pub fn created(entity: EntityRef, state: EntityState, at: DateTime<Utc>) -> Self {
        Self {
            entity,
            seq: 0,
            position: 0,
            from: None,
            to: state,
            event: LifecycleEvent::Created,
            reason: None,
            run_id: None,
            at,
        }
    }

    pub fn transition(
        entity: EntityRef,
        from: EntityState,
        event: LifecycleEvent,
        to: EntityState,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity,
            seq: 0,
            position: 0,
            from: Some(from),
            to,
            event,
            reason: None,
            run_id: None,
            at,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_run(mut self, run_id: ResourceId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("history is empty")]
    Empty,

    #[error("record {seq} belongs to another entity kind")]
    WrongKind { seq: u64 },

    #[error("history does not start with a creation record")]
    MissingCreation,

    #[error("record {seq}: recorded prior state {recorded} but replay reached {replayed}")]
    PriorStateMismatch {
        seq: u64,
        recorded: EntityState,
        replayed: EntityState,
    },

    #[error("record {seq}: recorded target {recorded} but the table gives {replayed}")]
    TargetMismatch {
        seq: u64,
        recorded: EntityState,
        replayed: EntityState,
    },

    #[error("record {seq}: {source}")]
    Illegal {
        seq: u64,
        #[source]
        source: InvalidTransition,
    },
}

/// Fold one entity's records (in `seq` order) through its transition table.
///
/// Returns the final state. Each record is checked against the table, so a history that
/// contains an edge the table does not allow fails instead of producing a state.
pub fn replay<L: Lifecycle>(records: &[TransitionRecord]) -> Result<L::State, ReplayError> {
    let machine = Machine::<L>::new();
    let (first, rest) = records.split_first().ok_or(ReplayError::Empty)?;

    if first.event != LifecycleEvent::Created {
        return Err(ReplayError::MissingCreation);
    }
    let mut state = L::unwrap_state(first.to).ok_or(ReplayError::WrongKind { seq: first.seq })?;

    for record in rest {
        let wrong_kind = ReplayError::WrongKind { seq: record.seq };
        let event = L::unwrap_event(record.event).ok_or(wrong_kind.clone())?;
        let recorded_to = L::unwrap_state(record.to).ok_or(wrong_kind)?;

        if let Some(from) = record.from {
            if from != L::wrap_state(state) {
                return Err(ReplayError::PriorStateMismatch {
                    seq: record.seq,
                    recorded: from,
                    replayed: L::wrap_state(state),
                });
            }
        }

        let transition = machine
            .apply(state, event)
            .map_err(|source| ReplayError::Illegal {
                seq: record.seq,
                source,
            })?;
        if transition.to != recorded_to {
            return Err(ReplayError::TargetMismatch {
                seq: record.seq,
                recorded: record.to,
                replayed: L::wrap_state(transition.to),
            });
        }
        state = transition.to;
    }

    Ok(state)
}

/// An agent bound to a second run while still holding the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("agent {agent} assigned run {second} at position {position} while holding run {first}")]
pub struct DoubleAssignment {
    pub agent: AgentId,
    pub first: ResourceId,
    pub second: ResourceId,
    pub position: u64,
}

/// Walk the global log and check that no agent ever held two runs at once.
///
/// An agent holds a run from the record that binds it (`run_id` set, target ASSIGNED) until it
/// returns to IDLE, FAILED or OFFLINE.
pub fn check_exclusive_assignment<'a>(
    records: impl IntoIterator<Item = &'a TransitionRecord>,
) -> Result<(), DoubleAssignment> {
    let mut ordered: Vec<&TransitionRecord> = records.into_iter().collect();
    ordered.sort_by_key(|r| r.position);

    let mut holding: HashMap<&AgentId, ResourceId> = HashMap::new();
    for record in ordered {
        let EntityRef::Agent { id } = &record.entity else {
            continue;
        };
        match record.to {
            EntityState::Agent(AgentState::Assigned) => {
                let Some(run) = record.run_id else { continue };
                match holding.get(id) {
                    Some(&first) if first != run => {
                        return Err(DoubleAssignment {
                            agent: id.clone(),
                            first,
                            second: run,
                            position: record.position,
                        });
                    }
                    _ => {}
                }
                holding.insert(id, run);
            }
            EntityState::Agent(AgentState::Idle | AgentState::Failed | AgentState::Offline) => {
                holding.remove(id);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{
        AgentEvent, AgentLifecycle, RunEvent, RunLifecycle, RunState, StepLifecycle,
    };

    fn run_records(
        run: ResourceId,
        path: &[(RunState, RunEvent, RunState)],
    ) -> Vec<TransitionRecord> {
        let entity = EntityRef::Run { id: run };
        let now = Utc::now();
        let mut records = vec![TransitionRecord::created(
            entity.clone(),
            EntityState::Run(RunState::Pending),
            now,
        )];
        for (i, &(from, event, to)) in path.iter().enumerate() {
            let mut r = TransitionRecord::transition(
                entity.clone(),
                EntityState::Run(from),
                LifecycleEvent::Run(event),
                EntityState::Run(to),
                now,
            );
            r.seq = i as u64 + 2;
            records.push(r);
        }
        records
    }

    #[test]
    fn test_replay_reproduces_final_state() {
        let records = run_records(
            ResourceId::new(),
            &[
                (RunState::Pending, RunEvent::Assign, RunState::Assigned),
                (RunState::Assigned, RunEvent::Start, RunState::Running),
                (RunState::Running, RunEvent::Fail, RunState::Failed),
            ],
        );
        assert_eq!(replay::<RunLifecycle>(&records), Ok(RunState::Failed));
    }

    #[test]
    fn test_replay_rejects_tampered_target() {
        let records = run_records(
            ResourceId::new(),
            &[(RunState::Pending, RunEvent::Assign, RunState::Running)],
        );
        assert!(matches!(
            replay::<RunLifecycle>(&records),
            Err(ReplayError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_replay_rejects_wrong_kind() {
        let records = run_records(ResourceId::new(), &[]);
        assert!(matches!(
            replay::<StepLifecycle>(&records),
            Err(ReplayError::WrongKind { .. })
        ));
    }

    fn agent_record(
        agent: &str,
        event: AgentEvent,
        to: AgentState,
        run: Option<ResourceId>,
        position: u64,
    ) -> TransitionRecord {
        let mut r = TransitionRecord::transition(
            EntityRef::Agent { id: agent.into() },
            EntityState::Agent(AgentState::Idle),
            LifecycleEvent::Agent(event),
            EntityState::Agent(to),
            Utc::now(),
        );
        r.run_id = run;
        r.position = position;
        r
    }

    #[test]
    fn test_exclusive_assignment_accepts_sequential_runs() {
        let (a, b) = (ResourceId::new(), ResourceId::new());
        let log = vec![
            agent_record("x", AgentEvent::Assign, AgentState::Assigned, Some(a), 1),
            agent_record("x", AgentEvent::ReportAck, AgentState::Idle, Some(a), 2),
            agent_record("x", AgentEvent::Assign, AgentState::Assigned, Some(b), 3),
        ];
        assert!(check_exclusive_assignment(&log).is_ok());
        assert!(replay::<AgentLifecycle>(&[]).is_err());
    }

    #[test]
    fn test_exclusive_assignment_detects_overlap() {
        let (a, b) = (ResourceId::new(), ResourceId::new());
        let log = vec![
            agent_record("x", AgentEvent::Assign, AgentState::Assigned, Some(b), 3),
            agent_record("x", AgentEvent::Assign, AgentState::Assigned, Some(a), 1),
        ];
        let err = check_exclusive_assignment(&log).unwrap_err();
        assert_eq!(err.first, a);
        assert_eq!(err.second, b);
    }
}
