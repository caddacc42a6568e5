//! Lifecycle tables for runs, steps and agents.
//!
//! Each entity kind gets a state enum, an event enum, an action enum and a [`Lifecycle`]
//! marker type wiring them into the generic [`Machine`](crate::fsm::Machine). Wildcard edges
//! ("any state → OFFLINE") are spelled out per concrete state so the tables stay exhaustive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generates `as_str`, `Display` and `FromStr` from a variant → name list.
macro_rules! named_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

mod agent;
mod run;
mod step;

pub use agent::{AgentAction, AgentEvent, AgentLifecycle, AgentState};
pub use run::{RunAction, RunEvent, RunLifecycle, RunState};
pub use step::{StepAction, StepEvent, StepLifecycle, StepState};

/// The kinds of entity that carry a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    Step,
    Agent,
}

named_enum!(EntityKind {
    Run => "run",
    Step => "step",
    Agent => "agent",
});

/// A state of any entity kind, as recorded in audit records and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Run(RunState),
    Step(StepState),
    Agent(AgentState),
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::Run(_) => EntityKind::Run,
            EntityState::Step(_) => EntityKind::Step,
            EntityState::Agent(_) => EntityKind::Agent,
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Run(s) => s.fmt(f),
            EntityState::Step(s) => s.fmt(f),
            EntityState::Agent(s) => s.fmt(f),
        }
    }
}

/// An event of any entity kind. `Created` marks the record written when an entity first
/// appears; it is not an edge of any table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created,
    Run(RunEvent),
    Step(StepEvent),
    Agent(AgentEvent),
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Created => f.write_str("created"),
            LifecycleEvent::Run(e) => e.fmt(f),
            LifecycleEvent::Step(e) => e.fmt(f),
            LifecycleEvent::Agent(e) => e.fmt(f),
        }
    }
}
