//! Core domain types and contracts for the Open-CICD control plane.
//!
//! This crate contains:
//! - Resource identifiers, the error taxonomy and a clock abstraction
//! - The generic state-machine engine and the run, step and agent lifecycle tables
//! - Job, run and agent types
//! - Audit records and replay
//! - Contracts for assignment delivery and live update publishing
//! - Agent report types

pub mod agent;
pub mod audit;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod fsm;
pub mod id;
pub mod job;
pub mod lifecycle;
pub mod report;
pub mod run;
pub mod update;

pub use error::{Error, ErrorKind, Result};
pub use id::{AgentId, ResourceId};
