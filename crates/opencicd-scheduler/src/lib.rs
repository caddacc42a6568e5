//! Scheduling and event ingestion for Open-CICD.
//!
//! Owns everything that moves runs and agents through their lifecycles: the transition
//! applier, the pending queue and push-assignment scheduler, the agent registry with its
//! heartbeat sweep, agent report ingestion with per-step log ordering, and live update
//! fan-out. [`ControlPlane`] ties these together for transports.

pub mod apply;
pub mod control;
pub mod fanout;
pub mod ingest;
pub mod locks;
pub mod logs;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use apply::{Applier, Command, Committed, UnitOfWork};
pub use control::ControlPlane;
pub use fanout::Broadcaster;
pub use logs::{LogSequencer, Release, Sequenced};
pub use queue::{PendingQueue, QueuedRun};
pub use registry::AgentRegistry;
pub use scheduler::Scheduler;
