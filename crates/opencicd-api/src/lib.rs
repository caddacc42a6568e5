//! HTTP and WebSocket transport for the Open-CICD control plane.
//!
//! Provides the REST API agents and users talk to, live run updates over WebSocket, and the
//! mailbox through which assignments reach polling agents.

pub mod delivery;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use delivery::MailboxDelivery;
pub use state::AppState;
