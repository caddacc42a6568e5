//! Storage layer for Open-CICD.
//!
//! Provides the transactional `Store` trait and an in-memory implementation.

pub mod error;
pub mod memory;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use store::{RunFilter, Store, Transaction, Write};
