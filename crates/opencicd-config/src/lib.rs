//! KDL configuration parsing for the Open-CICD control plane.
//!
//! This crate handles parsing of:
//! - Job definitions
//! - System configuration
//! - Variable interpolation and step conditions

pub mod condition;
pub mod error;
pub mod job;
mod nodes;
pub mod system;
pub mod variables;

pub use condition::Condition;
pub use error::{ConfigError, ConfigResult};
pub use job::{branch_matches, parse_job, validate_job};
pub use system::{OnAgentLost, SystemConfig, load_system_config, parse_system_config};
pub use variables::{VariableContext, VariableContextBuilder};
