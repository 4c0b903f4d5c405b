//! KDL configuration parsing for relay.
//!
//! This crate handles parsing of:
//! - Workflow definitions (relay.kdl)
//! - Engine configuration
//! - Variable interpolation

pub mod engine;
pub mod error;
mod kdl_ext;
pub mod variables;
pub mod workflow;

pub use engine::{EngineConfig, load_engine_config, parse_engine_config};
pub use error::{ConfigError, ConfigResult};
pub use kdl_ext::parse_duration;
pub use variables::{
    CacheContext, EventContext, JobContext, RunContext, StepContext, VariableContext,
    VariableContextBuilder,
};
pub use workflow::{load_workflow, parse_workflow};
