//! # Configuration Modules
//!
//! Settings for the agent, resolved from defaults, a JSON file, the
//! environment (`.env` included) and command-line flags.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// CLI/env/file layered configuration for the edge agent.
pub mod agent_config;

pub use agent_config::{load_config, load_config_from, AgentArgs, AgentConfig, BackendKind, ConfigError};
