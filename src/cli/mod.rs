//! Command-line interface for fleetsched.
//!
//! Provides the `run`, `inspect`, `release-leadership` and `check-config`
//! commands.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, AgentManifest, AgentSpec, Cli, Commands, DemoAgent,
};
