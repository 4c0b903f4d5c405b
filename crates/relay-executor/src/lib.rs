//! Command execution backends for relay.
//!
//! Provides executor implementations for running step commands:
//! - Local shell (`sh -c`)

pub mod shell;

pub use relay_core::executor::{
    CommandOutput, CommandSpec, Executor, LogLine, LogSender, LogStream,
};
pub use shell::ShellExecutor;
