//! CLI module for the driftless engine.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting deployment units.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
