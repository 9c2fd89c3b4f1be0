#![warn(clippy::all, clippy::pedantic)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod coordination;
pub mod daemon;

pub use config::Config;
pub use coordination::{AgentMessage, BusError, DeliveryMode, MessageBus};

/// Config subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}
