//! CLI module for arkfleet
//!
//! Subcommands:
//! - `arkfleet serve` - Run the management API
//! - `arkfleet plan` - Show the servers and ports a cluster request produces
//! - `arkfleet render` - Print the launch command and config files of planned servers
//! - `arkfleet validate` - Check a cluster request file

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "arkfleet")]
#[command(about = "Provision and orchestrate ARK: Survival Ascended server clusters")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.arkfleet/config.yaml)
    #[arg(long, global = true, env = "ARKFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the management API
    Serve(ServeArgs),

    /// Plan a cluster request without storing anything
    Plan(PlanArgs),

    /// Render the runtime artifacts of a cluster request
    Render(RenderArgs),

    /// Validate a cluster request file
    Validate(ValidateArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Override the bind address from the config file
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Override the API port from the config file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the data directory from the config file
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<String>,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Cluster request (JSON or JSONC)
    pub file: PathBuf,

    /// Print the planned cluster as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the render command
#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Cluster request (JSON or JSONC)
    pub file: PathBuf,

    /// Only render this server
    #[arg(long)]
    pub server: Option<String>,

    /// Print the artifacts as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Cluster request (JSON or JSONC)
    pub file: PathBuf,
}
