//! keel CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// keel - control planes on Kubernetes runtimes
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a control-plane instance
    Up(commands::up::UpArgs),
    /// Delete a control-plane instance and its infrastructure
    Down(commands::down::DownArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Up(args) => commands::up::run(args).await,
            Commands::Down(args) => commands::down::run(args).await,
        }
    }
}
