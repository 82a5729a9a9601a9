//! ota-engine - command-line driver for the OTA update engine.
//!
//! Each invocation runs one command against the device state described by
//! the configuration file and exits:
//!
//! ```text
//! ota-engine update [--interactive] [--omaha-url URL] [--channel C]
//! ota-engine rollback [--no-powerwash]
//! ota-engine status
//! ota-engine p2p housekeeping | list
//! ota-engine metrics
//! ```

mod commands;
mod error;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use commands::common::GlobalArgs;
use commands::p2p::P2pAction;
use commands::update::UpdateArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "ota-engine")]
#[command(about = "A/B over-the-air update engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/ota-engine/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check for an update and install it into the inactive slot
    Update {
        /// Treat the check as user-initiated (skips scattering)
        #[arg(long)]
        interactive: bool,

        /// Update server URL (honored on unofficial builds only)
        #[arg(long)]
        omaha_url: Option<String>,

        /// Release channel to track
        #[arg(long)]
        channel: Option<String>,
    },

    /// Switch back to the previously installed slot
    Rollback {
        /// Keep user data instead of scheduling a powerwash
        #[arg(long)]
        no_powerwash: bool,
    },

    /// Show the persisted update state
    Status,

    /// Manage the P2P payload cache
    P2p {
        #[command(subcommand)]
        action: P2pAction,
    },

    /// Report daily metrics if they are due
    Metrics,
}

fn main() {
    let cli = Cli::parse();
    let global = GlobalArgs {
        config: cli.config,
        verbose: cli.verbose,
    };

    if let Err(e) = run(&global, cli.command) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(global: &GlobalArgs, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Update {
            interactive,
            omaha_url,
            channel,
        } => commands::update::run(
            global,
            UpdateArgs {
                interactive,
                omaha_url,
                channel,
            },
        ),
        Commands::Rollback { no_powerwash } => commands::rollback::run(global, no_powerwash),
        Commands::Status => commands::status::run(global),
        Commands::P2p { action } => commands::p2p::run(global, action),
        Commands::Metrics => commands::metrics::run(global),
    }
}
