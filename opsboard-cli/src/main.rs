//! opsboard: operational board sync toolkit.
//!
//! # Usage
//!
//! ```text
//! opsboard replay <scenario.yaml> [--json]
//! opsboard sort <orders.yaml> [--json]
//! opsboard config [--home <dir>]
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigArgs, replay::ReplayArgs, sort::SortArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "opsboard",
    version,
    about = "Replay and inspect operational board synchronization",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted multi-client scenario against an in-memory backend.
    Replay(ReplayArgs),

    /// Print the display order of a list of orders.
    Sort(SortArgs),

    /// Show the effective sync configuration.
    Config(ConfigArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Replay(args) => args.run(),
        Commands::Sort(args) => args.run(),
        Commands::Config(args) => args.run(),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
