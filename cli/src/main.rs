//! CLI for Retrace
//!
//! Works on recorded traces:
//! - inspect: Print the header and call counts of a trace
//! - replay: Dry-run a trace against the simulated runtime
//! - subcapture: Cut a trace at a call and write a self-contained trace

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "retrace")]
#[command(about = "Retrace - compute API capture and replay", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a trace contains
    Inspect(commands::inspect::InspectArgs),

    /// Replay a trace against the simulated runtime
    Replay(commands::replay::ReplayArgs),

    /// Write a trace that starts at a given call
    Subcapture(commands::subcapture::SubcaptureArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Inspect(args) => commands::inspect::run(args),
        Commands::Replay(args) => commands::replay::run(args),
        Commands::Subcapture(args) => commands::subcapture::run(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
