//! Replay command implementation

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use retrace_engine::{Player, SimRuntime};
use retrace_shared::store::DirStore;
use retrace_shared::utils::time::{elapsed_ms, system_time_nanos};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Trace file to replay
    pub trace: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the replay statistics as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: ReplayArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let reader = super::open_trace(&args.trace)?;
    let content = DirStore::beside(&args.trace).context("Failed to open blob directory")?;

    let started = system_time_nanos();
    let mut player = Player::new(SimRuntime::default(), &config);
    let stats = player
        .run(reader, &content)
        .with_context(|| format!("Replay of {} failed", args.trace.display()))?;

    let elapsed = elapsed_ms(started);

    if args.json {
        return output::json(&stats);
    }

    output::section("Replay");
    output::field("application calls", stats.application);
    output::field("injected records", stats.injected);
    output::field("reconstruction", stats.reconstruction);
    output::field("teardown", stats.teardown);
    output::field("live objects left", player.runtime().live_objects());
    output::field("allocations left", player.runtime().allocation_count());
    output::field("elapsed", format!("{} ms", elapsed));
    if !stats.calls.is_empty() {
        output::section("Calls issued");
        output::call_table(&stats.calls);
    }
    println!();
    if stats.warnings > 0 {
        output::warning(&format!(
            "replay finished with {} warning(s)",
            stats.warnings
        ));
    } else {
        output::success("replay finished");
    }
    Ok(())
}
