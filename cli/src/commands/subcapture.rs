//! Subcapture command implementation

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use retrace_engine::{Player, Recorder, SimRuntime, SubcaptureRange};
use retrace_shared::store::DirStore;
use retrace_shared::utils::format_bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct SubcaptureArgs {
    /// Trace file to cut
    pub trace: PathBuf,

    /// Index of the first call kept, counting every call issued while
    /// replaying the input
    #[arg(short, long)]
    pub from: u64,

    /// Output trace file
    #[arg(short, long)]
    pub out: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub fn run(args: SubcaptureArgs) -> Result<()> {
    if args.out == args.trace {
        anyhow::bail!("Output trace must differ from the input trace");
    }
    let mut config = super::load_config(args.config.as_deref())?;
    config.subcapture = Some(SubcaptureRange { start: args.from });

    let reader = super::open_trace(&args.trace)?;
    let input = DirStore::beside(&args.trace).context("Failed to open input blob directory")?;
    let file = File::create(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;
    let blobs = DirStore::beside(&args.out).context("Failed to open output blob directory")?;
    let description = format!(
        "{} from call {}",
        reader.header().description,
        args.from
    );

    let recorder = Recorder::new(
        SimRuntime::default(),
        BufWriter::new(file),
        blobs,
        config.clone(),
        description,
    )?;
    let mut player = Player::new(recorder, &config);
    for record in reader {
        let record = record.context("Failed to read input record")?;
        player
            .replay_record(&record, &input)
            .with_context(|| format!("Replay failed at record {}", record.index))?;
    }
    info!("input replayed: {} records", player.stats().total());

    let (_, mut writer, _, stats) = player.into_runtime().finish()?;
    writer.flush().context("Failed to flush output trace")?;

    output::section("Subcapture");
    output::field("calls seen", stats.application_calls);
    output::field("reconstructed", stats.reconstructed);
    output::field("memory updates", stats.updates);
    output::field("bytes persisted", format_bytes(stats.bytes_persisted));
    output::field("records written", stats.records_written);
    println!();
    output::success(&format!("wrote {}", args.out.display()));
    Ok(())
}
