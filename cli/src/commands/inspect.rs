//! Inspect command implementation

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use retrace_shared::{RecordOrigin, TraceHeader};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Trace file to inspect
    pub trace: PathBuf,

    /// Print every record
    #[arg(short, long)]
    pub list: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Default, Serialize)]
struct TraceSummary {
    header: Option<TraceHeader>,
    records: u64,
    threads: u64,
    origins: BTreeMap<String, u64>,
    calls: BTreeMap<String, u64>,
}

pub fn run(args: InspectArgs) -> Result<()> {
    let reader = super::open_trace(&args.trace)?;
    let mut summary = TraceSummary {
        header: Some(reader.header().clone()),
        ..TraceSummary::default()
    };
    let mut threads = std::collections::BTreeSet::new();

    for record in reader {
        let record = record.with_context(|| {
            format!(
                "Failed to read record {} of {}",
                summary.records,
                args.trace.display()
            )
        })?;
        if args.list && !args.json {
            println!(
                "{:>8} [{}] {:<14} {:?}",
                record.index,
                record.thread,
                origin_name(record.origin),
                record.call
            );
        }
        summary.records += 1;
        threads.insert(record.thread);
        *summary
            .origins
            .entry(origin_name(record.origin).to_string())
            .or_default() += 1;
        *summary
            .calls
            .entry(record.call.name().to_string())
            .or_default() += 1;
    }
    summary.threads = threads.len() as u64;

    if args.json {
        return output::json(&summary);
    }
    print_summary(&summary);
    Ok(())
}

fn origin_name(origin: RecordOrigin) -> &'static str {
    match origin {
        RecordOrigin::Application => "application",
        RecordOrigin::Injected => "injected",
        RecordOrigin::Reconstruction => "reconstruction",
        RecordOrigin::Teardown => "teardown",
    }
}

fn print_summary(summary: &TraceSummary) {
    if let Some(header) = &summary.header {
        output::section("Trace");
        output::field("description", &header.description);
        output::field("recorded at", &header.recorded_at);
        output::field("format version", header.version);
        match header.subcapture_start {
            Some(start) => output::field("subcapture from", start),
            None => output::field("subcapture from", "-"),
        }
    }

    output::section("Records");
    output::field("total", summary.records);
    output::field("threads", summary.threads);
    for (origin, count) in &summary.origins {
        output::field(origin, count);
    }

    if !summary.calls.is_empty() {
        output::section("Calls");
        output::call_table(&summary.calls);
    }
}
