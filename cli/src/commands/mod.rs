pub mod inspect;
pub mod replay;
pub mod subcapture;

use anyhow::{Context, Result};
use retrace_engine::EngineConfig;
use retrace_shared::TraceReader;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Open a trace file for sequential reading
pub fn open_trace(path: &Path) -> Result<TraceReader<BufReader<File>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open trace {}", path.display()))?;
    TraceReader::open(BufReader::new(file))
        .with_context(|| format!("Failed to read trace header of {}", path.display()))
}

/// Engine configuration from `path`, or the environment defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}
