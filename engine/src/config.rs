//! Engine configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rewrite logging off
pub const VERBOSITY_OFF: u8 = 0;
/// Log every handle rewrite
pub const VERBOSITY_HANDLES: u8 = 1;
/// Log handle and pointer rewrites
pub const VERBOSITY_POINTERS: u8 = 2;

/// Portion of the stream kept when recording a subcapture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcaptureRange {
    /// Index of the first application call written to the trace
    pub start: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Granularity of dirty tracking in bytes
    pub page_size: usize,

    /// Rewrite logging level (see `VERBOSITY_*`)
    pub verbosity: u8,

    /// Read device-only allocations back around launches to detect changes
    pub track_device_memory: bool,

    /// Fine-grained SVM cannot be page protected; when set it is always
    /// persisted in full before a launch that may touch it
    pub fine_grain_svm_always_dirty: bool,

    /// Record only from this point on, reconstructing earlier state
    pub subcapture: Option<SubcaptureRange>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: std::env::var("RETRACE_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4096),
            verbosity: std::env::var("RETRACE_VERBOSITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(VERBOSITY_OFF),
            track_device_memory: std::env::var("RETRACE_TRACK_DEVICE_MEMORY")
                .map(|s| s != "0" && !s.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            fine_grain_svm_always_dirty: true,
            subcapture: None,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file layered over the defaults, then `RETRACE_*` overrides
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("RETRACE").try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = settings
            .try_deserialize()
            .context("Invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn logs_handles(&self) -> bool {
        self.verbosity >= VERBOSITY_HANDLES
    }

    pub fn logs_pointers(&self) -> bool {
        self.verbosity >= VERBOSITY_POINTERS
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            anyhow::bail!("Page size must be a power of two, got {}", self.page_size);
        }

        if self.page_size < 256 {
            anyhow::bail!("Page size too small (min 256 bytes)");
        }

        if self.verbosity > VERBOSITY_POINTERS {
            anyhow::bail!("Verbosity must be between 0 and {}", VERBOSITY_POINTERS);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base() -> EngineConfig {
        EngineConfig {
            page_size: 4096,
            verbosity: 0,
            track_device_memory: true,
            fine_grain_svm_always_dirty: true,
            subcapture: None,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(base().validate().is_ok());

        let odd_page = EngineConfig {
            page_size: 3000,
            ..base()
        };
        assert!(odd_page.validate().is_err());

        let tiny_page = EngineConfig {
            page_size: 128,
            ..base()
        };
        assert!(tiny_page.validate().is_err());

        let loud = EngineConfig {
            verbosity: 3,
            ..base()
        };
        assert!(loud.validate().is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        let config = EngineConfig {
            verbosity: VERBOSITY_HANDLES,
            ..base()
        };
        assert!(config.logs_handles());
        assert!(!config.logs_pointers());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "page_size = 65536").unwrap();
        writeln!(file, "verbosity = 2").unwrap();
        writeln!(file, "[subcapture]").unwrap();
        writeln!(file, "start = 42").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.page_size, 65536);
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.subcapture, Some(SubcaptureRange { start: 42 }));
    }

    #[test]
    fn test_toml_serialization() {
        let text = toml::to_string(&base()).unwrap();
        let back: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, base());
    }
}
