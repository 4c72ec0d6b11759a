//! Retrace Virtualization Engine
//!
//! Makes a recorded stream of compute API calls replayable against a runtime
//! that hands out different handles and addresses. The engine tracks every
//! live object and allocation, rewrites recorded handles and pointers into the
//! live address space, persists the memory kernels may read, and can
//! reconstruct the full object state at any point of a stream so a trace can
//! start mid-run.

pub mod capture;
pub mod config;
pub mod error;
pub mod kernel_args;
pub mod pointers;
pub mod regions;
pub mod registry;
pub mod replay;
pub mod runtime;
pub mod sim;
pub mod state;
pub mod subcapture;
pub mod tracker;

pub use capture::{CaptureStats, Recorder};
pub use config::{EngineConfig, SubcaptureRange};
pub use error::{EngineError, Result};
pub use replay::{Player, ReplayStats};
pub use runtime::Runtime;
pub use sim::{SimConfig, SimRuntime};
pub use state::StateStore;
pub use subcapture::{reconstruct_from, teardown};
