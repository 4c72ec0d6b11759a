//! Shared types and trace format for Retrace
//!
//! This crate contains the call model, handle/pointer value types, the trace
//! container and the content store used by both the recorder and the player.

pub mod protocol;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use protocol::wire::{RecordOrigin, TraceHeader, TraceReader, TraceRecord, TraceWriter};
pub use store::{ContentRef, ContentStore};
pub use types::{calls::*, handles::*};
