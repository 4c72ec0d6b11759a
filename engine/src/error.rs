use retrace_shared::protocol::wire::WireError;
use retrace_shared::store::StoreError;
use retrace_shared::{Address, Handle, HandleKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Replay referenced a handle that was never bound
    #[error("unmapped {kind} handle {handle}")]
    UnmappedHandle { kind: HandleKind, handle: Handle },

    /// State lookup on an object that was never created or is already gone
    #[error("unknown {kind} object {handle}")]
    UnknownObject { kind: HandleKind, handle: Handle },

    /// Pointer does not resolve to any tracked allocation
    #[error("pointer {ptr:#x} does not belong to a tracked allocation")]
    UntrackedPointer { ptr: Address },

    /// Registering an allocation that overlaps a live one of the same family
    #[error("allocation at {base:#x} (+{size}) overlaps a tracked allocation")]
    OverlappingAllocation { base: Address, size: u64 },

    /// The replay runtime could not satisfy an allocation
    #[error("allocation failure in {call}: {reason}")]
    AllocationFailure { call: &'static str, reason: String },

    /// Subcapture could not recreate an object
    #[error("cannot reconstruct {object}: {reason}")]
    ReconstructionFailure { object: String, reason: String },

    /// The wrapped runtime rejected a call
    #[error("runtime error in {call}: {reason}")]
    Runtime { call: &'static str, reason: String },

    #[error("trace format error: {0}")]
    Wire(#[from] WireError),

    #[error("content store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the session must stop. Untracked pointers are tolerated:
    /// the raw value is passed through and a warning logged.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::UntrackedPointer { .. })
    }

    pub fn unknown(kind: HandleKind, handle: Handle) -> Self {
        EngineError::UnknownObject { kind, handle }
    }
}

// A convenient alias
pub type Result<T> = std::result::Result<T, EngineError>;
