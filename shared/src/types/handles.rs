//! Handle and pointer value types
//!
//! Handles are opaque per-kind identifiers issued by the compute runtime. The
//! values recorded during capture never match the ones issued during replay,
//! so nothing in here compares handles across kinds or across runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle value as issued by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Closed set of handle-addressed object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Platform,
    Device,
    Context,
    Queue,
    Program,
    Kernel,
    Mem,
    Sampler,
    Event,
}

impl HandleKind {
    pub const ALL: [HandleKind; 9] = [
        HandleKind::Platform,
        HandleKind::Device,
        HandleKind::Context,
        HandleKind::Queue,
        HandleKind::Program,
        HandleKind::Kernel,
        HandleKind::Mem,
        HandleKind::Sampler,
        HandleKind::Event,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Platform => "platform",
            HandleKind::Device => "device",
            HandleKind::Context => "context",
            HandleKind::Queue => "queue",
            HandleKind::Program => "program",
            HandleKind::Kernel => "kernel",
            HandleKind::Mem => "mem",
            HandleKind::Sampler => "sampler",
            HandleKind::Event => "event",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Virtual address inside an application- or runtime-managed allocation
pub type Address = u64;

/// Allocator family a pointer-addressed allocation belongs to.
///
/// Allocations of the same family never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AllocFamily {
    /// Shared virtual memory
    Svm,
    /// Unified shared memory
    Usm,
}

/// Kind of a pointer-addressed allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocKind {
    UsmDevice,
    UsmHost,
    UsmShared,
    SvmFineGrain,
    SvmCoarseGrain,
}

impl AllocKind {
    pub fn family(self) -> AllocFamily {
        match self {
            AllocKind::UsmDevice | AllocKind::UsmHost | AllocKind::UsmShared => AllocFamily::Usm,
            AllocKind::SvmFineGrain | AllocKind::SvmCoarseGrain => AllocFamily::Svm,
        }
    }

    /// Device-only memory is not visible to the host and cannot be page protected.
    pub fn is_device_only(self) -> bool {
        matches!(self, AllocKind::UsmDevice)
    }

    /// Host-resident memory the application writes directly, where page
    /// protection catches host writes
    pub fn is_host_resident(self) -> bool {
        matches!(
            self,
            AllocKind::UsmHost | AllocKind::UsmShared | AllocKind::SvmCoarseGrain
        )
    }
}

/// Identifier of the application thread that issued a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle(0x10).is_null());
        assert_eq!(Handle(0x10).to_string(), "0x10");
    }

    #[test]
    fn test_alloc_kind_family() {
        assert_eq!(AllocKind::UsmDevice.family(), AllocFamily::Usm);
        assert_eq!(AllocKind::SvmCoarseGrain.family(), AllocFamily::Svm);
        assert!(AllocKind::UsmDevice.is_device_only());
        assert!(!AllocKind::UsmShared.is_device_only());
        assert!(AllocKind::SvmCoarseGrain.is_host_resident());
        assert!(!AllocKind::SvmFineGrain.is_host_resident());
        assert!(!AllocKind::UsmDevice.is_host_resident());
    }
}
