//! Per-kind object records

use retrace_shared::{
    Address, AllocKind, ContentRef, Handle, HandleKind, ImageDesc, ImageFormat, MapFlags,
    MemFlags, SvmFlags,
};

/// How a program was created
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramSource {
    Source(Vec<ContentRef>),
    Binary {
        devices: Vec<Handle>,
        binaries: Vec<ContentRef>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub devices: Vec<Handle>,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramState {
    pub context: Handle,
    pub source: ProgramSource,
    pub build: Option<BuildInfo>,
}

/// Buffer, sub-buffer or image
#[derive(Debug, Clone, PartialEq)]
pub enum MemShape {
    Buffer,
    SubBuffer { parent: Handle, origin: u64 },
    Image { format: ImageFormat, desc: ImageDesc },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemState {
    pub context: Handle,
    pub flags: MemFlags,
    pub size: u64,
    pub shape: MemShape,
    /// Initial contents passed at creation, if any
    pub initial_data: Option<ContentRef>,
}

impl MemState {
    /// Object this memory object privately retains
    pub fn backing(&self) -> Option<Handle> {
        match &self.shape {
            MemShape::Buffer => None,
            MemShape::SubBuffer { parent, .. } => Some(*parent),
            MemShape::Image { desc, .. } => (!desc.buffer.is_null()).then_some(desc.buffer),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.shape, MemShape::Image { .. })
    }
}

/// Kind-specific fields of a handle-addressed object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectInfo {
    Platform,
    Device {
        platform: Handle,
        device_type: u64,
    },
    Context {
        devices: Vec<Handle>,
        properties: Vec<u64>,
    },
    Queue {
        context: Handle,
        device: Handle,
        properties: u64,
    },
    Mem(MemState),
    Sampler {
        context: Handle,
        normalized_coords: bool,
        addressing_mode: u32,
        filter_mode: u32,
    },
    Program(ProgramState),
    Kernel {
        program: Handle,
        name: String,
    },
    Event {
        context: Handle,
        /// Created by the application as a user event
        user: bool,
        /// Last status set on a user event
        status: Option<i32>,
    },
}

impl ObjectInfo {
    pub fn kind(&self) -> HandleKind {
        match self {
            ObjectInfo::Platform => HandleKind::Platform,
            ObjectInfo::Device { .. } => HandleKind::Device,
            ObjectInfo::Context { .. } => HandleKind::Context,
            ObjectInfo::Queue { .. } => HandleKind::Queue,
            ObjectInfo::Mem(_) => HandleKind::Mem,
            ObjectInfo::Sampler { .. } => HandleKind::Sampler,
            ObjectInfo::Program(_) => HandleKind::Program,
            ObjectInfo::Kernel { .. } => HandleKind::Kernel,
            ObjectInfo::Event { .. } => HandleKind::Event,
        }
    }

    /// Objects kept alive by this one until it is destroyed
    pub fn private_retains(&self) -> Option<(HandleKind, Handle)> {
        match self {
            ObjectInfo::Mem(mem) => mem.backing().map(|h| (HandleKind::Mem, h)),
            ObjectInfo::Kernel { program, .. } => Some((HandleKind::Program, *program)),
            _ => None,
        }
    }

    /// Context the object belongs to, when it has one
    pub fn context(&self) -> Option<Handle> {
        match self {
            ObjectInfo::Queue { context, .. }
            | ObjectInfo::Sampler { context, .. }
            | ObjectInfo::Event { context, .. } => Some(*context),
            ObjectInfo::Mem(mem) => Some(mem.context),
            ObjectInfo::Program(program) => Some(program.context),
            _ => None,
        }
    }
}

/// Record of one live handle
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    /// Application-visible reference count
    pub refcount: u32,
    /// References held by dependent objects (sub-buffers, images, kernels)
    pub internal_refs: u32,
    /// Set once the object has been materialized by reconstruction or replay
    pub restored: bool,
    /// Position in creation order across all kinds
    pub creation_index: u64,
    pub info: ObjectInfo,
}

impl ObjectState {
    pub fn new(info: ObjectInfo, creation_index: u64) -> Self {
        Self {
            refcount: 1,
            internal_refs: 0,
            restored: false,
            creation_index,
            info,
        }
    }

    /// Released by the application but still kept by a dependent
    pub fn is_zombie(&self) -> bool {
        self.refcount == 0 && self.internal_refs > 0
    }

    pub fn is_dead(&self) -> bool {
        self.refcount == 0 && self.internal_refs == 0
    }
}

/// Record of one SVM or USM allocation
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationState {
    pub kind: AllocKind,
    pub context: Handle,
    /// Owning device; null for SVM and host USM
    pub device: Handle,
    pub size: u64,
    pub alignment: u32,
    pub svm_flags: Option<SvmFlags>,
    pub properties: Vec<u64>,
    pub creation_index: u64,
    pub restored: bool,
}

/// Host view of a memory object created by a map call
#[derive(Debug, Clone, PartialEq)]
pub struct MappedSnapshot {
    pub mapped_ptr: Address,
    pub mem: Handle,
    pub queue: Handle,
    pub map_flags: MapFlags,
    pub offset: u64,
    pub size: u64,
    /// Host-visible bytes captured at unmap time
    pub contents: Option<Vec<u8>>,
    pub creation_index: u64,
    pub restored: bool,
}
