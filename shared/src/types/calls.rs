//! Intercepted API calls
//!
//! `Call` is the closed set of calls the engine understands. Every variant
//! carries the arguments the engine needs to virtualize (handles, pointers,
//! sizes, flags) plus result slots that the runtime fills in. Large binaries
//! (program sources, buffer contents) are never embedded; they are referenced
//! through a [`ContentRef`] into the content store.

use crate::store::ContentRef;
use crate::types::handles::{Address, AllocFamily, AllocKind, Handle, HandleKind, ThreadId};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Memory object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

bitflags! {
    /// Host access requested when mapping a memory object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_INVALIDATE_REGION = 1 << 2;
    }
}

bitflags! {
    /// Shared virtual memory allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SvmFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const FINE_GRAIN_BUFFER = 1 << 10;
        const ATOMICS = 1 << 11;
    }
}

bitflags! {
    /// Memory kinds a kernel may touch without an explicit argument binding
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IndirectAccess: u8 {
        const HOST = 1 << 0;
        const DEVICE = 1 << 1;
        const SHARED = 1 << 2;
    }
}

impl IndirectAccess {
    /// Whether an allocation of `kind` is covered by these declarations
    pub fn covers(self, kind: AllocKind) -> bool {
        match kind {
            AllocKind::UsmHost => self.contains(IndirectAccess::HOST),
            AllocKind::UsmDevice => self.contains(IndirectAccess::DEVICE),
            AllocKind::UsmShared => self.contains(IndirectAccess::SHARED),
            AllocKind::SvmFineGrain | AllocKind::SvmCoarseGrain => false,
        }
    }
}

/// Device type mask used for device enumeration
pub type DeviceType = u64;
pub const DEVICE_TYPE_ALL: DeviceType = 0xFFFF_FFFF;

/// Status value marking a user event complete
pub const EVENT_COMPLETE: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFormat {
    pub channel_order: u32,
    pub channel_type: u32,
}

impl ImageFormat {
    /// Bytes per pixel for the channel layouts the engine needs to size
    pub fn pixel_size(&self) -> u64 {
        let channels: u64 = match self.channel_order {
            0x10B0 | 0x10B1 => 1,
            0x10B2 | 0x10B3 => 2,
            0x10B4 => 3,
            _ => 4,
        };
        let channel_bytes: u64 = match self.channel_type {
            0x10D0 | 0x10D2 | 0x10D7 | 0x10DA => 1,
            0x10D1 | 0x10D3 | 0x10D8 | 0x10DB | 0x10DD => 2,
            _ => 4,
        };
        channels * channel_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDesc {
    pub image_type: u32,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    pub array_size: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
    /// Buffer the image is created from, or null
    pub buffer: Handle,
}

impl ImageDesc {
    /// Byte size of the image storage for the given format
    pub fn byte_size(&self, format: &ImageFormat) -> u64 {
        let row = if self.row_pitch > 0 {
            self.row_pitch
        } else {
            self.width * format.pixel_size()
        };
        row * self.height.max(1) * self.depth.max(1) * self.array_size.max(1)
    }
}

/// Value bound through the generic set-argument call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgValue {
    /// Plain bytes copied at bind time
    Bytes(Vec<u8>),
    /// Local memory reservation, no value
    Local,
    Mem(Handle),
    Sampler(Handle),
    /// Pointer into an SVM/USM allocation passed by value
    Pointer(Address),
}

/// Kernel execution info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecInfo {
    IndirectAccess { access: IndirectAccess, enabled: bool },
    /// SVM pointers the kernel may reach indirectly
    SvmPointers(Vec<Address>),
    /// USM pointers the kernel may reach indirectly
    UsmPointers(Vec<Address>),
}

/// How a pointer field must resolve against the tracked allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerRole {
    /// Must be the exact base of an allocation (free, update records)
    Base,
    /// May point anywhere inside an allocation
    Interior,
    /// May point into an allocation or into plain host memory
    MaybeHost,
}

/// Mutable view of one pointer-bearing field of a call
#[derive(Debug)]
pub struct PointerSlot<'a> {
    pub value: &'a mut Address,
    pub family: Option<AllocFamily>,
    pub role: PointerRole,
}

/// Intercepted or engine-injected call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Call {
    GetPlatformIds {
        platforms: Vec<Handle>,
    },
    GetDeviceIds {
        platform: Handle,
        device_type: DeviceType,
        devices: Vec<Handle>,
    },
    CreateContext {
        devices: Vec<Handle>,
        properties: Vec<u64>,
        result: Handle,
    },
    CreateCommandQueue {
        context: Handle,
        device: Handle,
        properties: u64,
        result: Handle,
    },
    CreateBuffer {
        context: Handle,
        flags: MemFlags,
        size: u64,
        data: Option<ContentRef>,
        result: Handle,
    },
    CreateSubBuffer {
        parent: Handle,
        flags: MemFlags,
        origin: u64,
        size: u64,
        result: Handle,
    },
    CreateImage {
        context: Handle,
        flags: MemFlags,
        format: ImageFormat,
        desc: ImageDesc,
        data: Option<ContentRef>,
        result: Handle,
    },
    CreateSampler {
        context: Handle,
        normalized_coords: bool,
        addressing_mode: u32,
        filter_mode: u32,
        result: Handle,
    },
    CreateProgramWithSource {
        context: Handle,
        sources: Vec<ContentRef>,
        result: Handle,
    },
    CreateProgramWithBinary {
        context: Handle,
        devices: Vec<Handle>,
        binaries: Vec<ContentRef>,
        result: Handle,
    },
    BuildProgram {
        program: Handle,
        devices: Vec<Handle>,
        options: String,
    },
    CreateKernel {
        program: Handle,
        name: String,
        result: Handle,
    },
    SetKernelArg {
        kernel: Handle,
        index: u32,
        size: u64,
        value: ArgValue,
    },
    SetKernelArgSvmPointer {
        kernel: Handle,
        index: u32,
        ptr: Address,
    },
    SetKernelArgMemPointer {
        kernel: Handle,
        index: u32,
        ptr: Address,
    },
    SetKernelExecInfo {
        kernel: Handle,
        info: ExecInfo,
    },
    EnqueueNdRangeKernel {
        queue: Handle,
        kernel: Handle,
        work_dim: u32,
        global_offset: Vec<u64>,
        global_size: Vec<u64>,
        local_size: Vec<u64>,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueReadBuffer {
        queue: Handle,
        buffer: Handle,
        blocking: bool,
        offset: u64,
        size: u64,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueWriteBuffer {
        queue: Handle,
        buffer: Handle,
        blocking: bool,
        offset: u64,
        size: u64,
        data: ContentRef,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueCopyBuffer {
        queue: Handle,
        src: Handle,
        dst: Handle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueMapBuffer {
        queue: Handle,
        buffer: Handle,
        blocking: bool,
        map_flags: MapFlags,
        offset: u64,
        size: u64,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
        mapped_ptr: Address,
    },
    EnqueueUnmapMemObject {
        queue: Handle,
        mem: Handle,
        mapped_ptr: Address,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    SvmAlloc {
        context: Handle,
        flags: SvmFlags,
        size: u64,
        alignment: u32,
        result: Address,
    },
    SvmFree {
        context: Handle,
        ptr: Address,
    },
    EnqueueSvmMemcpy {
        queue: Handle,
        blocking: bool,
        dst: Address,
        src: Address,
        size: u64,
        /// Source bytes when the source is plain host memory
        src_data: Option<ContentRef>,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueSvmMemFill {
        queue: Handle,
        ptr: Address,
        pattern: Vec<u8>,
        size: u64,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    UsmAlloc {
        kind: AllocKind,
        context: Handle,
        device: Handle,
        properties: Vec<u64>,
        size: u64,
        alignment: u32,
        result: Address,
    },
    UsmFree {
        context: Handle,
        ptr: Address,
    },
    EnqueueUsmMemcpy {
        queue: Handle,
        blocking: bool,
        dst: Address,
        src: Address,
        size: u64,
        src_data: Option<ContentRef>,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    EnqueueUsmMemFill {
        queue: Handle,
        ptr: Address,
        pattern: Vec<u8>,
        size: u64,
        wait_list: Vec<Handle>,
        event: Option<Handle>,
    },
    CreateUserEvent {
        context: Handle,
        result: Handle,
    },
    SetUserEventStatus {
        event: Handle,
        status: i32,
    },
    WaitForEvents {
        events: Vec<Handle>,
    },
    Finish {
        queue: Handle,
    },
    Retain {
        kind: HandleKind,
        handle: Handle,
    },
    Release {
        kind: HandleKind,
        handle: Handle,
    },
    GetExtensionFunctionAddress {
        platform: Handle,
        name: String,
    },

    // Records injected by the engine
    /// Switch the current application thread
    SetThread {
        thread: ThreadId,
    },
    /// Overwrite `length` bytes at `offset` inside the allocation based at `ptr`
    UpdateAllocation {
        ptr: Address,
        offset: u64,
        length: u64,
        content: ContentRef,
    },
    /// Overwrite a byte range of a memory object
    UpdateBuffer {
        buffer: Handle,
        offset: u64,
        length: u64,
        content: ContentRef,
    },
    /// Overwrite the host-visible bytes of a mapped region before it is unmapped
    UpdateMappedRegion {
        mapped_ptr: Address,
        length: u64,
        content: ContentRef,
    },
    /// Byte offsets inside the allocation based at `ptr` that hold pointers
    RegisterIndirectPointers {
        ptr: Address,
        offsets: Vec<u64>,
    },
}

/// Events and wait lists appear on every enqueue; this visits both.
fn visit_event_fields(
    wait_list: &mut [Handle],
    f: &mut dyn FnMut(HandleKind, &mut Handle),
) {
    for event in wait_list {
        f(HandleKind::Event, event);
    }
}

impl Call {
    /// API-level name of the call, used for logging and summaries
    pub fn name(&self) -> &'static str {
        match self {
            Call::GetPlatformIds { .. } => "clGetPlatformIDs",
            Call::GetDeviceIds { .. } => "clGetDeviceIDs",
            Call::CreateContext { .. } => "clCreateContext",
            Call::CreateCommandQueue { .. } => "clCreateCommandQueue",
            Call::CreateBuffer { .. } => "clCreateBuffer",
            Call::CreateSubBuffer { .. } => "clCreateSubBuffer",
            Call::CreateImage { .. } => "clCreateImage",
            Call::CreateSampler { .. } => "clCreateSampler",
            Call::CreateProgramWithSource { .. } => "clCreateProgramWithSource",
            Call::CreateProgramWithBinary { .. } => "clCreateProgramWithBinary",
            Call::BuildProgram { .. } => "clBuildProgram",
            Call::CreateKernel { .. } => "clCreateKernel",
            Call::SetKernelArg { .. } => "clSetKernelArg",
            Call::SetKernelArgSvmPointer { .. } => "clSetKernelArgSVMPointer",
            Call::SetKernelArgMemPointer { .. } => "clSetKernelArgMemPointerINTEL",
            Call::SetKernelExecInfo { .. } => "clSetKernelExecInfo",
            Call::EnqueueNdRangeKernel { .. } => "clEnqueueNDRangeKernel",
            Call::EnqueueReadBuffer { .. } => "clEnqueueReadBuffer",
            Call::EnqueueWriteBuffer { .. } => "clEnqueueWriteBuffer",
            Call::EnqueueCopyBuffer { .. } => "clEnqueueCopyBuffer",
            Call::EnqueueMapBuffer { .. } => "clEnqueueMapBuffer",
            Call::EnqueueUnmapMemObject { .. } => "clEnqueueUnmapMemObject",
            Call::SvmAlloc { .. } => "clSVMAlloc",
            Call::SvmFree { .. } => "clSVMFree",
            Call::EnqueueSvmMemcpy { .. } => "clEnqueueSVMMemcpy",
            Call::EnqueueSvmMemFill { .. } => "clEnqueueSVMMemFill",
            Call::UsmAlloc { kind, .. } => match kind {
                AllocKind::UsmHost => "clHostMemAllocINTEL",
                AllocKind::UsmShared => "clSharedMemAllocINTEL",
                _ => "clDeviceMemAllocINTEL",
            },
            Call::UsmFree { .. } => "clMemFreeINTEL",
            Call::EnqueueUsmMemcpy { .. } => "clEnqueueMemcpyINTEL",
            Call::EnqueueUsmMemFill { .. } => "clEnqueueMemFillINTEL",
            Call::CreateUserEvent { .. } => "clCreateUserEvent",
            Call::SetUserEventStatus { .. } => "clSetUserEventStatus",
            Call::WaitForEvents { .. } => "clWaitForEvents",
            Call::Finish { .. } => "clFinish",
            Call::Retain { kind, .. } => match kind {
                HandleKind::Platform | HandleKind::Device => "clRetainDevice",
                HandleKind::Context => "clRetainContext",
                HandleKind::Queue => "clRetainCommandQueue",
                HandleKind::Program => "clRetainProgram",
                HandleKind::Kernel => "clRetainKernel",
                HandleKind::Mem => "clRetainMemObject",
                HandleKind::Sampler => "clRetainSampler",
                HandleKind::Event => "clRetainEvent",
            },
            Call::Release { kind, .. } => match kind {
                HandleKind::Platform | HandleKind::Device => "clReleaseDevice",
                HandleKind::Context => "clReleaseContext",
                HandleKind::Queue => "clReleaseCommandQueue",
                HandleKind::Program => "clReleaseProgram",
                HandleKind::Kernel => "clReleaseKernel",
                HandleKind::Mem => "clReleaseMemObject",
                HandleKind::Sampler => "clReleaseSampler",
                HandleKind::Event => "clReleaseEvent",
            },
            Call::GetExtensionFunctionAddress { .. } => "clGetExtensionFunctionAddressForPlatform",
            Call::SetThread { .. } => "SetThread",
            Call::UpdateAllocation { .. } => "UpdateAllocation",
            Call::UpdateBuffer { .. } => "UpdateBuffer",
            Call::UpdateMappedRegion { .. } => "UpdateMappedRegion",
            Call::RegisterIndirectPointers { .. } => "RegisterIndirectPointers",
        }
    }

    /// Whether the record was injected by the engine rather than issued by the application
    pub fn is_injected(&self) -> bool {
        matches!(
            self,
            Call::SetThread { .. }
                | Call::UpdateAllocation { .. }
                | Call::UpdateBuffer { .. }
                | Call::UpdateMappedRegion { .. }
                | Call::RegisterIndirectPointers { .. }
        )
    }

    pub fn is_kernel_launch(&self) -> bool {
        matches!(self, Call::EnqueueNdRangeKernel { .. })
    }

    /// Visit every handle the call consumes (looked up, never bound)
    pub fn visit_inputs(&mut self, f: &mut dyn FnMut(HandleKind, &mut Handle)) {
        match self {
            Call::GetPlatformIds { .. } => {}
            Call::GetDeviceIds { platform, .. } => f(HandleKind::Platform, platform),
            Call::CreateContext { devices, .. } => {
                for device in devices {
                    f(HandleKind::Device, device);
                }
            }
            Call::CreateCommandQueue { context, device, .. } => {
                f(HandleKind::Context, context);
                f(HandleKind::Device, device);
            }
            Call::CreateBuffer { context, .. } => f(HandleKind::Context, context),
            Call::CreateSubBuffer { parent, .. } => f(HandleKind::Mem, parent),
            Call::CreateImage { context, desc, .. } => {
                f(HandleKind::Context, context);
                f(HandleKind::Mem, &mut desc.buffer);
            }
            Call::CreateSampler { context, .. } => f(HandleKind::Context, context),
            Call::CreateProgramWithSource { context, .. } => f(HandleKind::Context, context),
            Call::CreateProgramWithBinary { context, devices, .. } => {
                f(HandleKind::Context, context);
                for device in devices {
                    f(HandleKind::Device, device);
                }
            }
            Call::BuildProgram { program, devices, .. } => {
                f(HandleKind::Program, program);
                for device in devices {
                    f(HandleKind::Device, device);
                }
            }
            Call::CreateKernel { program, .. } => f(HandleKind::Program, program),
            Call::SetKernelArg { kernel, value, .. } => {
                f(HandleKind::Kernel, kernel);
                match value {
                    ArgValue::Mem(mem) => f(HandleKind::Mem, mem),
                    ArgValue::Sampler(sampler) => f(HandleKind::Sampler, sampler),
                    ArgValue::Bytes(_) | ArgValue::Local | ArgValue::Pointer(_) => {}
                }
            }
            Call::SetKernelArgSvmPointer { kernel, .. }
            | Call::SetKernelArgMemPointer { kernel, .. }
            | Call::SetKernelExecInfo { kernel, .. } => f(HandleKind::Kernel, kernel),
            Call::EnqueueNdRangeKernel {
                queue,
                kernel,
                wait_list,
                ..
            } => {
                f(HandleKind::Queue, queue);
                f(HandleKind::Kernel, kernel);
                visit_event_fields(wait_list, f);
            }
            Call::EnqueueReadBuffer {
                queue,
                buffer,
                wait_list,
                ..
            }
            | Call::EnqueueWriteBuffer {
                queue,
                buffer,
                wait_list,
                ..
            }
            | Call::EnqueueMapBuffer {
                queue,
                buffer,
                wait_list,
                ..
            } => {
                f(HandleKind::Queue, queue);
                f(HandleKind::Mem, buffer);
                visit_event_fields(wait_list, f);
            }
            Call::EnqueueCopyBuffer {
                queue,
                src,
                dst,
                wait_list,
                ..
            } => {
                f(HandleKind::Queue, queue);
                f(HandleKind::Mem, src);
                f(HandleKind::Mem, dst);
                visit_event_fields(wait_list, f);
            }
            Call::EnqueueUnmapMemObject {
                queue,
                mem,
                wait_list,
                ..
            } => {
                f(HandleKind::Queue, queue);
                f(HandleKind::Mem, mem);
                visit_event_fields(wait_list, f);
            }
            Call::SvmAlloc { context, .. }
            | Call::SvmFree { context, .. }
            | Call::UsmFree { context, .. }
            | Call::CreateUserEvent { context, .. } => f(HandleKind::Context, context),
            Call::UsmAlloc {
                context, device, ..
            } => {
                f(HandleKind::Context, context);
                f(HandleKind::Device, device);
            }
            Call::EnqueueSvmMemcpy {
                queue, wait_list, ..
            }
            | Call::EnqueueSvmMemFill {
                queue, wait_list, ..
            }
            | Call::EnqueueUsmMemcpy {
                queue, wait_list, ..
            }
            | Call::EnqueueUsmMemFill {
                queue, wait_list, ..
            } => {
                f(HandleKind::Queue, queue);
                visit_event_fields(wait_list, f);
            }
            Call::SetUserEventStatus { event, .. } => f(HandleKind::Event, event),
            Call::WaitForEvents { events } => visit_event_fields(events, f),
            Call::Finish { queue } => f(HandleKind::Queue, queue),
            Call::Retain { kind, handle } | Call::Release { kind, handle } => f(*kind, handle),
            Call::GetExtensionFunctionAddress { platform, .. } => {
                f(HandleKind::Platform, platform)
            }
            Call::UpdateBuffer { buffer, .. } => f(HandleKind::Mem, buffer),
            Call::SetThread { .. }
            | Call::UpdateAllocation { .. }
            | Call::UpdateMappedRegion { .. }
            | Call::RegisterIndirectPointers { .. } => {}
        }
    }

    /// Visit every handle the call produces (bound to a fresh identity on replay)
    pub fn visit_outputs(&mut self, f: &mut dyn FnMut(HandleKind, &mut Handle)) {
        match self {
            Call::GetPlatformIds { platforms } => {
                for platform in platforms {
                    f(HandleKind::Platform, platform);
                }
            }
            Call::GetDeviceIds { devices, .. } => {
                for device in devices {
                    f(HandleKind::Device, device);
                }
            }
            Call::CreateContext { result, .. } => f(HandleKind::Context, result),
            Call::CreateCommandQueue { result, .. } => f(HandleKind::Queue, result),
            Call::CreateBuffer { result, .. }
            | Call::CreateSubBuffer { result, .. }
            | Call::CreateImage { result, .. } => f(HandleKind::Mem, result),
            Call::CreateSampler { result, .. } => f(HandleKind::Sampler, result),
            Call::CreateProgramWithSource { result, .. }
            | Call::CreateProgramWithBinary { result, .. } => f(HandleKind::Program, result),
            Call::CreateKernel { result, .. } => f(HandleKind::Kernel, result),
            Call::CreateUserEvent { result, .. } => f(HandleKind::Event, result),
            Call::EnqueueNdRangeKernel { event, .. }
            | Call::EnqueueReadBuffer { event, .. }
            | Call::EnqueueWriteBuffer { event, .. }
            | Call::EnqueueCopyBuffer { event, .. }
            | Call::EnqueueMapBuffer { event, .. }
            | Call::EnqueueUnmapMemObject { event, .. }
            | Call::EnqueueSvmMemcpy { event, .. }
            | Call::EnqueueSvmMemFill { event, .. }
            | Call::EnqueueUsmMemcpy { event, .. }
            | Call::EnqueueUsmMemFill { event, .. } => {
                if let Some(event) = event {
                    f(HandleKind::Event, event);
                }
            }
            _ => {}
        }
    }

    /// Visit every pointer into SVM/USM allocations the call consumes.
    ///
    /// Allocation results and mapped pointers are not visited; they are
    /// produced by the runtime and bound rather than translated.
    pub fn visit_pointers(&mut self, f: &mut dyn FnMut(PointerSlot<'_>)) {
        match self {
            Call::SetKernelArg {
                value: ArgValue::Pointer(ptr),
                ..
            } => f(PointerSlot {
                value: ptr,
                family: None,
                role: PointerRole::Interior,
            }),
            Call::SetKernelArgSvmPointer { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Svm),
                role: PointerRole::Interior,
            }),
            Call::SetKernelArgMemPointer { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Usm),
                role: PointerRole::Interior,
            }),
            Call::SetKernelExecInfo { info, .. } => match info {
                ExecInfo::SvmPointers(ptrs) => {
                    for ptr in ptrs {
                        f(PointerSlot {
                            value: ptr,
                            family: Some(AllocFamily::Svm),
                            role: PointerRole::Interior,
                        });
                    }
                }
                ExecInfo::UsmPointers(ptrs) => {
                    for ptr in ptrs {
                        f(PointerSlot {
                            value: ptr,
                            family: Some(AllocFamily::Usm),
                            role: PointerRole::Interior,
                        });
                    }
                }
                ExecInfo::IndirectAccess { .. } => {}
            },
            Call::SvmFree { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Svm),
                role: PointerRole::Base,
            }),
            Call::UsmFree { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Usm),
                role: PointerRole::Base,
            }),
            Call::EnqueueSvmMemcpy { dst, src, .. } => {
                f(PointerSlot {
                    value: dst,
                    family: Some(AllocFamily::Svm),
                    role: PointerRole::MaybeHost,
                });
                f(PointerSlot {
                    value: src,
                    family: Some(AllocFamily::Svm),
                    role: PointerRole::MaybeHost,
                });
            }
            Call::EnqueueUsmMemcpy { dst, src, .. } => {
                f(PointerSlot {
                    value: dst,
                    family: Some(AllocFamily::Usm),
                    role: PointerRole::MaybeHost,
                });
                f(PointerSlot {
                    value: src,
                    family: Some(AllocFamily::Usm),
                    role: PointerRole::MaybeHost,
                });
            }
            Call::EnqueueSvmMemFill { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Svm),
                role: PointerRole::Interior,
            }),
            Call::EnqueueUsmMemFill { ptr, .. } => f(PointerSlot {
                value: ptr,
                family: Some(AllocFamily::Usm),
                role: PointerRole::Interior,
            }),
            Call::UpdateAllocation { ptr, .. } | Call::RegisterIndirectPointers { ptr, .. } => {
                f(PointerSlot {
                    value: ptr,
                    family: None,
                    role: PointerRole::Base,
                })
            }
            _ => {}
        }
    }

    /// Handles consumed by the call, by value
    pub fn inputs(&self) -> Vec<(HandleKind, Handle)> {
        let mut out = Vec::new();
        self.clone().visit_inputs(&mut |kind, handle| out.push((kind, *handle)));
        out
    }

    /// Handles produced by the call, by value
    pub fn outputs(&self) -> Vec<(HandleKind, Handle)> {
        let mut out = Vec::new();
        self.clone().visit_outputs(&mut |kind, handle| out.push((kind, *handle)));
        out
    }

    /// Pointer-addressed allocation produced by the call: (kind, base, size)
    pub fn allocation_result(&self) -> Option<(AllocKind, Address, u64)> {
        match self {
            Call::SvmAlloc {
                flags,
                size,
                result,
                ..
            } => {
                let kind = if flags.contains(SvmFlags::FINE_GRAIN_BUFFER) {
                    AllocKind::SvmFineGrain
                } else {
                    AllocKind::SvmCoarseGrain
                };
                Some((kind, *result, *size))
            }
            Call::UsmAlloc {
                kind, size, result, ..
            } => Some((*kind, *result, *size)),
            _ => None,
        }
    }

    /// Content blobs referenced by the call
    pub fn content_refs(&self) -> Vec<&ContentRef> {
        match self {
            Call::CreateBuffer { data, .. } | Call::CreateImage { data, .. } => {
                data.iter().collect()
            }
            Call::CreateProgramWithSource { sources, .. } => sources.iter().collect(),
            Call::CreateProgramWithBinary { binaries, .. } => binaries.iter().collect(),
            Call::EnqueueWriteBuffer { data, .. } => vec![data],
            Call::EnqueueSvmMemcpy { src_data, .. } | Call::EnqueueUsmMemcpy { src_data, .. } => {
                src_data.iter().collect()
            }
            Call::UpdateAllocation { content, .. }
            | Call::UpdateBuffer { content, .. }
            | Call::UpdateMappedRegion { content, .. } => vec![content],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> Call {
        Call::EnqueueNdRangeKernel {
            queue: Handle(0x10),
            kernel: Handle(0x20),
            work_dim: 1,
            global_offset: vec![0],
            global_size: vec![64],
            local_size: vec![],
            wait_list: vec![Handle(0x30), Handle(0x31)],
            event: Some(Handle(0x40)),
        }
    }

    #[test]
    fn test_launch_inputs_and_outputs() {
        let call = launch();
        assert_eq!(
            call.inputs(),
            vec![
                (HandleKind::Queue, Handle(0x10)),
                (HandleKind::Kernel, Handle(0x20)),
                (HandleKind::Event, Handle(0x30)),
                (HandleKind::Event, Handle(0x31)),
            ]
        );
        assert_eq!(call.outputs(), vec![(HandleKind::Event, Handle(0x40))]);
        assert!(call.is_kernel_launch());
    }

    #[test]
    fn test_visit_inputs_rewrites_in_place() {
        let mut call = Call::SetKernelArg {
            kernel: Handle(1),
            index: 0,
            size: 8,
            value: ArgValue::Mem(Handle(2)),
        };
        call.visit_inputs(&mut |_, handle| handle.0 += 100);
        assert_eq!(
            call,
            Call::SetKernelArg {
                kernel: Handle(101),
                index: 0,
                size: 8,
                value: ArgValue::Mem(Handle(102)),
            }
        );
    }

    #[test]
    fn test_pointer_slots() {
        let mut call = Call::EnqueueUsmMemcpy {
            queue: Handle(1),
            blocking: true,
            dst: 0x1000,
            src: 0x2000,
            size: 16,
            src_data: None,
            wait_list: vec![],
            event: None,
        };
        let mut seen = Vec::new();
        call.visit_pointers(&mut |slot| {
            seen.push((*slot.value, slot.family, slot.role));
            *slot.value += 1;
        });
        assert_eq!(
            seen,
            vec![
                (0x1000, Some(AllocFamily::Usm), PointerRole::MaybeHost),
                (0x2000, Some(AllocFamily::Usm), PointerRole::MaybeHost),
            ]
        );
        match call {
            Call::EnqueueUsmMemcpy { dst, src, .. } => {
                assert_eq!(dst, 0x1001);
                assert_eq!(src, 0x2001);
            }
            _ => panic!("expected memcpy"),
        }
    }

    #[test]
    fn test_svm_allocation_result_kind() {
        let call = Call::SvmAlloc {
            context: Handle(1),
            flags: SvmFlags::READ_WRITE | SvmFlags::FINE_GRAIN_BUFFER,
            size: 4096,
            alignment: 0,
            result: 0x7000_0000,
        };
        assert_eq!(
            call.allocation_result(),
            Some((AllocKind::SvmFineGrain, 0x7000_0000, 4096))
        );
    }

    #[test]
    fn test_indirect_access_covers() {
        let access = IndirectAccess::DEVICE | IndirectAccess::SHARED;
        assert!(access.covers(AllocKind::UsmDevice));
        assert!(access.covers(AllocKind::UsmShared));
        assert!(!access.covers(AllocKind::UsmHost));
        assert!(!access.covers(AllocKind::SvmCoarseGrain));
    }

    #[test]
    fn test_image_byte_size() {
        let format = ImageFormat {
            channel_order: 0x10B5,
            channel_type: 0x10D2,
        };
        let desc = ImageDesc {
            image_type: 0x10F1,
            width: 16,
            height: 4,
            depth: 0,
            array_size: 0,
            row_pitch: 0,
            slice_pitch: 0,
            buffer: Handle::NULL,
        };
        assert_eq!(desc.byte_size(&format), 16 * 4 * 4);
    }
}
