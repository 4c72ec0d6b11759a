//! In-process simulated runtime
//!
//! Issues handles and addresses from configurable bases, keeps buffer and
//! allocation contents in host memory and logs every operation it receives.
//! Used for dry-run replays and as the application-side runtime in tests.

use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use retrace_shared::store::MemoryStore;
use retrace_shared::{
    Address, AllocKind, ArgValue, Call, ContentRef, ContentStore, Handle, HandleKind, MapFlags,
    SvmFlags, DEVICE_TYPE_ALL,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

const PAGE: u64 = 0x1000;

/// Vendor suffixes of the extension functions the simulator exposes
const EXTENSION_SUFFIXES: [&str; 2] = ["INTEL", "KHR"];

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// First handle value issued
    pub handle_base: u64,
    /// First address handed out for allocations and mappings
    pub address_base: Address,
    pub platforms: usize,
    pub devices_per_platform: usize,
    /// Report host writes to protected host-resident allocations, the way a
    /// page-protection fault handler would
    pub sniff_host_writes: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            handle_base: 0x1000,
            address_base: 0x7f00_0000_0000,
            platforms: 1,
            devices_per_platform: 1,
            sniff_host_writes: true,
        }
    }
}

/// One operation received by the simulator
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    Call(Call),
    ReadMemory { ptr: Address, len: u64 },
    WriteMemory { ptr: Address, len: u64 },
    ReadBuffer { mem: Handle, offset: u64, len: u64 },
    WriteBuffer { mem: Handle, offset: u64, len: u64 },
}

/// Handles created by [`SimRuntime::bootstrap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSession {
    pub platform: Handle,
    pub device: Handle,
    pub context: Handle,
    pub queue: Handle,
}

/// Host-side backing of allocations and mapped regions
#[derive(Debug, Default)]
pub struct SimMemory {
    regions: BTreeMap<Address, Vec<u8>>,
}

impl SimMemory {
    fn insert(&mut self, base: Address, bytes: Vec<u8>) {
        self.regions.insert(base, bytes);
    }

    fn remove(&mut self, base: Address) -> Option<Vec<u8>> {
        self.regions.remove(&base)
    }

    fn locate(&self, ptr: Address, len: u64) -> Option<(Address, usize, usize)> {
        let (base, bytes) = self.regions.range(..=ptr).next_back()?;
        let start = (ptr - base) as usize;
        let end = start.checked_add(len as usize)?;
        (end <= bytes.len()).then_some((*base, start, end))
    }

    pub fn slice(&self, ptr: Address, len: u64) -> Option<&[u8]> {
        let (base, start, end) = self.locate(ptr, len)?;
        self.regions.get(&base).map(|bytes| &bytes[start..end])
    }

    pub fn slice_mut(&mut self, ptr: Address, len: u64) -> Option<&mut [u8]> {
        let (base, start, end) = self.locate(ptr, len)?;
        self.regions.get_mut(&base).map(|bytes| &mut bytes[start..end])
    }
}

/// Kernel body run on launch with the pointer-like argument values in index order
pub type KernelHook = Box<dyn FnMut(&mut SimMemory, &[u64]) + Send>;

#[derive(Debug, Clone, Copy)]
struct SimObject {
    kind: HandleKind,
    refcount: u32,
}

#[derive(Debug, Clone, Copy)]
struct MemView {
    root: Handle,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    mem: Handle,
    offset: u64,
    size: u64,
    write: bool,
}

/// Write-protected range and the pages written through it since
#[derive(Debug, Clone)]
struct Protection {
    len: u64,
    page_size: u64,
    written: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
struct SimKernel {
    name: String,
    args: BTreeMap<u32, u64>,
}

pub struct SimRuntime {
    config: SimConfig,
    next_handle: u64,
    next_address: Address,
    platforms: Vec<Handle>,
    devices: Vec<(Handle, Handle)>,
    objects: HashMap<Handle, SimObject>,
    views: HashMap<Handle, MemView>,
    /// Object each dependent keeps alive (sub-buffer parent, image buffer, kernel program)
    holds: HashMap<Handle, Handle>,
    storage: HashMap<Handle, Vec<u8>>,
    memory: SimMemory,
    allocations: HashMap<Address, AllocKind>,
    protected: BTreeMap<Address, Protection>,
    mappings: HashMap<Address, Mapping>,
    kernels: HashMap<Handle, SimKernel>,
    hooks: HashMap<String, KernelHook>,
    ops: Vec<SimOp>,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

fn error(call: &'static str, reason: impl Into<String>) -> EngineError {
    EngineError::Runtime {
        call,
        reason: reason.into(),
    }
}

impl SimRuntime {
    pub fn new(config: SimConfig) -> Self {
        Self {
            next_handle: config.handle_base,
            next_address: config.address_base,
            config,
            platforms: Vec::new(),
            devices: Vec::new(),
            objects: HashMap::new(),
            views: HashMap::new(),
            holds: HashMap::new(),
            storage: HashMap::new(),
            memory: SimMemory::default(),
            allocations: HashMap::new(),
            protected: BTreeMap::new(),
            mappings: HashMap::new(),
            kernels: HashMap::new(),
            hooks: HashMap::new(),
            ops: Vec::new(),
        }
    }

    /// Run `hook` whenever a kernel named `name` is launched
    pub fn on_kernel(&mut self, name: impl Into<String>, hook: KernelHook) {
        self.hooks.insert(name.into(), hook);
    }

    /// Dispatch a call that references no stored content
    pub fn issue(&mut self, call: &mut Call) -> Result<()> {
        self.dispatch(call, &MemoryStore::new())
    }

    /// Enumerate the first platform and device and create a context and queue on them
    pub fn bootstrap(&mut self) -> Result<SimSession> {
        let mut platforms = Call::GetPlatformIds { platforms: vec![] };
        self.issue(&mut platforms)?;
        let platform = match &platforms {
            Call::GetPlatformIds { platforms } => platforms.first().copied(),
            _ => None,
        }
        .ok_or_else(|| error("clGetPlatformIDs", "no platforms"))?;

        let mut devices = Call::GetDeviceIds {
            platform,
            device_type: DEVICE_TYPE_ALL,
            devices: vec![],
        };
        self.issue(&mut devices)?;
        let device = match &devices {
            Call::GetDeviceIds { devices, .. } => devices.first().copied(),
            _ => None,
        }
        .ok_or_else(|| error("clGetDeviceIDs", "no devices"))?;

        let mut context = Call::CreateContext {
            devices: vec![device],
            properties: vec![],
            result: Handle::NULL,
        };
        self.issue(&mut context)?;
        let context = context.outputs()[0].1;

        let mut queue = Call::CreateCommandQueue {
            context,
            device,
            properties: 0,
            result: Handle::NULL,
        };
        self.issue(&mut queue)?;
        let queue = queue.outputs()[0].1;

        Ok(SimSession {
            platform,
            device,
            context,
            queue,
        })
    }

    pub fn ops(&self) -> &[SimOp] {
        &self.ops
    }

    /// Calls received, in order
    pub fn calls(&self) -> impl Iterator<Item = &Call> + '_ {
        self.ops.iter().filter_map(|op| match op {
            SimOp::Call(call) => Some(call),
            _ => None,
        })
    }

    /// Number of received calls with the given API name
    pub fn count(&self, name: &str) -> usize {
        self.calls().filter(|call| call.name() == name).count()
    }

    /// Reference-counted objects still alive
    pub fn live_objects(&self) -> usize {
        self.objects
            .values()
            .filter(|object| !matches!(object.kind, HandleKind::Platform | HandleKind::Device))
            .count()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    fn new_handle(&mut self, kind: HandleKind) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 0x10;
        self.objects.insert(handle, SimObject { kind, refcount: 1 });
        handle
    }

    fn new_address(&mut self, size: u64) -> Address {
        let base = self.next_address;
        // Leave a guard page so neighbouring regions never touch
        self.next_address += size.max(1).div_ceil(PAGE) * PAGE + PAGE;
        base
    }

    fn check(&self, call: &'static str, kind: HandleKind, handle: Handle) -> Result<()> {
        match self.objects.get(&handle) {
            Some(object) if object.kind == kind => Ok(()),
            _ => Err(error(call, format!("invalid {} {}", kind, handle))),
        }
    }

    fn check_all(&self, call: &'static str, kind: HandleKind, handles: &[Handle]) -> Result<()> {
        handles
            .iter()
            .try_for_each(|handle| self.check(call, kind, *handle))
    }

    fn ensure_platforms(&mut self) {
        if !self.platforms.is_empty() {
            return;
        }
        for _ in 0..self.config.platforms {
            let platform = self.new_handle(HandleKind::Platform);
            self.platforms.push(platform);
            for _ in 0..self.config.devices_per_platform {
                let device = self.new_handle(HandleKind::Device);
                self.devices.push((platform, device));
            }
        }
    }

    fn signal(&mut self, event: &mut Option<Handle>) {
        if let Some(event) = event {
            *event = self.new_handle(HandleKind::Event);
        }
    }

    fn view(&self, call: &'static str, mem: Handle) -> Result<MemView> {
        self.views
            .get(&mem)
            .copied()
            .ok_or_else(|| error(call, format!("invalid mem {}", mem)))
    }

    fn new_storage(&mut self, size: u64, initial: Option<Vec<u8>>) -> Handle {
        let mut bytes = vec![0u8; size as usize];
        if let Some(data) = initial {
            let n = data.len().min(bytes.len());
            bytes[..n].copy_from_slice(&data[..n]);
        }
        let handle = self.new_handle(HandleKind::Mem);
        self.storage.insert(handle, bytes);
        self.views.insert(
            handle,
            MemView {
                root: handle,
                offset: 0,
                size,
            },
        );
        handle
    }

    fn read_view(&self, call: &'static str, mem: Handle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let view = self.view(call, mem)?;
        if offset + len > view.size {
            return Err(error(call, format!("range {}+{} outside mem {}", offset, len, mem)));
        }
        let start = (view.offset + offset) as usize;
        self.storage
            .get(&view.root)
            .and_then(|bytes| bytes.get(start..start + len as usize))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| error(call, format!("mem {} has no storage", mem)))
    }

    fn write_view(&mut self, call: &'static str, mem: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let view = self.view(call, mem)?;
        if offset + data.len() as u64 > view.size {
            return Err(error(call, format!("write past the end of mem {}", mem)));
        }
        let start = (view.offset + offset) as usize;
        let target = self
            .storage
            .get_mut(&view.root)
            .and_then(|bytes| bytes.get_mut(start..start + data.len()))
            .ok_or_else(|| error(call, format!("mem {} has no storage", mem)))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn release_object(&mut self, call: &'static str, kind: HandleKind, handle: Handle) -> Result<()> {
        self.check(call, kind, handle)?;
        if matches!(kind, HandleKind::Platform | HandleKind::Device) {
            return Ok(());
        }
        let Some(object) = self.objects.get_mut(&handle) else {
            return Ok(());
        };
        object.refcount -= 1;
        if object.refcount > 0 {
            return Ok(());
        }
        self.objects.remove(&handle);
        self.kernels.remove(&handle);
        if let Some(view) = self.views.remove(&handle) {
            let shared = self.views.values().any(|other| other.root == view.root);
            if !shared {
                self.storage.remove(&view.root);
            }
        }
        if let Some(held) = self.holds.remove(&handle) {
            let held_kind = if kind == HandleKind::Kernel {
                HandleKind::Program
            } else {
                HandleKind::Mem
            };
            self.release_object(call, held_kind, held)?;
        }
        Ok(())
    }

    fn hold(&mut self, dependent: Handle, held: Handle) {
        if let Some(object) = self.objects.get_mut(&held) {
            object.refcount += 1;
            self.holds.insert(dependent, held);
        }
    }

    fn allocate(&mut self, call: &'static str, kind: AllocKind, size: u64) -> Result<Address> {
        if size == 0 {
            return Err(EngineError::AllocationFailure {
                call,
                reason: "zero-sized allocation".into(),
            });
        }
        let base = self.new_address(size);
        self.memory.insert(base, vec![0u8; size as usize]);
        self.allocations.insert(base, kind);
        Ok(base)
    }

    fn free(&mut self, call: &'static str, ptr: Address) -> Result<()> {
        if self.allocations.remove(&ptr).is_none() {
            return Err(error(call, format!("{:#x} is not an allocation", ptr)));
        }
        self.memory.remove(ptr);
        self.protected.remove(&ptr);
        Ok(())
    }

    /// Record a host write against every protected range it touches
    fn note_host_write(&mut self, ptr: Address, len: u64) {
        let end = ptr.saturating_add(len);
        for (base, protection) in self.protected.range_mut(..end) {
            let range_end = base.saturating_add(protection.len);
            if len == 0 || ptr >= range_end || end <= *base {
                continue;
            }
            let first = ptr.max(*base) - base;
            let last = end.min(range_end) - 1 - base;
            protection
                .written
                .extend(first / protection.page_size..=last / protection.page_size);
        }
    }

    /// Whether host writes to the allocation at `base` are being recorded
    pub fn is_protected(&self, base: Address) -> bool {
        self.protected.contains_key(&base)
    }

    fn memcpy(
        &mut self,
        call: &'static str,
        dst: Address,
        src: Address,
        size: u64,
        src_data: &Option<ContentRef>,
        content: &dyn ContentStore,
    ) -> Result<()> {
        let bytes = match (self.memory.slice(src, size), src_data) {
            (Some(bytes), _) => bytes.to_vec(),
            (None, Some(data)) => content.get(data)?,
            (None, None) => return Err(error(call, format!("source {:#x} not accessible", src))),
        };
        // Destinations outside simulated memory are application host memory
        if let Some(target) = self.memory.slice_mut(dst, size) {
            let n = bytes.len().min(target.len());
            target[..n].copy_from_slice(&bytes[..n]);
        }
        Ok(())
    }

    fn launch(&mut self, kernel: Handle) {
        let Some(record) = self.kernels.get(&kernel) else {
            return;
        };
        let args: Vec<u64> = record.args.values().copied().collect();
        if let Some(hook) = self.hooks.get_mut(&record.name) {
            trace!("running hook for {}", record.name);
            hook(&mut self.memory, &args);
        }
    }

    fn set_arg(&mut self, kernel: Handle, index: u32, value: u64) {
        if let Some(record) = self.kernels.get_mut(&kernel) {
            record.args.insert(index, value);
        }
    }
}

impl Runtime for SimRuntime {
    fn dispatch(&mut self, call: &mut Call, content: &dyn ContentStore) -> Result<()> {
        let name = call.name();
        match call {
            Call::GetPlatformIds { platforms } => {
                self.ensure_platforms();
                *platforms = self.platforms.clone();
            }
            Call::GetDeviceIds {
                platform, devices, ..
            } => {
                self.check(name, HandleKind::Platform, *platform)?;
                *devices = self
                    .devices
                    .iter()
                    .filter(|(p, _)| p == platform)
                    .map(|(_, d)| *d)
                    .collect();
            }
            Call::CreateContext {
                devices, result, ..
            } => {
                if devices.is_empty() {
                    return Err(error(name, "no devices"));
                }
                self.check_all(name, HandleKind::Device, devices)?;
                *result = self.new_handle(HandleKind::Context);
            }
            Call::CreateCommandQueue {
                context,
                device,
                result,
                ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                self.check(name, HandleKind::Device, *device)?;
                *result = self.new_handle(HandleKind::Queue);
            }
            Call::CreateBuffer {
                context,
                size,
                data,
                result,
                ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                if *size == 0 {
                    return Err(error(name, "zero-sized buffer"));
                }
                let initial = data.as_ref().map(|d| content.get(d)).transpose()?;
                *result = self.new_storage(*size, initial);
            }
            Call::CreateSubBuffer {
                parent,
                origin,
                size,
                result,
                ..
            } => {
                let parent_view = self.view(name, *parent)?;
                if *origin + *size > parent_view.size {
                    return Err(error(name, "sub-buffer outside parent"));
                }
                let handle = self.new_handle(HandleKind::Mem);
                self.views.insert(
                    handle,
                    MemView {
                        root: parent_view.root,
                        offset: parent_view.offset + *origin,
                        size: *size,
                    },
                );
                self.hold(handle, *parent);
                *result = handle;
            }
            Call::CreateImage {
                context,
                format,
                desc,
                data,
                result,
                ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                let size = desc.byte_size(format);
                if desc.buffer.is_null() {
                    let initial = data.as_ref().map(|d| content.get(d)).transpose()?;
                    *result = self.new_storage(size, initial);
                } else {
                    let backing = self.view(name, desc.buffer)?;
                    if size > backing.size {
                        return Err(error(name, "image larger than its buffer"));
                    }
                    let handle = self.new_handle(HandleKind::Mem);
                    self.views.insert(handle, MemView { size, ..backing });
                    self.hold(handle, desc.buffer);
                    *result = handle;
                }
            }
            Call::CreateSampler {
                context, result, ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                *result = self.new_handle(HandleKind::Sampler);
            }
            Call::CreateProgramWithSource {
                context,
                sources,
                result,
            } => {
                self.check(name, HandleKind::Context, *context)?;
                if let Some(missing) = sources.iter().find(|s| !content.contains(s)) {
                    return Err(error(name, format!("source {} not available", missing)));
                }
                *result = self.new_handle(HandleKind::Program);
            }
            Call::CreateProgramWithBinary {
                context,
                devices,
                binaries,
                result,
            } => {
                self.check(name, HandleKind::Context, *context)?;
                self.check_all(name, HandleKind::Device, devices)?;
                if devices.len() != binaries.len() {
                    return Err(error(name, "one binary per device expected"));
                }
                if let Some(missing) = binaries.iter().find(|b| !content.contains(b)) {
                    return Err(error(name, format!("binary {} not available", missing)));
                }
                *result = self.new_handle(HandleKind::Program);
            }
            Call::BuildProgram {
                program, devices, ..
            } => {
                self.check(name, HandleKind::Program, *program)?;
                self.check_all(name, HandleKind::Device, devices)?;
            }
            Call::CreateKernel {
                program,
                name: kernel_name,
                result,
            } => {
                self.check(name, HandleKind::Program, *program)?;
                let handle = self.new_handle(HandleKind::Kernel);
                self.kernels.insert(
                    handle,
                    SimKernel {
                        name: kernel_name.clone(),
                        args: BTreeMap::new(),
                    },
                );
                self.hold(handle, *program);
                *result = handle;
            }
            Call::SetKernelArg {
                kernel,
                index,
                value,
                ..
            } => {
                self.check(name, HandleKind::Kernel, *kernel)?;
                let recorded = match value {
                    ArgValue::Mem(mem) => {
                        if !mem.is_null() {
                            self.check(name, HandleKind::Mem, *mem)?;
                        }
                        Some(mem.0)
                    }
                    ArgValue::Sampler(sampler) => {
                        self.check(name, HandleKind::Sampler, *sampler)?;
                        Some(sampler.0)
                    }
                    ArgValue::Pointer(ptr) => Some(*ptr),
                    ArgValue::Bytes(bytes) => {
                        <[u8; 8]>::try_from(bytes.as_slice()).ok().map(u64::from_le_bytes)
                    }
                    ArgValue::Local => None,
                };
                if let Some(value) = recorded {
                    self.set_arg(*kernel, *index, value);
                }
            }
            Call::SetKernelArgSvmPointer { kernel, index, ptr }
            | Call::SetKernelArgMemPointer { kernel, index, ptr } => {
                self.check(name, HandleKind::Kernel, *kernel)?;
                self.set_arg(*kernel, *index, *ptr);
            }
            Call::SetKernelExecInfo { kernel, .. } => {
                self.check(name, HandleKind::Kernel, *kernel)?;
            }
            Call::EnqueueNdRangeKernel {
                queue,
                kernel,
                wait_list,
                event,
                ..
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check(name, HandleKind::Kernel, *kernel)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                self.launch(*kernel);
                self.signal(event);
            }
            Call::EnqueueReadBuffer {
                queue,
                buffer,
                offset,
                size,
                wait_list,
                event,
                ..
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                self.read_view(name, *buffer, *offset, *size)?;
                self.signal(event);
            }
            Call::EnqueueWriteBuffer {
                queue,
                buffer,
                offset,
                size,
                data,
                wait_list,
                event,
                ..
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                let bytes = content.get(data)?;
                let len = (*size as usize).min(bytes.len());
                self.write_view(name, *buffer, *offset, &bytes[..len])?;
                self.signal(event);
            }
            Call::EnqueueCopyBuffer {
                queue,
                src,
                dst,
                src_offset,
                dst_offset,
                size,
                wait_list,
                event,
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                let bytes = self.read_view(name, *src, *src_offset, *size)?;
                self.write_view(name, *dst, *dst_offset, &bytes)?;
                self.signal(event);
            }
            Call::EnqueueMapBuffer {
                queue,
                buffer,
                map_flags,
                offset,
                size,
                wait_list,
                event,
                mapped_ptr,
                ..
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                let bytes = self.read_view(name, *buffer, *offset, *size)?;
                let addr = self.new_address(*size);
                self.memory.insert(addr, bytes);
                self.mappings.insert(
                    addr,
                    Mapping {
                        mem: *buffer,
                        offset: *offset,
                        size: *size,
                        write: map_flags
                            .intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE_REGION),
                    },
                );
                *mapped_ptr = addr;
                self.signal(event);
            }
            Call::EnqueueUnmapMemObject {
                queue,
                mem,
                mapped_ptr,
                wait_list,
                event,
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                let mapping = self
                    .mappings
                    .remove(mapped_ptr)
                    .ok_or_else(|| error(name, format!("{:#x} is not mapped", mapped_ptr)))?;
                if mapping.mem != *mem {
                    return Err(error(name, format!("{:#x} does not map mem {}", mapped_ptr, mem)));
                }
                let bytes = self.memory.remove(*mapped_ptr).unwrap_or_default();
                if mapping.write {
                    let len = (mapping.size as usize).min(bytes.len());
                    self.write_view(name, mapping.mem, mapping.offset, &bytes[..len])?;
                }
                self.signal(event);
            }
            Call::SvmAlloc {
                context,
                flags,
                size,
                result,
                ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                let kind = if flags.contains(SvmFlags::FINE_GRAIN_BUFFER) {
                    AllocKind::SvmFineGrain
                } else {
                    AllocKind::SvmCoarseGrain
                };
                *result = self.allocate(name, kind, *size)?;
            }
            Call::UsmAlloc {
                kind,
                context,
                device,
                size,
                result,
                ..
            } => {
                self.check(name, HandleKind::Context, *context)?;
                if !device.is_null() {
                    self.check(name, HandleKind::Device, *device)?;
                }
                *result = self.allocate(name, *kind, *size)?;
            }
            Call::SvmFree { context, ptr } | Call::UsmFree { context, ptr } => {
                self.check(name, HandleKind::Context, *context)?;
                self.free(name, *ptr)?;
            }
            Call::EnqueueSvmMemcpy {
                queue,
                dst,
                src,
                size,
                src_data,
                wait_list,
                event,
                ..
            }
            | Call::EnqueueUsmMemcpy {
                queue,
                dst,
                src,
                size,
                src_data,
                wait_list,
                event,
                ..
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                self.memcpy(name, *dst, *src, *size, src_data, content)?;
                self.signal(event);
            }
            Call::EnqueueSvmMemFill {
                queue,
                ptr,
                pattern,
                size,
                wait_list,
                event,
            }
            | Call::EnqueueUsmMemFill {
                queue,
                ptr,
                pattern,
                size,
                wait_list,
                event,
            } => {
                self.check(name, HandleKind::Queue, *queue)?;
                self.check_all(name, HandleKind::Event, wait_list)?;
                if pattern.is_empty() {
                    return Err(error(name, "empty fill pattern"));
                }
                let target = self
                    .memory
                    .slice_mut(*ptr, *size)
                    .ok_or_else(|| error(name, format!("{:#x}+{} not accessible", ptr, size)))?;
                for (byte, value) in target.iter_mut().zip(pattern.iter().cycle()) {
                    *byte = *value;
                }
                self.signal(event);
            }
            Call::CreateUserEvent { context, result } => {
                self.check(name, HandleKind::Context, *context)?;
                *result = self.new_handle(HandleKind::Event);
            }
            Call::SetUserEventStatus { event, .. } => {
                self.check(name, HandleKind::Event, *event)?;
            }
            Call::WaitForEvents { events } => {
                self.check_all(name, HandleKind::Event, events)?;
            }
            Call::Finish { queue } => self.check(name, HandleKind::Queue, *queue)?,
            Call::Retain { kind, handle } => {
                self.check(name, *kind, *handle)?;
                if let Some(object) = self.objects.get_mut(handle) {
                    if !matches!(kind, HandleKind::Platform | HandleKind::Device) {
                        object.refcount += 1;
                    }
                }
            }
            Call::Release { kind, handle } => self.release_object(name, *kind, *handle)?,
            Call::GetExtensionFunctionAddress {
                platform,
                name: function,
            } => {
                self.check(name, HandleKind::Platform, *platform)?;
                if !EXTENSION_SUFFIXES.iter().any(|s| function.ends_with(s)) {
                    return Err(error(name, format!("no extension function {}", function)));
                }
            }
            Call::SetThread { .. }
            | Call::UpdateAllocation { .. }
            | Call::UpdateBuffer { .. }
            | Call::UpdateMappedRegion { .. }
            | Call::RegisterIndirectPointers { .. } => {
                return Err(error(name, "engine records are not runtime calls"));
            }
        }
        self.ops.push(SimOp::Call(call.clone()));
        Ok(())
    }

    fn read_memory(&mut self, ptr: Address, len: u64) -> Result<Vec<u8>> {
        let bytes = self
            .memory
            .slice(ptr, len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| error("read_memory", format!("{:#x}+{} not accessible", ptr, len)))?;
        self.ops.push(SimOp::ReadMemory { ptr, len });
        Ok(bytes)
    }

    fn write_memory(&mut self, ptr: Address, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        let target = self
            .memory
            .slice_mut(ptr, len)
            .ok_or_else(|| error("write_memory", format!("{:#x}+{} not accessible", ptr, len)))?;
        target.copy_from_slice(bytes);
        self.note_host_write(ptr, len);
        self.ops.push(SimOp::WriteMemory { ptr, len });
        Ok(())
    }

    fn read_buffer(&mut self, mem: Handle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.read_view("read_buffer", mem, offset, len)?;
        self.ops.push(SimOp::ReadBuffer { mem, offset, len });
        Ok(bytes)
    }

    fn write_buffer(&mut self, mem: Handle, offset: u64, bytes: &[u8]) -> Result<()> {
        self.write_view("write_buffer", mem, offset, bytes)?;
        self.ops.push(SimOp::WriteBuffer {
            mem,
            offset,
            len: bytes.len() as u64,
        });
        Ok(())
    }

    fn protect_pages(&mut self, ptr: Address, len: u64, page_size: u64) -> bool {
        let host_resident = self
            .allocations
            .get(&ptr)
            .is_some_and(|kind| kind.is_host_resident());
        if !self.config.sniff_host_writes || !host_resident || page_size == 0 {
            return false;
        }
        self.protected.insert(
            ptr,
            Protection {
                len,
                page_size,
                written: BTreeSet::new(),
            },
        );
        true
    }

    fn written_pages(&mut self, ptr: Address, _len: u64, _page_size: u64) -> Result<Vec<u64>> {
        self.protected
            .get(&ptr)
            .map(|protection| protection.written.iter().copied().collect())
            .ok_or_else(|| error("written_pages", format!("{:#x} is not protected", ptr)))
    }

    fn unprotect_pages(&mut self, ptr: Address) {
        self.protected.remove(&ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_shared::MemFlags;

    #[test]
    fn test_handles_start_at_base() {
        let mut sim = SimRuntime::new(SimConfig {
            handle_base: 0x5000,
            ..SimConfig::default()
        });
        let session = sim.bootstrap().unwrap();
        assert_eq!(session.platform, Handle(0x5000));
        assert_eq!(session.device, Handle(0x5010));
        assert_eq!(sim.live_objects(), 2);
    }

    #[test]
    fn test_sub_buffer_shares_parent_storage() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let mut store = MemoryStore::new();
        let data = store.put(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut parent = Call::CreateBuffer {
            context: session.context,
            flags: MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
            size: 8,
            data: Some(data),
            result: Handle::NULL,
        };
        sim.dispatch(&mut parent, &store).unwrap();
        let parent = parent.outputs()[0].1;
        let mut sub = Call::CreateSubBuffer {
            parent,
            flags: MemFlags::READ_WRITE,
            origin: 4,
            size: 4,
            result: Handle::NULL,
        };
        sim.issue(&mut sub).unwrap();
        let sub = sub.outputs()[0].1;

        sim.write_buffer(sub, 0, &[9, 9]).unwrap();
        assert_eq!(
            sim.read_buffer(parent, 0, 8).unwrap(),
            vec![1, 2, 3, 4, 9, 9, 7, 8]
        );
    }

    #[test]
    fn test_sub_buffer_keeps_parent_alive() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let mut parent = Call::CreateBuffer {
            context: session.context,
            flags: MemFlags::READ_WRITE,
            size: 8,
            data: None,
            result: Handle::NULL,
        };
        sim.issue(&mut parent).unwrap();
        let parent = parent.outputs()[0].1;
        let mut sub = Call::CreateSubBuffer {
            parent,
            flags: MemFlags::READ_WRITE,
            origin: 0,
            size: 4,
            result: Handle::NULL,
        };
        sim.issue(&mut sub).unwrap();
        let sub = sub.outputs()[0].1;
        let live = sim.live_objects();

        sim.issue(&mut Call::Release {
            kind: HandleKind::Mem,
            handle: parent,
        })
        .unwrap();
        assert_eq!(sim.live_objects(), live);
        assert!(sim.read_buffer(parent, 0, 8).is_ok());

        sim.issue(&mut Call::Release {
            kind: HandleKind::Mem,
            handle: sub,
        })
        .unwrap();
        assert_eq!(sim.live_objects(), live - 2);
    }

    #[test]
    fn test_map_write_unmap() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let mut buffer = Call::CreateBuffer {
            context: session.context,
            flags: MemFlags::READ_WRITE,
            size: 16,
            data: None,
            result: Handle::NULL,
        };
        sim.issue(&mut buffer).unwrap();
        let buffer = buffer.outputs()[0].1;
        let mut map = Call::EnqueueMapBuffer {
            queue: session.queue,
            buffer,
            blocking: true,
            map_flags: MapFlags::WRITE,
            offset: 8,
            size: 8,
            wait_list: vec![],
            event: None,
            mapped_ptr: 0,
        };
        sim.issue(&mut map).unwrap();
        let Call::EnqueueMapBuffer { mapped_ptr, .. } = map else {
            unreachable!()
        };
        sim.write_memory(mapped_ptr, &[7; 8]).unwrap();
        sim.issue(&mut Call::EnqueueUnmapMemObject {
            queue: session.queue,
            mem: buffer,
            mapped_ptr,
            wait_list: vec![],
            event: None,
        })
        .unwrap();
        assert_eq!(sim.read_buffer(buffer, 8, 8).unwrap(), vec![7; 8]);
        assert!(sim.read_memory(mapped_ptr, 1).is_err());
    }

    #[test]
    fn test_kernel_hook_sees_pointer_args() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let mut alloc = Call::UsmAlloc {
            kind: AllocKind::UsmShared,
            context: session.context,
            device: session.device,
            properties: vec![],
            size: 64,
            alignment: 0,
            result: 0,
        };
        sim.issue(&mut alloc).unwrap();
        let ptr = alloc.allocation_result().unwrap().1;

        let mut store = MemoryStore::new();
        let source = store.put(b"kernel void fill() {}").unwrap();
        let mut program = Call::CreateProgramWithSource {
            context: session.context,
            sources: vec![source],
            result: Handle::NULL,
        };
        sim.dispatch(&mut program, &store).unwrap();
        let mut kernel = Call::CreateKernel {
            program: program.outputs()[0].1,
            name: "fill".into(),
            result: Handle::NULL,
        };
        sim.issue(&mut kernel).unwrap();
        let kernel = kernel.outputs()[0].1;

        sim.on_kernel(
            "fill",
            Box::new(|memory, args| {
                if let Some(target) = memory.slice_mut(args[0], 4) {
                    target.copy_from_slice(&[0xAB; 4]);
                }
            }),
        );
        sim.issue(&mut Call::SetKernelArgMemPointer {
            kernel,
            index: 0,
            ptr: ptr + 8,
        })
        .unwrap();
        sim.issue(&mut Call::EnqueueNdRangeKernel {
            queue: session.queue,
            kernel,
            work_dim: 1,
            global_offset: vec![0],
            global_size: vec![1],
            local_size: vec![],
            wait_list: vec![],
            event: None,
        })
        .unwrap();
        assert_eq!(sim.read_memory(ptr + 8, 4).unwrap(), vec![0xAB; 4]);
    }

    #[test]
    fn test_only_host_writes_reach_protected_pages() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let mut alloc = |kind| {
            let mut call = Call::UsmAlloc {
                kind,
                context: session.context,
                device: session.device,
                properties: vec![],
                size: 256,
                alignment: 0,
                result: 0,
            };
            sim.issue(&mut call).unwrap();
            call.allocation_result().unwrap().1
        };
        let shared = alloc(AllocKind::UsmShared);
        let device = alloc(AllocKind::UsmDevice);
        assert!(!sim.protect_pages(device, 256, 64));
        assert!(sim.protect_pages(shared, 256, 64));

        // The fill runs on the device and does not fault
        sim.issue(&mut Call::EnqueueUsmMemFill {
            queue: session.queue,
            ptr: shared,
            pattern: vec![1],
            size: 256,
            wait_list: vec![],
            event: None,
        })
        .unwrap();
        assert!(sim.written_pages(shared, 256, 64).unwrap().is_empty());

        sim.write_memory(shared + 60, &[0; 8]).unwrap();
        sim.write_memory(shared + 200, &[0]).unwrap();
        assert_eq!(sim.written_pages(shared, 256, 64).unwrap(), vec![0, 1, 3]);

        assert!(sim.protect_pages(shared, 256, 64));
        assert!(sim.written_pages(shared, 256, 64).unwrap().is_empty());
        sim.unprotect_pages(shared);
        assert!(!sim.is_protected(shared));
    }

    #[test]
    fn test_release_unknown_fails() {
        let mut sim = SimRuntime::default();
        let err = sim
            .issue(&mut Call::Release {
                kind: HandleKind::Mem,
                handle: Handle(0x42),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }));
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        let mut sim = SimRuntime::default();
        let session = sim.bootstrap().unwrap();
        let err = sim
            .issue(&mut Call::UsmAlloc {
                kind: AllocKind::UsmHost,
                context: session.context,
                device: Handle::NULL,
                properties: vec![],
                size: 0,
                alignment: 0,
                result: 0,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));
    }
}
