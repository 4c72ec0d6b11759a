//! Resource State Store
//!
//! One record per live API object, keyed by the handle/pointer of whichever
//! address space the store tracks (the application's during capture, the
//! replay runtime's during replay). Every call that mutates state updates the
//! store synchronously through [`StateStore::apply`] before the next call is
//! looked at.
//!
//! Reference counting distinguishes the application-visible count from
//! references held by dependent objects. A sub-buffer holds its parent, an
//! image created from a buffer holds that buffer and a kernel holds its
//! program. An object is destroyed once both counts reach zero, and its
//! destruction drops the private reference it held, which may destroy the
//! dependency in turn.

pub mod objects;

pub use objects::{
    AllocationState, BuildInfo, MappedSnapshot, MemShape, MemState, ObjectInfo,
    ObjectState, ProgramSource, ProgramState,
};

use crate::error::{EngineError, Result};
use retrace_shared::{Address, AllocKind, ArgValue, Call, Handle, HandleKind, SvmFlags};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Side effects of applying one call
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Applied {
    /// Objects destroyed, in destruction order
    pub destroyed: Vec<(HandleKind, Handle)>,
    /// Allocation removed by a free call
    pub freed: Option<(Address, AllocationState)>,
    /// Snapshot consumed by an unmap call
    pub unmapped: Option<MappedSnapshot>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    objects: HashMap<HandleKind, BTreeMap<Handle, ObjectState>>,
    allocations: BTreeMap<Address, AllocationState>,
    mapped: HashMap<Address, Vec<MappedSnapshot>>,
    next_creation: u64,
}

/// Platforms and root devices are not reference counted by the runtime
fn is_refcounted(kind: HandleKind) -> bool {
    !matches!(kind, HandleKind::Platform | HandleKind::Device)
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&mut self) -> u64 {
        let index = self.next_creation;
        self.next_creation += 1;
        index
    }

    /// Record a newly created object with reference count 1
    pub fn create(&mut self, handle: Handle, info: ObjectInfo) -> Result<()> {
        let kind = info.kind();
        if handle.is_null() {
            return Ok(());
        }
        if !is_refcounted(kind) && self.contains(kind, handle) {
            // Repeated enumeration returns the same platforms/devices
            return Ok(());
        }
        if let Some((dep_kind, dep)) = info.private_retains() {
            let dependency = self.get_mut(dep_kind, dep)?;
            dependency.internal_refs += 1;
        }
        let index = self.next_index();
        let previous = self
            .objects
            .entry(kind)
            .or_default()
            .insert(handle, ObjectState::new(info, index));
        if previous.is_some() {
            warn!("{} {} recreated while still tracked", kind, handle);
        }
        Ok(())
    }

    pub fn contains(&self, kind: HandleKind, handle: Handle) -> bool {
        self.objects
            .get(&kind)
            .is_some_and(|table| table.contains_key(&handle))
    }

    pub fn get(&self, kind: HandleKind, handle: Handle) -> Result<&ObjectState> {
        self.objects
            .get(&kind)
            .and_then(|table| table.get(&handle))
            .ok_or(EngineError::unknown(kind, handle))
    }

    pub fn get_mut(&mut self, kind: HandleKind, handle: Handle) -> Result<&mut ObjectState> {
        self.objects
            .get_mut(&kind)
            .and_then(|table| table.get_mut(&handle))
            .ok_or(EngineError::unknown(kind, handle))
    }

    /// Increment the application reference count; returns the new count
    pub fn retain(&mut self, kind: HandleKind, handle: Handle) -> Result<u32> {
        let state = self.get_mut(kind, handle)?;
        if !is_refcounted(kind) {
            return Ok(state.refcount);
        }
        state.refcount += 1;
        Ok(state.refcount)
    }

    /// Decrement the application reference count, destroying the object
    /// (and whatever it privately retained) when nothing holds it anymore.
    pub fn release(&mut self, kind: HandleKind, handle: Handle) -> Result<Vec<(HandleKind, Handle)>> {
        let state = self.get_mut(kind, handle)?;
        if !is_refcounted(kind) {
            return Ok(Vec::new());
        }
        if state.refcount == 0 {
            // Only dependents keep it alive; the application has no reference to drop
            return Err(EngineError::unknown(kind, handle));
        }
        state.refcount -= 1;
        let mut destroyed = Vec::new();
        self.collect_dead(kind, handle, &mut destroyed);
        Ok(destroyed)
    }

    fn collect_dead(
        &mut self,
        kind: HandleKind,
        handle: Handle,
        destroyed: &mut Vec<(HandleKind, Handle)>,
    ) {
        let dead = self
            .objects
            .get(&kind)
            .and_then(|table| table.get(&handle))
            .is_some_and(ObjectState::is_dead);
        if !dead {
            return;
        }
        let Some(state) = self
            .objects
            .get_mut(&kind)
            .and_then(|table| table.remove(&handle))
        else {
            return;
        };
        debug!("destroyed {} {}", kind, handle);
        destroyed.push((kind, handle));

        if let Some((dep_kind, dep)) = state.info.private_retains() {
            match self.get_mut(dep_kind, dep) {
                Ok(dependency) if dependency.internal_refs > 0 => {
                    dependency.internal_refs -= 1;
                    self.collect_dead(dep_kind, dep, destroyed);
                }
                Ok(_) => warn!(
                    "{} {} held {} {} without a private reference",
                    kind, handle, dep_kind, dep
                ),
                Err(_) => warn!(
                    "{} {} outlived its {} {}",
                    kind, handle, dep_kind, dep
                ),
            }
        }
    }

    /// Set the one-shot restored flag; returns false if it was already set
    pub fn mark_restored(&mut self, kind: HandleKind, handle: Handle) -> Result<bool> {
        let state = self.get_mut(kind, handle)?;
        let first = !state.restored;
        state.restored = true;
        Ok(first)
    }

    /// Objects of one kind in creation order
    pub fn objects_of(&self, kind: HandleKind) -> Vec<(Handle, &ObjectState)> {
        let mut out: Vec<(Handle, &ObjectState)> = self
            .objects
            .get(&kind)
            .map(|table| table.iter().map(|(h, s)| (*h, s)).collect())
            .unwrap_or_default();
        out.sort_by_key(|(_, state)| state.creation_index);
        out
    }

    /// Kernels created from `program`, in creation order
    pub fn kernels_of(&self, program: Handle) -> Vec<Handle> {
        self.objects_of(HandleKind::Kernel)
            .into_iter()
            .filter(|(_, state)| {
                matches!(&state.info, ObjectInfo::Kernel { program: p, .. } if *p == program)
            })
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn count(&self, kind: HandleKind) -> usize {
        self.objects.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn add_allocation(&mut self, base: Address, mut state: AllocationState) {
        state.creation_index = self.next_index();
        if self.allocations.insert(base, state).is_some() {
            warn!("allocation {:#x} recorded twice", base);
        }
    }

    pub fn allocation(&self, base: Address) -> Result<&AllocationState> {
        self.allocations
            .get(&base)
            .ok_or(EngineError::UntrackedPointer { ptr: base })
    }

    pub fn allocation_mut(&mut self, base: Address) -> Result<&mut AllocationState> {
        self.allocations
            .get_mut(&base)
            .ok_or(EngineError::UntrackedPointer { ptr: base })
    }

    pub fn remove_allocation(&mut self, base: Address) -> Result<AllocationState> {
        self.allocations
            .remove(&base)
            .ok_or(EngineError::UntrackedPointer { ptr: base })
    }

    /// Allocations in creation order
    pub fn allocations(&self) -> Vec<(Address, &AllocationState)> {
        let mut out: Vec<(Address, &AllocationState)> =
            self.allocations.iter().map(|(b, s)| (*b, s)).collect();
        out.sort_by_key(|(_, state)| state.creation_index);
        out
    }

    pub fn push_mapping(&mut self, mut snapshot: MappedSnapshot) {
        snapshot.creation_index = self.next_index();
        self.mapped
            .entry(snapshot.mapped_ptr)
            .or_default()
            .push(snapshot);
    }

    /// Most recent snapshot for `ptr`, still mapped
    pub fn mapping_mut(&mut self, ptr: Address) -> Option<&mut MappedSnapshot> {
        self.mapped.get_mut(&ptr).and_then(|stack| stack.last_mut())
    }

    pub fn pop_mapping(&mut self, ptr: Address) -> Option<MappedSnapshot> {
        let stack = self.mapped.get_mut(&ptr)?;
        let snapshot = stack.pop();
        if stack.is_empty() {
            self.mapped.remove(&ptr);
        }
        snapshot
    }

    /// All outstanding snapshots in creation order
    pub fn mappings(&self) -> Vec<&MappedSnapshot> {
        let mut out: Vec<&MappedSnapshot> = self.mapped.values().flatten().collect();
        out.sort_by_key(|snapshot| snapshot.creation_index);
        out
    }

    pub fn mappings_mut(&mut self) -> impl Iterator<Item = &mut MappedSnapshot> + '_ {
        self.mapped.values_mut().flatten()
    }

    /// Context a queue belongs to
    fn queue_context(&self, queue: Handle) -> Result<Handle> {
        match &self.get(HandleKind::Queue, queue)?.info {
            ObjectInfo::Queue { context, .. } => Ok(*context),
            _ => Err(EngineError::unknown(HandleKind::Queue, queue)),
        }
    }

    fn record_event(&mut self, queue: Handle, event: &Option<Handle>) -> Result<()> {
        if let Some(event) = event {
            let context = self.queue_context(queue)?;
            self.create(
                *event,
                ObjectInfo::Event {
                    context,
                    user: false,
                    status: None,
                },
            )?;
        }
        Ok(())
    }

    /// Update the store for a call whose handles/pointers are in this store's namespace
    pub fn apply(&mut self, call: &Call) -> Result<Applied> {
        let mut applied = Applied::default();
        match call {
            Call::GetPlatformIds { platforms } => {
                for platform in platforms {
                    self.create(*platform, ObjectInfo::Platform)?;
                }
            }
            Call::GetDeviceIds {
                platform,
                device_type,
                devices,
            } => {
                for device in devices {
                    self.create(
                        *device,
                        ObjectInfo::Device {
                            platform: *platform,
                            device_type: *device_type,
                        },
                    )?;
                }
            }
            Call::CreateContext {
                devices,
                properties,
                result,
            } => self.create(
                *result,
                ObjectInfo::Context {
                    devices: devices.clone(),
                    properties: properties.clone(),
                },
            )?,
            Call::CreateCommandQueue {
                context,
                device,
                properties,
                result,
            } => self.create(
                *result,
                ObjectInfo::Queue {
                    context: *context,
                    device: *device,
                    properties: *properties,
                },
            )?,
            Call::CreateBuffer {
                context,
                flags,
                size,
                data,
                result,
            } => self.create(
                *result,
                ObjectInfo::Mem(MemState {
                    context: *context,
                    flags: *flags,
                    size: *size,
                    shape: MemShape::Buffer,
                    initial_data: data.clone(),
                }),
            )?,
            Call::CreateSubBuffer {
                parent,
                flags,
                origin,
                size,
                result,
            } => {
                let context = match &self.get(HandleKind::Mem, *parent)?.info {
                    ObjectInfo::Mem(mem) => mem.context,
                    _ => return Err(EngineError::unknown(HandleKind::Mem, *parent)),
                };
                self.create(
                    *result,
                    ObjectInfo::Mem(MemState {
                        context,
                        flags: *flags,
                        size: *size,
                        shape: MemShape::SubBuffer {
                            parent: *parent,
                            origin: *origin,
                        },
                        initial_data: None,
                    }),
                )?
            }
            Call::CreateImage {
                context,
                flags,
                format,
                desc,
                data,
                result,
            } => self.create(
                *result,
                ObjectInfo::Mem(MemState {
                    context: *context,
                    flags: *flags,
                    size: desc.byte_size(format),
                    shape: MemShape::Image {
                        format: *format,
                        desc: desc.clone(),
                    },
                    initial_data: data.clone(),
                }),
            )?,
            Call::CreateSampler {
                context,
                normalized_coords,
                addressing_mode,
                filter_mode,
                result,
            } => self.create(
                *result,
                ObjectInfo::Sampler {
                    context: *context,
                    normalized_coords: *normalized_coords,
                    addressing_mode: *addressing_mode,
                    filter_mode: *filter_mode,
                },
            )?,
            Call::CreateProgramWithSource {
                context,
                sources,
                result,
            } => self.create(
                *result,
                ObjectInfo::Program(ProgramState {
                    context: *context,
                    source: ProgramSource::Source(sources.clone()),
                    build: None,
                }),
            )?,
            Call::CreateProgramWithBinary {
                context,
                devices,
                binaries,
                result,
            } => self.create(
                *result,
                ObjectInfo::Program(ProgramState {
                    context: *context,
                    source: ProgramSource::Binary {
                        devices: devices.clone(),
                        binaries: binaries.clone(),
                    },
                    build: None,
                }),
            )?,
            Call::BuildProgram {
                program,
                devices,
                options,
            } => match &mut self.get_mut(HandleKind::Program, *program)?.info {
                ObjectInfo::Program(state) => {
                    state.build = Some(BuildInfo {
                        devices: devices.clone(),
                        options: options.clone(),
                    })
                }
                _ => return Err(EngineError::unknown(HandleKind::Program, *program)),
            },
            Call::CreateKernel {
                program,
                name,
                result,
            } => self.create(
                *result,
                ObjectInfo::Kernel {
                    program: *program,
                    name: name.clone(),
                },
            )?,
            Call::SetKernelArg { kernel, value, .. } => {
                self.get(HandleKind::Kernel, *kernel)?;
                match value {
                    ArgValue::Mem(mem) if !mem.is_null() => {
                        self.get(HandleKind::Mem, *mem)?;
                    }
                    ArgValue::Sampler(sampler) => {
                        self.get(HandleKind::Sampler, *sampler)?;
                    }
                    _ => {}
                }
            }
            Call::SetKernelArgSvmPointer { kernel, .. }
            | Call::SetKernelArgMemPointer { kernel, .. }
            | Call::SetKernelExecInfo { kernel, .. } => {
                self.get(HandleKind::Kernel, *kernel)?;
            }
            Call::EnqueueNdRangeKernel { queue, event, .. }
            | Call::EnqueueReadBuffer { queue, event, .. }
            | Call::EnqueueWriteBuffer { queue, event, .. }
            | Call::EnqueueCopyBuffer { queue, event, .. }
            | Call::EnqueueSvmMemcpy { queue, event, .. }
            | Call::EnqueueSvmMemFill { queue, event, .. }
            | Call::EnqueueUsmMemcpy { queue, event, .. }
            | Call::EnqueueUsmMemFill { queue, event, .. } => self.record_event(*queue, event)?,
            Call::EnqueueMapBuffer {
                queue,
                buffer,
                map_flags,
                offset,
                size,
                event,
                mapped_ptr,
                ..
            } => {
                self.get(HandleKind::Mem, *buffer)?;
                self.push_mapping(MappedSnapshot {
                    mapped_ptr: *mapped_ptr,
                    mem: *buffer,
                    queue: *queue,
                    map_flags: *map_flags,
                    offset: *offset,
                    size: *size,
                    contents: None,
                    creation_index: 0,
                    restored: false,
                });
                self.record_event(*queue, event)?;
            }
            Call::EnqueueUnmapMemObject {
                queue,
                mapped_ptr,
                event,
                ..
            } => {
                applied.unmapped = self.pop_mapping(*mapped_ptr);
                if applied.unmapped.is_none() {
                    warn!("unmap of {:#x} without a matching map", mapped_ptr);
                }
                self.record_event(*queue, event)?;
            }
            Call::SvmAlloc {
                context,
                flags,
                size,
                alignment,
                result,
            } => {
                let kind = if flags.contains(SvmFlags::FINE_GRAIN_BUFFER) {
                    AllocKind::SvmFineGrain
                } else {
                    AllocKind::SvmCoarseGrain
                };
                self.add_allocation(
                    *result,
                    AllocationState {
                        kind,
                        context: *context,
                        device: Handle::NULL,
                        size: *size,
                        alignment: *alignment,
                        svm_flags: Some(*flags),
                        properties: Vec::new(),
                        creation_index: 0,
                        restored: false,
                    },
                )
            }
            Call::UsmAlloc {
                kind,
                context,
                device,
                properties,
                size,
                alignment,
                result,
            } => self.add_allocation(
                *result,
                AllocationState {
                    kind: *kind,
                    context: *context,
                    device: if *kind == AllocKind::UsmHost {
                        Handle::NULL
                    } else {
                        *device
                    },
                    size: *size,
                    alignment: *alignment,
                    svm_flags: None,
                    properties: properties.clone(),
                    creation_index: 0,
                    restored: false,
                },
            ),
            Call::SvmFree { ptr, .. } | Call::UsmFree { ptr, .. } => {
                let state = self.remove_allocation(*ptr)?;
                applied.freed = Some((*ptr, state));
            }
            Call::CreateUserEvent { context, result } => self.create(
                *result,
                ObjectInfo::Event {
                    context: *context,
                    user: true,
                    status: None,
                },
            )?,
            Call::SetUserEventStatus { event, status } => {
                if let ObjectInfo::Event { status: s, .. } =
                    &mut self.get_mut(HandleKind::Event, *event)?.info
                {
                    *s = Some(*status);
                }
            }
            Call::Retain { kind, handle } => {
                self.retain(*kind, *handle)?;
            }
            Call::Release { kind, handle } => {
                applied.destroyed = self.release(*kind, *handle)?;
            }
            Call::WaitForEvents { .. }
            | Call::Finish { .. }
            | Call::GetExtensionFunctionAddress { .. }
            | Call::SetThread { .. }
            | Call::UpdateAllocation { .. }
            | Call::UpdateBuffer { .. }
            | Call::UpdateMappedRegion { .. }
            | Call::RegisterIndirectPointers { .. } => {}
        }
        Ok(applied)
    }

    /// Live object counts per kind plus allocations and mappings, for summaries
    pub fn summary(&self) -> Vec<(&'static str, usize)> {
        let mut out: Vec<(&'static str, usize)> = HandleKind::ALL
            .iter()
            .map(|kind| (kind.name(), self.count(*kind)))
            .collect();
        out.push(("allocation", self.allocations.len()));
        out.push(("mapping", self.mapped.values().map(Vec::len).sum()));
        out
    }
}
