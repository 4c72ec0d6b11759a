//! Subcapture Reconstructor
//!
//! Turns a live [`StateStore`] into the ordered list of calls that recreates
//! it, so a trace can start at an arbitrary point. Later kinds reference
//! earlier ones, hence the fixed pass order:
//!
//! platforms, devices, contexts, queues, memory objects, samplers, SVM
//! allocations, mapped regions, programs, USM allocations, kernels, events.
//!
//! Objects the application already released but that are still held by a
//! dependent (a sub-buffer's parent, a program with live kernels) are
//! recreated and released again once their dependents exist. Every
//! reconstructed object is marked restored so a second pass emits nothing.
//! [`teardown`] mirrors the construction in reverse.

use crate::error::{EngineError, Result};
use crate::kernel_args::{IndirectPointerTable, KernelArgTable};
use crate::runtime::Runtime;
use crate::state::{
    AllocationState, MemShape, MemState, ObjectInfo, ObjectState, ProgramSource, StateStore,
};
use retrace_shared::{
    Address, AllocFamily, ArgValue, Call, ContentStore, Handle, HandleKind, MemFlags, SvmFlags,
    EVENT_COMPLETE,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

fn failure(object: impl Into<String>, reason: impl ToString) -> EngineError {
    EngineError::ReconstructionFailure {
        object: object.into(),
        reason: reason.to_string(),
    }
}

struct Reconstructor<'a> {
    state: &'a mut StateStore,
    args: &'a KernelArgTable,
    indirect: &'a IndirectPointerTable,
    runtime: &'a mut dyn Runtime,
    content: &'a mut dyn ContentStore,
    calls: Vec<Call>,
}

/// Synthesize the calls that recreate every live object in `state`.
///
/// Object contents are read back through `runtime` and stored in `content`.
/// Kernel bindings stay in `args`, later launches still consult them.
pub fn reconstruct_from(
    state: &mut StateStore,
    args: &KernelArgTable,
    indirect: &IndirectPointerTable,
    runtime: &mut dyn Runtime,
    content: &mut dyn ContentStore,
) -> Result<Vec<Call>> {
    let mut reconstructor = Reconstructor {
        state,
        args,
        indirect,
        runtime,
        content,
        calls: Vec::new(),
    };
    reconstructor.run()?;
    info!("reconstructed state in {} calls", reconstructor.calls.len());
    Ok(reconstructor.calls)
}

/// Owned snapshot of the not-yet-restored objects of one kind
fn pending(state: &StateStore, kind: HandleKind) -> Vec<(Handle, ObjectState)> {
    state
        .objects_of(kind)
        .into_iter()
        .filter(|(_, object)| !object.restored)
        .map(|(handle, object)| (handle, object.clone()))
        .collect()
}

fn pending_allocations(state: &StateStore, family: AllocFamily) -> Vec<(Address, AllocationState)> {
    state
        .allocations()
        .into_iter()
        .filter(|(_, alloc)| !alloc.restored && alloc.kind.family() == family)
        .map(|(base, alloc)| (base, alloc.clone()))
        .collect()
}

impl Reconstructor<'_> {
    fn run(&mut self) -> Result<()> {
        self.platforms()?;
        self.devices()?;
        self.contexts()?;
        self.queues()?;
        self.memory_objects()?;
        self.samplers()?;
        let mut deferred = self.allocations(AllocFamily::Svm)?;
        self.mappings()?;
        let zombie_programs = self.programs()?;
        deferred.extend(self.allocations(AllocFamily::Usm)?);
        self.pointer_holding_contents(deferred)?;
        self.kernels()?;
        for program in zombie_programs {
            self.push(Call::Release {
                kind: HandleKind::Program,
                handle: program,
            });
        }
        self.events()
    }

    fn push(&mut self, call: Call) {
        debug!("reconstruct {}", call.name());
        self.calls.push(call);
    }

    /// Bring the reference count from 1 up to `refcount`
    fn retains(&mut self, kind: HandleKind, handle: Handle, refcount: u32) {
        for _ in 1..refcount {
            self.push(Call::Retain { kind, handle });
        }
    }

    fn finish(&mut self, kind: HandleKind, handle: Handle, object: &ObjectState) -> Result<()> {
        self.retains(kind, handle, object.refcount);
        self.state.mark_restored(kind, handle)?;
        Ok(())
    }

    fn require_restored(&self, kind: HandleKind, handle: Handle, by: &str) -> Result<()> {
        match self.state.get(kind, handle) {
            Ok(object) if object.restored => Ok(()),
            Ok(_) => Err(failure(by, format!("{} {} is not restored", kind, handle))),
            Err(_) => Err(failure(by, format!("{} {} no longer exists", kind, handle))),
        }
    }

    fn platforms(&mut self) -> Result<()> {
        let platforms: Vec<Handle> = pending(self.state, HandleKind::Platform)
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        if platforms.is_empty() {
            return Ok(());
        }
        for platform in &platforms {
            self.state.mark_restored(HandleKind::Platform, *platform)?;
        }
        self.push(Call::GetPlatformIds { platforms });
        Ok(())
    }

    fn devices(&mut self) -> Result<()> {
        // One enumeration per (platform, device type), in first-seen order
        let mut groups: Vec<((Handle, u64), Vec<Handle>)> = Vec::new();
        for (device, object) in pending(self.state, HandleKind::Device) {
            let ObjectInfo::Device {
                platform,
                device_type,
            } = object.info
            else {
                continue;
            };
            match groups.iter_mut().find(|(key, _)| *key == (platform, device_type)) {
                Some((_, devices)) => devices.push(device),
                None => groups.push(((platform, device_type), vec![device])),
            }
        }
        for ((platform, device_type), devices) in groups {
            for device in &devices {
                self.state.mark_restored(HandleKind::Device, *device)?;
            }
            self.push(Call::GetDeviceIds {
                platform,
                device_type,
                devices,
            });
        }
        Ok(())
    }

    fn contexts(&mut self) -> Result<()> {
        for (handle, object) in pending(self.state, HandleKind::Context) {
            if let ObjectInfo::Context {
                devices,
                properties,
            } = &object.info
            {
                self.push(Call::CreateContext {
                    devices: devices.clone(),
                    properties: properties.clone(),
                    result: handle,
                });
                self.finish(HandleKind::Context, handle, &object)?;
            }
        }
        Ok(())
    }

    fn queues(&mut self) -> Result<()> {
        for (handle, object) in pending(self.state, HandleKind::Queue) {
            if let ObjectInfo::Queue {
                context,
                device,
                properties,
            } = object.info
            {
                self.push(Call::CreateCommandQueue {
                    context,
                    device,
                    properties,
                    result: handle,
                });
                self.finish(HandleKind::Queue, handle, &object)?;
            }
        }
        Ok(())
    }

    fn memory_objects(&mut self) -> Result<()> {
        let mut zombies = Vec::new();
        // Creation order puts parents before sub-buffers and images made from them
        for (handle, object) in pending(self.state, HandleKind::Mem) {
            let ObjectInfo::Mem(mem) = &object.info else {
                continue;
            };
            let label = format!("mem {}", handle);
            // Host pointers of the recording are gone; contents travel as initial data
            let flags = mem.flags - MemFlags::USE_HOST_PTR - MemFlags::COPY_HOST_PTR;
            match &mem.shape {
                MemShape::Buffer => {
                    let data = self.read_buffer(handle, mem, &label)?;
                    self.push(Call::CreateBuffer {
                        context: mem.context,
                        flags: flags | MemFlags::COPY_HOST_PTR,
                        size: mem.size,
                        data: Some(data),
                        result: handle,
                    });
                }
                MemShape::SubBuffer { parent, origin } => {
                    self.require_restored(HandleKind::Mem, *parent, &label)?;
                    self.push(Call::CreateSubBuffer {
                        parent: *parent,
                        flags,
                        origin: *origin,
                        size: mem.size,
                        result: handle,
                    });
                }
                MemShape::Image { format, desc } => {
                    if !desc.buffer.is_null() {
                        self.require_restored(HandleKind::Mem, desc.buffer, &label)?;
                    }
                    self.push(Call::CreateImage {
                        context: mem.context,
                        flags,
                        format: *format,
                        desc: desc.clone(),
                        data: None,
                        result: handle,
                    });
                    if desc.buffer.is_null() {
                        let data = self.read_buffer(handle, mem, &label)?;
                        self.push(Call::UpdateBuffer {
                            buffer: handle,
                            offset: 0,
                            length: mem.size,
                            content: data,
                        });
                    }
                }
            }
            if object.refcount == 0 {
                zombies.push(handle);
            }
            self.finish(HandleKind::Mem, handle, &object)?;
        }
        for handle in zombies {
            self.push(Call::Release {
                kind: HandleKind::Mem,
                handle,
            });
        }
        Ok(())
    }

    fn read_buffer(
        &mut self,
        handle: Handle,
        mem: &MemState,
        label: &str,
    ) -> Result<retrace_shared::ContentRef> {
        let bytes = self
            .runtime
            .read_buffer(handle, 0, mem.size)
            .map_err(|e| failure(label, e))?;
        Ok(self.content.put(&bytes)?)
    }

    fn samplers(&mut self) -> Result<()> {
        for (handle, object) in pending(self.state, HandleKind::Sampler) {
            if let ObjectInfo::Sampler {
                context,
                normalized_coords,
                addressing_mode,
                filter_mode,
            } = object.info
            {
                self.push(Call::CreateSampler {
                    context,
                    normalized_coords,
                    addressing_mode,
                    filter_mode,
                    result: handle,
                });
                self.finish(HandleKind::Sampler, handle, &object)?;
            }
        }
        Ok(())
    }

    /// Recreate allocations of one family. Contents of allocations that
    /// hold pointers are returned for later, once every allocation exists.
    fn allocations(&mut self, family: AllocFamily) -> Result<Vec<(Address, u64)>> {
        let mut deferred = Vec::new();
        for (base, alloc) in pending_allocations(self.state, family) {
            self.push(match family {
                AllocFamily::Svm => Call::SvmAlloc {
                    context: alloc.context,
                    flags: alloc.svm_flags.unwrap_or(SvmFlags::READ_WRITE),
                    size: alloc.size,
                    alignment: alloc.alignment,
                    result: base,
                },
                AllocFamily::Usm => Call::UsmAlloc {
                    kind: alloc.kind,
                    context: alloc.context,
                    device: alloc.device,
                    properties: alloc.properties.clone(),
                    size: alloc.size,
                    alignment: alloc.alignment,
                    result: base,
                },
            });
            if self.indirect.has_offsets(base) {
                deferred.push((base, alloc.size));
            } else {
                self.allocation_contents(base, alloc.size)?;
            }
            self.state.allocation_mut(base)?.restored = true;
        }
        Ok(deferred)
    }

    fn allocation_contents(&mut self, base: Address, size: u64) -> Result<()> {
        let bytes = self
            .runtime
            .read_memory(base, size)
            .map_err(|e| failure(format!("allocation {:#x}", base), e))?;
        let content = self.content.put(&bytes)?;
        self.push(Call::UpdateAllocation {
            ptr: base,
            offset: 0,
            length: size,
            content,
        });
        Ok(())
    }

    fn pointer_holding_contents(&mut self, deferred: Vec<(Address, u64)>) -> Result<()> {
        for (base, size) in deferred {
            self.push(Call::RegisterIndirectPointers {
                ptr: base,
                offsets: self.indirect.offsets(base),
            });
            self.allocation_contents(base, size)?;
        }
        Ok(())
    }

    fn mappings(&mut self) -> Result<()> {
        let snapshots: Vec<_> = self
            .state
            .mappings()
            .into_iter()
            .filter(|snapshot| !snapshot.restored)
            .cloned()
            .collect();
        for snapshot in snapshots {
            let label = format!("mapping {:#x}", snapshot.mapped_ptr);
            self.require_restored(HandleKind::Mem, snapshot.mem, &label)?;
            self.push(Call::EnqueueMapBuffer {
                queue: snapshot.queue,
                buffer: snapshot.mem,
                blocking: true,
                map_flags: snapshot.map_flags,
                offset: snapshot.offset,
                size: snapshot.size,
                wait_list: Vec::new(),
                event: None,
                mapped_ptr: snapshot.mapped_ptr,
            });
            let bytes = self
                .runtime
                .read_memory(snapshot.mapped_ptr, snapshot.size)
                .map_err(|e| failure(label, e))?;
            let content = self.content.put(&bytes)?;
            self.push(Call::UpdateMappedRegion {
                mapped_ptr: snapshot.mapped_ptr,
                length: snapshot.size,
                content,
            });
            if let Some(live) = self
                .state
                .mappings_mut()
                .find(|s| s.creation_index == snapshot.creation_index)
            {
                live.restored = true;
            }
        }
        Ok(())
    }

    /// Returns programs the application already released
    fn programs(&mut self) -> Result<Vec<Handle>> {
        let mut zombies = Vec::new();
        for (handle, object) in pending(self.state, HandleKind::Program) {
            let ObjectInfo::Program(program) = &object.info else {
                continue;
            };
            let label = format!("program {}", handle);
            let mut devices: Vec<Handle> = match &program.source {
                ProgramSource::Source(_) => Vec::new(),
                ProgramSource::Binary { devices, .. } => devices.clone(),
            };
            if let Some(build) = &program.build {
                devices.extend(&build.devices);
            }
            for device in devices {
                self.require_restored(HandleKind::Device, device, &label)?;
            }

            self.push(match &program.source {
                ProgramSource::Source(sources) => Call::CreateProgramWithSource {
                    context: program.context,
                    sources: sources.clone(),
                    result: handle,
                },
                ProgramSource::Binary { devices, binaries } => Call::CreateProgramWithBinary {
                    context: program.context,
                    devices: devices.clone(),
                    binaries: binaries.clone(),
                    result: handle,
                },
            });
            if let Some(build) = &program.build {
                self.push(Call::BuildProgram {
                    program: handle,
                    devices: build.devices.clone(),
                    options: build.options.clone(),
                });
            }
            if object.refcount == 0 {
                zombies.push(handle);
            }
            self.finish(HandleKind::Program, handle, &object)?;
        }
        Ok(zombies)
    }

    fn kernels(&mut self) -> Result<()> {
        for (handle, object) in pending(self.state, HandleKind::Kernel) {
            let ObjectInfo::Kernel { program, name } = &object.info else {
                continue;
            };
            self.require_restored(HandleKind::Program, *program, &format!("kernel {}", handle))?;
            self.push(Call::CreateKernel {
                program: *program,
                name: name.clone(),
                result: handle,
            });
            for call in self.args.rebind_calls(handle) {
                if let Some((kind, bound)) = released_binding(self.state, &call) {
                    warn!("kernel {}: skipping binding of destroyed {:?} {}", handle, kind, bound);
                    continue;
                }
                self.push(call);
            }
            self.finish(HandleKind::Kernel, handle, &object)?;
        }
        Ok(())
    }

    fn events(&mut self) -> Result<()> {
        for (handle, object) in pending(self.state, HandleKind::Event) {
            let ObjectInfo::Event {
                context,
                user,
                status,
            } = object.info
            else {
                continue;
            };
            self.push(Call::CreateUserEvent {
                context,
                result: handle,
            });
            // Pending user events stay pending; the application signals them later
            let status = if user { status } else { Some(EVENT_COMPLETE) };
            if let Some(status) = status {
                self.push(Call::SetUserEventStatus {
                    event: handle,
                    status,
                });
            }
            self.finish(HandleKind::Event, handle, &object)?;
        }
        Ok(())
    }
}

/// Object a rebinding call names that is no longer in `state`
fn released_binding(state: &StateStore, call: &Call) -> Option<(HandleKind, Handle)> {
    let bound = match call {
        Call::SetKernelArg {
            value: ArgValue::Mem(mem),
            ..
        } => (HandleKind::Mem, *mem),
        Call::SetKernelArg {
            value: ArgValue::Sampler(sampler),
            ..
        } => (HandleKind::Sampler, *sampler),
        _ => return None,
    };
    (!state.contains(bound.0, bound.1)).then_some(bound)
}

/// Calls releasing every restored object, in reverse construction order.
///
/// An object with reference count N gets N releases; objects kept alive only
/// by dependents get none and go away with their last dependent.
pub fn teardown(state: &StateStore) -> Vec<Call> {
    let mut calls = Vec::new();

    let release_kind = |calls: &mut Vec<Call>, kind: HandleKind| {
        for (handle, object) in state.objects_of(kind).into_iter().rev() {
            if !object.restored {
                continue;
            }
            for _ in 0..object.refcount {
                calls.push(Call::Release { kind, handle });
            }
        }
    };
    let free_family = |calls: &mut Vec<Call>, family: AllocFamily| {
        for (ptr, alloc) in state.allocations().into_iter().rev() {
            if !alloc.restored || alloc.kind.family() != family {
                continue;
            }
            calls.push(match family {
                AllocFamily::Svm => Call::SvmFree {
                    context: alloc.context,
                    ptr,
                },
                AllocFamily::Usm => Call::UsmFree {
                    context: alloc.context,
                    ptr,
                },
            });
        }
    };

    release_kind(&mut calls, HandleKind::Event);
    release_kind(&mut calls, HandleKind::Kernel);
    free_family(&mut calls, AllocFamily::Usm);
    release_kind(&mut calls, HandleKind::Program);
    for snapshot in state.mappings().into_iter().rev() {
        if snapshot.restored {
            calls.push(Call::EnqueueUnmapMemObject {
                queue: snapshot.queue,
                mem: snapshot.mem,
                mapped_ptr: snapshot.mapped_ptr,
                wait_list: Vec::new(),
                event: None,
            });
        }
    }
    free_family(&mut calls, AllocFamily::Svm);
    release_kind(&mut calls, HandleKind::Sampler);
    release_kind(&mut calls, HandleKind::Mem);
    release_kind(&mut calls, HandleKind::Queue);
    release_kind(&mut calls, HandleKind::Context);

    let mut summary: BTreeMap<&'static str, usize> = BTreeMap::new();
    for call in &calls {
        *summary.entry(call.name()).or_default() += 1;
    }
    debug!("teardown: {:?}", summary);
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimRuntime, SimSession};
    use retrace_shared::store::MemoryStore;
    use retrace_shared::{AllocKind, ArgValue, ExecInfo, IndirectAccess, MapFlags};

    /// Issue `call` against the simulator and mirror it in `state`
    fn run(sim: &mut SimRuntime, state: &mut StateStore, store: &MemoryStore, mut call: Call) -> Call {
        sim.dispatch(&mut call, store).unwrap();
        state.apply(&call).unwrap();
        call
    }

    fn setup() -> (SimRuntime, StateStore, MemoryStore, SimSession) {
        let mut sim = SimRuntime::default();
        let mut state = StateStore::new();
        let store = MemoryStore::new();
        let session = sim.bootstrap().unwrap();
        for call in sim.calls().cloned().collect::<Vec<_>>() {
            state.apply(&call).unwrap();
        }
        (sim, state, store, session)
    }

    fn names(calls: &[Call]) -> Vec<&'static str> {
        calls.iter().map(Call::name).collect()
    }

    #[test]
    fn test_fixed_pass_order() {
        let (mut sim, mut state, mut store, session) = setup();
        let source = store.put(b"kernel void k(global int *p) {}").unwrap();
        let buffer = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateBuffer {
                context: session.context,
                flags: MemFlags::READ_WRITE,
                size: 32,
                data: None,
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let usm = run(
            &mut sim,
            &mut state,
            &store,
            Call::UsmAlloc {
                kind: AllocKind::UsmDevice,
                context: session.context,
                device: session.device,
                properties: vec![],
                size: 256,
                alignment: 0,
                result: 0,
            },
        )
        .allocation_result()
        .unwrap()
        .1;
        let program = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateProgramWithSource {
                context: session.context,
                sources: vec![source],
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        run(
            &mut sim,
            &mut state,
            &store,
            Call::BuildProgram {
                program,
                devices: vec![session.device],
                options: "-O2".into(),
            },
        );
        let kernel = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateKernel {
                program,
                name: "k".into(),
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let mut args = KernelArgTable::new();
        let regions = {
            let mut regions = crate::regions::RegionIndex::new();
            regions.register(usm, 256, AllocKind::UsmDevice).unwrap();
            regions
        };
        for call in [
            Call::SetKernelArg {
                kernel,
                index: 0,
                size: 8,
                value: ArgValue::Mem(buffer),
            },
            Call::SetKernelExecInfo {
                kernel,
                info: ExecInfo::IndirectAccess {
                    access: IndirectAccess::DEVICE,
                    enabled: true,
                },
            },
        ] {
            args.record(&run(&mut sim, &mut state, &store, call), &regions);
        }
        state.retain(HandleKind::Mem, buffer).unwrap();

        let calls = reconstruct_from(
            &mut state,
            &args,
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        assert_eq!(
            names(&calls),
            vec![
                "clGetPlatformIDs",
                "clGetDeviceIDs",
                "clCreateContext",
                "clCreateCommandQueue",
                "clCreateBuffer",
                "clRetainMemObject",
                "clCreateProgramWithSource",
                "clBuildProgram",
                "clDeviceMemAllocINTEL",
                "UpdateAllocation",
                "clCreateKernel",
                "clSetKernelArg",
                "clSetKernelExecInfo",
            ]
        );
        assert!(args.get(kernel).is_some());

        // Everything is restored now
        let again = reconstruct_from(
            &mut state,
            &args,
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_binding_of_released_buffer_is_skipped() {
        let (mut sim, mut state, mut store, session) = setup();
        let source = store.put(b"kernel void k(global int *p) {}").unwrap();
        let buffer = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateBuffer {
                context: session.context,
                flags: MemFlags::READ_WRITE,
                size: 16,
                data: None,
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let program = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateProgramWithSource {
                context: session.context,
                sources: vec![source],
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let kernel = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateKernel {
                program,
                name: "k".into(),
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let mut args = KernelArgTable::new();
        let bind = run(
            &mut sim,
            &mut state,
            &store,
            Call::SetKernelArg {
                kernel,
                index: 0,
                size: 8,
                value: ArgValue::Mem(buffer),
            },
        );
        args.record(&bind, &crate::regions::RegionIndex::new());
        run(
            &mut sim,
            &mut state,
            &store,
            Call::Release {
                kind: HandleKind::Mem,
                handle: buffer,
            },
        );

        let calls = reconstruct_from(
            &mut state,
            &args,
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        assert!(!names(&calls).contains(&"clCreateBuffer"));
        assert!(names(&calls).contains(&"clCreateKernel"));
        assert!(!names(&calls).contains(&"clSetKernelArg"));
    }

    #[test]
    fn test_buffer_contents_become_initial_data() {
        let (mut sim, mut state, mut store, session) = setup();
        let buffer = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateBuffer {
                context: session.context,
                flags: MemFlags::READ_WRITE | MemFlags::USE_HOST_PTR,
                size: 4,
                data: None,
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        sim.write_buffer(buffer, 0, &[1, 2, 3, 4]).unwrap();

        let calls = reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        let create = calls
            .iter()
            .find(|c| matches!(c, Call::CreateBuffer { .. }))
            .unwrap();
        match create {
            Call::CreateBuffer { flags, data, .. } => {
                assert!(flags.contains(MemFlags::COPY_HOST_PTR));
                assert!(!flags.contains(MemFlags::USE_HOST_PTR));
                assert_eq!(store.get(data.as_ref().unwrap()).unwrap(), vec![1, 2, 3, 4]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_released_parent_is_recreated_then_released() {
        let (mut sim, mut state, mut store, session) = setup();
        let parent = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateBuffer {
                context: session.context,
                flags: MemFlags::READ_WRITE,
                size: 64,
                data: None,
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateSubBuffer {
                parent,
                flags: MemFlags::READ_WRITE,
                origin: 0,
                size: 32,
                result: Handle::NULL,
            },
        );
        run(
            &mut sim,
            &mut state,
            &store,
            Call::Release {
                kind: HandleKind::Mem,
                handle: parent,
            },
        );

        let calls = reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        let tail: Vec<&str> = names(&calls).into_iter().skip(4).collect();
        assert_eq!(
            tail,
            vec!["clCreateBuffer", "clCreateSubBuffer", "clReleaseMemObject"]
        );

        // The parent goes away with the sub-buffer, never released twice
        let teardown = teardown(&state);
        assert_eq!(
            names(&teardown),
            vec![
                "clReleaseMemObject",
                "clReleaseCommandQueue",
                "clReleaseContext"
            ]
        );
    }

    #[test]
    fn test_teardown_honors_reference_counts() {
        let (mut sim, mut state, mut store, session) = setup();
        state.retain(HandleKind::Context, session.context).unwrap();
        state.retain(HandleKind::Context, session.context).unwrap();
        run(
            &mut sim,
            &mut state,
            &store,
            Call::SvmAlloc {
                context: session.context,
                flags: SvmFlags::READ_WRITE,
                size: 128,
                alignment: 0,
                result: 0,
            },
        );
        reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();

        let calls = teardown(&state);
        assert_eq!(
            names(&calls),
            vec![
                "clSVMFree",
                "clReleaseCommandQueue",
                "clReleaseContext",
                "clReleaseContext",
                "clReleaseContext",
            ]
        );
    }

    #[test]
    fn test_pointer_holding_allocation_written_after_all_allocations() {
        let (mut sim, mut state, mut store, session) = setup();
        let holder = run(
            &mut sim,
            &mut state,
            &store,
            Call::SvmAlloc {
                context: session.context,
                flags: SvmFlags::READ_WRITE,
                size: 16,
                alignment: 0,
                result: 0,
            },
        )
        .allocation_result()
        .unwrap()
        .1;
        let target = run(
            &mut sim,
            &mut state,
            &store,
            Call::UsmAlloc {
                kind: AllocKind::UsmShared,
                context: session.context,
                device: session.device,
                properties: vec![],
                size: 16,
                alignment: 0,
                result: 0,
            },
        )
        .allocation_result()
        .unwrap()
        .1;
        sim.write_memory(holder, &target.to_le_bytes()).unwrap();
        let mut indirect = IndirectPointerTable::new();
        indirect.register_indirect_pointer_offsets(holder, &[0]);

        let calls = reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &indirect,
            &mut sim,
            &mut store,
        )
        .unwrap();
        let tail: Vec<&str> = names(&calls).into_iter().skip(4).collect();
        assert_eq!(
            tail,
            vec![
                "clSVMAlloc",
                "clSharedMemAllocINTEL",
                "UpdateAllocation",
                "RegisterIndirectPointers",
                "UpdateAllocation",
            ]
        );
    }

    #[test]
    fn test_mapped_region_is_remapped_with_contents() {
        let (mut sim, mut state, mut store, session) = setup();
        let buffer = run(
            &mut sim,
            &mut state,
            &store,
            Call::CreateBuffer {
                context: session.context,
                flags: MemFlags::READ_WRITE,
                size: 16,
                data: None,
                result: Handle::NULL,
            },
        )
        .outputs()[0]
            .1;
        let map = run(
            &mut sim,
            &mut state,
            &store,
            Call::EnqueueMapBuffer {
                queue: session.queue,
                buffer,
                blocking: true,
                map_flags: MapFlags::WRITE,
                offset: 0,
                size: 16,
                wait_list: vec![],
                event: None,
                mapped_ptr: 0,
            },
        );
        let Call::EnqueueMapBuffer { mapped_ptr, .. } = map else {
            unreachable!()
        };
        sim.write_memory(mapped_ptr, &[5; 16]).unwrap();

        let calls = reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap();
        match calls.last().unwrap() {
            Call::UpdateMappedRegion {
                mapped_ptr: ptr,
                content,
                ..
            } => {
                assert_eq!(*ptr, mapped_ptr);
                assert_eq!(store.get(content).unwrap(), vec![5; 16]);
            }
            other => panic!("unexpected {:?}", other),
        }
        let teardown = teardown(&state);
        assert_eq!(teardown[0].name(), "clEnqueueUnmapMemObject");
    }

    #[test]
    fn test_program_for_missing_device_fails() {
        let (_, mut state, mut store, session) = setup();
        let binary = store.put(b"\x7fELF").unwrap();
        state
            .apply(&Call::CreateProgramWithBinary {
                context: session.context,
                devices: vec![Handle(0xdead)],
                binaries: vec![binary],
                result: Handle(0x9000),
            })
            .unwrap();
        let mut sim = SimRuntime::default();
        let err = reconstruct_from(
            &mut state,
            &KernelArgTable::new(),
            &IndirectPointerTable::new(),
            &mut sim,
            &mut store,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ReconstructionFailure { .. }));
    }
}
