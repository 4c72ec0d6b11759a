use anyhow::Result;
use retrace_engine::sim::{KernelHook, SimConfig, SimMemory, SimOp, SimRuntime};
use retrace_engine::{EngineConfig, Player, Recorder, Runtime, SubcaptureRange};
use retrace_shared::store::{DirStore, MemoryStore};
use retrace_shared::{
    Address, AllocKind, ArgValue, Call, ContentStore, ExecInfo, Handle, HandleKind,
    IndirectAccess, MemFlags, RecordOrigin, TraceReader, DEVICE_TYPE_ALL,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::sync::{Arc, Mutex};

struct Session {
    context: Handle,
    device: Handle,
    queue: Handle,
    program: Handle,
    kernel: Handle,
}

fn config() -> EngineConfig {
    EngineConfig {
        page_size: 4096,
        verbosity: 2,
        track_device_memory: true,
        fine_grain_svm_always_dirty: true,
        subcapture: None,
    }
}

/// Runtime on the replay side, with handles and addresses unlike the recording
fn replay_sim() -> SimRuntime {
    SimRuntime::new(SimConfig {
        handle_base: 0x40_0000,
        address_base: 0x3000_0000_0000,
        ..SimConfig::default()
    })
}

fn issue(runtime: &mut impl Runtime, blobs: &MemoryStore, mut call: Call) -> Call {
    runtime.dispatch(&mut call, blobs).unwrap();
    call
}

fn output(call: &Call) -> Handle {
    call.outputs()[0].1
}

fn alloc(
    runtime: &mut impl Runtime,
    blobs: &MemoryStore,
    s: &Session,
    kind: AllocKind,
    size: u64,
) -> Address {
    issue(
        runtime,
        blobs,
        Call::UsmAlloc {
            kind,
            context: s.context,
            device: s.device,
            properties: vec![],
            size,
            alignment: 0,
            result: 0,
        },
    )
    .allocation_result()
    .unwrap()
    .1
}

fn launch(s: &Session) -> Call {
    Call::EnqueueNdRangeKernel {
        queue: s.queue,
        kernel: s.kernel,
        work_dim: 1,
        global_offset: vec![],
        global_size: vec![256],
        local_size: vec![],
        wait_list: vec![],
        event: None,
    }
}

/// Platform, device, context, queue and a built program with kernel `k`
fn setup(runtime: &mut impl Runtime, blobs: &mut MemoryStore) -> Session {
    let source = blobs.put(b"kernel void k(global int *a, global int **b) {}").unwrap();
    let platforms = issue(runtime, blobs, Call::GetPlatformIds { platforms: vec![] });
    let devices = issue(
        runtime,
        blobs,
        Call::GetDeviceIds {
            platform: output(&platforms),
            device_type: DEVICE_TYPE_ALL,
            devices: vec![],
        },
    );
    let device = output(&devices);
    let context = output(&issue(
        runtime,
        blobs,
        Call::CreateContext {
            devices: vec![device],
            properties: vec![],
            result: Handle::NULL,
        },
    ));
    let queue = output(&issue(
        runtime,
        blobs,
        Call::CreateCommandQueue {
            context,
            device,
            properties: 0,
            result: Handle::NULL,
        },
    ));
    let program = output(&issue(
        runtime,
        blobs,
        Call::CreateProgramWithSource {
            context,
            sources: vec![source],
            result: Handle::NULL,
        },
    ));
    issue(
        runtime,
        blobs,
        Call::BuildProgram {
            program,
            devices: vec![device],
            options: String::new(),
        },
    );
    let kernel = output(&issue(
        runtime,
        blobs,
        Call::CreateKernel {
            program,
            name: "k".into(),
            result: Handle::NULL,
        },
    ));
    Session {
        context,
        device,
        queue,
        program,
        kernel,
    }
}

type MemRecorder = Recorder<SimRuntime, Vec<u8>, MemoryStore>;

fn recorder(sim: SimRuntime, config: EngineConfig) -> Result<MemRecorder> {
    Ok(Recorder::new(sim, Vec::new(), MemoryStore::new(), config, "test")?)
}

fn replay(trace: Vec<u8>, store: &MemoryStore) -> Result<Player<SimRuntime>> {
    let mut player = Player::new(replay_sim(), &config());
    player.run(TraceReader::open(Cursor::new(trace))?, store)?;
    Ok(player)
}

#[test]
fn test_device_allocation_replays_at_live_address() -> Result<()> {
    let mut rec = recorder(SimRuntime::default(), config())?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let original = alloc(&mut rec, &blobs, &s, AllocKind::UsmDevice, 1024);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelExecInfo {
            kernel: s.kernel,
            info: ExecInfo::IndirectAccess {
                access: IndirectAccess::DEVICE,
                enabled: true,
            },
        },
    );
    issue(&mut rec, &blobs, launch(&s));
    issue(
        &mut rec,
        &blobs,
        Call::UsmFree {
            context: s.context,
            ptr: original,
        },
    );
    let (_, trace, store, _) = rec.finish()?;

    let player = replay(trace, &store)?;
    let sim = player.runtime();
    assert_eq!(sim.count("clDeviceMemAllocINTEL"), 1);
    assert_eq!(sim.count("clMemFreeINTEL"), 1);

    let live = sim
        .calls()
        .find_map(|call| match call {
            Call::UsmAlloc { result, .. } => Some(*result),
            _ => None,
        })
        .unwrap();
    assert_ne!(live, original);

    // The update lands at the live address, before the launch
    let ops = sim.ops();
    let update = ops
        .iter()
        .position(|op| matches!(op, SimOp::WriteMemory { .. }))
        .unwrap();
    let launch_at = ops
        .iter()
        .position(|op| matches!(op, SimOp::Call(Call::EnqueueNdRangeKernel { .. })))
        .unwrap();
    assert!(update < launch_at);
    let writes: Vec<&SimOp> = ops
        .iter()
        .filter(|op| matches!(op, SimOp::WriteMemory { .. }))
        .collect();
    assert_eq!(writes, vec![&SimOp::WriteMemory { ptr: live, len: 1024 }]);

    let freed = sim
        .calls()
        .find_map(|call| match call {
            Call::UsmFree { ptr, .. } => Some(*ptr),
            _ => None,
        })
        .unwrap();
    assert_eq!(freed, live);
    assert_eq!(sim.allocation_count(), 0);
    Ok(())
}

#[test]
fn test_unchanged_allocation_is_not_persisted_again() -> Result<()> {
    let mut rec = recorder(SimRuntime::default(), config())?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let ptr = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 3 * 4096);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArgMemPointer {
            kernel: s.kernel,
            index: 0,
            ptr,
        },
    );

    let mut updates_per_launch = Vec::new();
    for n in 1..=5 {
        let before = rec.stats().updates;
        if n == 2 {
            rec.write_memory(ptr + 4096 + 12, &[0xab; 4])?;
        }
        issue(&mut rec, &blobs, launch(&s));
        updates_per_launch.push(rec.stats().updates - before);
    }
    assert_eq!(updates_per_launch, vec![1, 1, 0, 0, 0]);

    // The second update carries the host write
    let (_, trace, store, _) = rec.finish()?;
    let player = replay(trace, &store)?;
    let live = player.pointers().translate(ptr, None, true)?;
    assert_ne!(live, ptr);
    assert_eq!(
        player.runtime().memory().slice(live + 4096 + 12, 4),
        Some(&[0xab; 4][..])
    );
    Ok(())
}

#[test]
fn test_kernel_writes_replay_without_updates() -> Result<()> {
    let hook = || -> KernelHook {
        Box::new(|memory: &mut SimMemory, args: &[u64]| {
            if let Some(bytes) = args.first().and_then(|ptr| memory.slice_mut(*ptr, 4)) {
                bytes.copy_from_slice(&[7; 4]);
            }
        })
    };
    let mut sim = SimRuntime::default();
    sim.on_kernel("k", hook());
    let mut rec = recorder(sim, config())?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let ptr = alloc(&mut rec, &blobs, &s, AllocKind::UsmHost, 64);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArg {
            kernel: s.kernel,
            index: 0,
            size: 8,
            value: ArgValue::Pointer(ptr),
        },
    );
    issue(&mut rec, &blobs, launch(&s));
    issue(&mut rec, &blobs, launch(&s));
    let (_, trace, store, stats) = rec.finish()?;
    assert_eq!(stats.updates, 1);

    let mut replay_runtime = replay_sim();
    replay_runtime.on_kernel("k", hook());
    let mut player = Player::new(replay_runtime, &config());
    player.run(TraceReader::open(Cursor::new(trace))?, &store)?;
    let live = player.pointers().translate(ptr, None, true)?;
    assert_eq!(player.runtime().memory().slice(live, 4), Some(&[7u8; 4][..]));
    Ok(())
}

#[test]
fn test_references_balance_after_replay() -> Result<()> {
    let mut rec = recorder(SimRuntime::default(), config())?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let data = blobs.put(&[3u8; 32])?;
    let buffer = output(&issue(
        &mut rec,
        &blobs,
        Call::CreateBuffer {
            context: s.context,
            flags: MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
            size: 32,
            data: Some(data),
            result: Handle::NULL,
        },
    ));
    issue(
        &mut rec,
        &blobs,
        Call::Retain {
            kind: HandleKind::Mem,
            handle: buffer,
        },
    );
    let sub = output(&issue(
        &mut rec,
        &blobs,
        Call::CreateSubBuffer {
            parent: buffer,
            flags: MemFlags::READ_WRITE,
            origin: 16,
            size: 16,
            result: Handle::NULL,
        },
    ));
    let event = output(&issue(
        &mut rec,
        &blobs,
        Call::CreateUserEvent {
            context: s.context,
            result: Handle::NULL,
        },
    ));
    for (kind, handle) in [
        (HandleKind::Mem, buffer),
        (HandleKind::Mem, buffer),
        (HandleKind::Program, s.program),
        (HandleKind::Event, event),
        (HandleKind::Kernel, s.kernel),
        (HandleKind::Mem, sub),
        (HandleKind::Queue, s.queue),
        (HandleKind::Context, s.context),
    ] {
        issue(&mut rec, &blobs, Call::Release { kind, handle });
    }
    let (recorded_sim, trace, store, _) = rec.finish()?;
    assert_eq!(recorded_sim.live_objects(), 0);

    let player = replay(trace, &store)?;
    let sim = player.runtime();
    assert_eq!(sim.live_objects(), 0);
    // Only the platform and device stay bound
    assert_eq!(player.registry().len(), 2);
    let releases = sim.calls().filter(|c| matches!(c, Call::Release { .. })).count();
    let retains = sim.calls().filter(|c| matches!(c, Call::Retain { .. })).count();
    // context, queue, program, kernel, buffer, sub-buffer, event
    assert_eq!(releases, retains + 7);
    Ok(())
}

#[test]
fn test_subcapture_round_trip_on_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.trace");

    // Dereferences the pointer stored at the start of argument 1 and marks its target
    let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let hook = |seen: Arc<Mutex<Vec<bool>>>| -> KernelHook {
        Box::new(move |memory: &mut SimMemory, args: &[u64]| {
            let target = args
                .get(1)
                .and_then(|holder| memory.slice(*holder, 8))
                .and_then(|bytes| bytes.try_into().ok())
                .map(u64::from_le_bytes);
            let reached = match target.and_then(|ptr| memory.slice_mut(ptr, 4)) {
                Some(bytes) => {
                    bytes.copy_from_slice(&[9; 4]);
                    true
                }
                None => false,
            };
            seen.lock().unwrap().push(reached);
        })
    };

    let mut sim = SimRuntime::default();
    sim.on_kernel("k", hook(Arc::clone(&seen)));
    let config = EngineConfig {
        subcapture: Some(SubcaptureRange { start: 13 }),
        ..config()
    };
    let mut rec = Recorder::new(
        sim,
        BufWriter::new(File::create(&path)?),
        DirStore::beside(&path)?,
        config.clone(),
        "subcapture round trip",
    )?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let contents: Vec<u8> = (1..=16).collect();
    let data = blobs.put(&contents)?;
    let buffer = output(&issue(
        &mut rec,
        &blobs,
        Call::CreateBuffer {
            context: s.context,
            flags: MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
            size: 16,
            data: Some(data.clone()),
            result: Handle::NULL,
        },
    ));
    let target = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 64);
    let holder = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 64);
    rec.write_memory(holder, &(target + 16).to_le_bytes())?;
    rec.register_indirect_pointers(holder, &[0])?;
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArg {
            kernel: s.kernel,
            index: 0,
            size: 8,
            value: ArgValue::Mem(buffer),
        },
    );
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArgMemPointer {
            kernel: s.kernel,
            index: 1,
            ptr: holder,
        },
    );
    issue(
        &mut rec,
        &blobs,
        Call::Retain {
            kind: HandleKind::Context,
            handle: s.context,
        },
    );
    assert!(!rec.is_recording());

    issue(&mut rec, &blobs, launch(&s));
    assert!(rec.is_recording());
    for call in [
        Call::Release {
            kind: HandleKind::Kernel,
            handle: s.kernel,
        },
        Call::Release {
            kind: HandleKind::Program,
            handle: s.program,
        },
        Call::UsmFree {
            context: s.context,
            ptr: holder,
        },
        Call::Release {
            kind: HandleKind::Context,
            handle: s.context,
        },
    ] {
        issue(&mut rec, &blobs, call);
    }
    let (_, mut writer, _, stats) = rec.finish()?;
    writer.flush()?;
    drop(writer);
    assert_eq!(stats.application_calls, 18);

    let reader = TraceReader::open(BufReader::new(File::open(&path)?))?;
    assert_eq!(reader.header().subcapture_start, Some(13));
    let records: Vec<_> = reader.collect::<std::result::Result<_, _>>()?;
    let first_app = records
        .iter()
        .position(|r| r.origin == RecordOrigin::Application)
        .unwrap();
    assert!(matches!(
        records[first_app].call,
        Call::EnqueueNdRangeKernel { .. }
    ));
    // The buffer comes back with the contents it had at the cut
    let store = DirStore::beside(&path)?;
    let restored = records[..first_app]
        .iter()
        .find_map(|r| match &r.call {
            Call::CreateBuffer { data: Some(data), .. } => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(store.get(&restored)?, contents);

    let replay_seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = replay_sim();
    runtime.on_kernel("k", hook(Arc::clone(&replay_seen)));
    let mut player = Player::new(runtime, &config);
    let replay_stats = player.run(TraceReader::open(BufReader::new(File::open(&path)?))?, &store)?;

    assert_eq!(*seen.lock().unwrap(), vec![true]);
    assert_eq!(*replay_seen.lock().unwrap(), vec![true]);
    assert_eq!(replay_stats.application, 5);
    assert!(replay_stats.teardown > 0);

    // Teardown leaves nothing behind
    let sim = player.runtime();
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.allocation_count(), 0);
    Ok(())
}

#[test]
fn test_subcapture_after_bound_objects_released() -> Result<()> {
    let config = EngineConfig {
        subcapture: Some(SubcaptureRange { start: 13 }),
        ..config()
    };
    let mut rec = recorder(SimRuntime::default(), config)?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let create_buffer = |context: Handle| Call::CreateBuffer {
        context,
        flags: MemFlags::READ_WRITE,
        size: 64,
        data: None,
        result: Handle::NULL,
    };
    let bind_buffer = |kernel: Handle, buffer: Handle| Call::SetKernelArg {
        kernel,
        index: 0,
        size: 8,
        value: ArgValue::Mem(buffer),
    };

    // Both arguments point at objects gone before recording starts
    let stale = output(&issue(&mut rec, &blobs, create_buffer(s.context)));
    issue(&mut rec, &blobs, bind_buffer(s.kernel, stale));
    let freed = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 128);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArgMemPointer {
            kernel: s.kernel,
            index: 1,
            ptr: freed + 8,
        },
    );
    issue(
        &mut rec,
        &blobs,
        Call::UsmFree {
            context: s.context,
            ptr: freed,
        },
    );
    issue(
        &mut rec,
        &blobs,
        Call::Release {
            kind: HandleKind::Mem,
            handle: stale,
        },
    );
    assert!(!rec.is_recording());

    let live = output(&issue(&mut rec, &blobs, create_buffer(s.context)));
    assert!(rec.is_recording());
    issue(&mut rec, &blobs, bind_buffer(s.kernel, live));
    let target = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 128);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArgMemPointer {
            kernel: s.kernel,
            index: 1,
            ptr: target,
        },
    );
    issue(&mut rec, &blobs, launch(&s));
    let (_, trace, store, _) = rec.finish()?;

    let player = replay(trace, &store)?;
    let sim = player.runtime();
    assert_eq!(sim.count("clCreateBuffer"), 1);
    assert_eq!(sim.count("clSetKernelArg"), 1);
    assert_eq!(sim.count("clSetKernelArgMemPointerINTEL"), 1);
    assert_eq!(sim.count("clEnqueueNDRangeKernel"), 1);
    Ok(())
}

#[test]
fn test_repeated_launch_on_clean_shared_memory_reads_nothing() -> Result<()> {
    let mut rec = recorder(SimRuntime::default(), config())?;
    let mut blobs = MemoryStore::new();
    let s = setup(&mut rec, &mut blobs);
    let ptr = alloc(&mut rec, &blobs, &s, AllocKind::UsmShared, 4096);
    issue(
        &mut rec,
        &blobs,
        Call::SetKernelArgMemPointer {
            kernel: s.kernel,
            index: 0,
            ptr,
        },
    );
    let reads = |rec: &MemRecorder| {
        rec.runtime()
            .ops()
            .iter()
            .filter(|op| matches!(op, SimOp::ReadMemory { .. }))
            .count()
    };

    issue(&mut rec, &blobs, launch(&s));
    let after_first = reads(&rec);
    issue(&mut rec, &blobs, launch(&s));
    assert_eq!(reads(&rec), after_first);
    assert_eq!(rec.stats().updates, 1);
    Ok(())
}
