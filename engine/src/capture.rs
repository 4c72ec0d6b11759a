//! Capture Pipeline
//!
//! [`Recorder`] sits between the application and the compute runtime. It
//! forwards every call, keeps the state store, region index and kernel
//! argument table in step with the application, and appends each call to the
//! trace. Before a kernel launch it persists the allocations the launch may
//! read whose pages changed since they were last persisted; before an unmap
//! it persists the host-visible bytes written through the mapping.
//!
//! With a subcapture range configured, calls before the start only update the
//! tracked state. At the start the reconstructed state is written first, so
//! the trace replays on its own.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::kernel_args::{scan_embedded_pointers, IndirectPointerTable, KernelArgTable};
use crate::regions::RegionIndex;
use crate::runtime::Runtime;
use crate::state::StateStore;
use crate::subcapture::reconstruct_from;
use crate::tracker::{ChangeTracker, PageTracker};
use retrace_shared::{
    Address, Call, ContentStore, Handle, HandleKind, MapFlags, RecordOrigin, ThreadId,
    TraceHeader, TraceWriter,
};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    /// Calls issued by the application, recorded or not
    pub application_calls: u64,
    /// Records appended to the trace, injected ones included
    pub records_written: u64,
    /// Synthetic calls written at the subcapture start
    pub reconstructed: u64,
    /// Allocation and mapped-region updates written
    pub updates: u64,
    /// Bytes handed to the content store by updates
    pub bytes_persisted: u64,
}

pub struct Recorder<R: Runtime, W: Write, S: ContentStore> {
    runtime: R,
    writer: TraceWriter<W>,
    store: S,
    config: EngineConfig,
    state: StateStore,
    regions: RegionIndex,
    args: KernelArgTable,
    indirect: IndirectPointerTable,
    tracker: ChangeTracker,
    thread: ThreadId,
    written_thread: ThreadId,
    recording: bool,
    stats: CaptureStats,
}

impl<R: Runtime, W: Write, S: ContentStore> Recorder<R, W, S> {
    /// Wrap `runtime`, writing the trace to `inner` and blobs to `store`
    pub fn new(
        runtime: R,
        inner: W,
        store: S,
        config: EngineConfig,
        description: impl Into<String>,
    ) -> Result<Self> {
        let mut header = TraceHeader::new(description);
        header.subcapture_start = config.subcapture.map(|range| range.start);
        let writer = TraceWriter::new(inner, &header)?;
        let tracker = ChangeTracker::new(
            config.page_size,
            config.track_device_memory,
            config.fine_grain_svm_always_dirty,
        );
        if let Some(range) = config.subcapture {
            info!("recording from call {}", range.start);
        }

        Ok(Self {
            runtime,
            writer,
            store,
            recording: config.subcapture.is_none(),
            config,
            state: StateStore::new(),
            regions: RegionIndex::new(),
            args: KernelArgTable::new(),
            indirect: IndirectPointerTable::new(),
            tracker,
            thread: ThreadId::default(),
            written_thread: ThreadId::default(),
            stats: CaptureStats::default(),
        })
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Declare byte offsets inside the allocation at `ptr` that hold pointers.
    ///
    /// Used by applications that know their data layout; offsets found by
    /// scanning persisted contents are registered automatically.
    pub fn register_indirect_pointers(&mut self, ptr: Address, offsets: &[u64]) -> Result<()> {
        if self.regions.resolve(ptr, true).is_none() {
            return Err(EngineError::UntrackedPointer { ptr });
        }
        if self.indirect.register_indirect_pointer_offsets(ptr, offsets) && self.recording {
            self.write(
                RecordOrigin::Injected,
                Call::RegisterIndirectPointers {
                    ptr,
                    offsets: self.indirect.offsets(ptr),
                },
            )?;
        }
        Ok(())
    }

    /// Flush the trace and hand back the wrapped parts
    pub fn finish(mut self) -> Result<(R, W, S, CaptureStats)> {
        if !self.recording {
            warn!(
                "stream ended after {} calls, before the subcapture start; trace holds reconstructed state only",
                self.stats.application_calls
            );
            self.start_recording()?;
        }
        self.writer.flush()?;
        self.stats.records_written = self.writer.records_written();
        info!(
            "capture finished: {} application calls, {} records",
            self.stats.application_calls, self.stats.records_written
        );
        Ok((self.runtime, self.writer.into_inner(), self.store, self.stats))
    }

    fn write(&mut self, origin: RecordOrigin, call: Call) -> Result<u64> {
        if self.thread != self.written_thread {
            self.writer.append(
                self.thread,
                RecordOrigin::Injected,
                Call::SetThread {
                    thread: self.thread,
                },
            )?;
            self.written_thread = self.thread;
        }
        Ok(self.writer.append(self.thread, origin, call)?)
    }

    fn start_recording(&mut self) -> Result<()> {
        info!(
            "subcapture starts at call {}, reconstructing {} objects and {} allocations",
            self.stats.application_calls,
            self.state.summary().iter().map(|(_, n)| n).sum::<usize>(),
            self.state.allocations().len()
        );
        let calls = reconstruct_from(
            &mut self.state,
            &self.args,
            &self.indirect,
            &mut self.runtime,
            &mut self.store,
        )?;
        self.stats.reconstructed = calls.len() as u64;
        for call in calls {
            self.write(RecordOrigin::Reconstruction, call)?;
        }
        // Every allocation was just persisted in full
        let bases: Vec<Address> = self.state.allocations().into_iter().map(|(b, _)| b).collect();
        for base in bases {
            self.resync(base)?;
        }
        self.recording = true;
        Ok(())
    }

    /// Make the current contents of `base` the persisted baseline
    fn resync(&mut self, base: Address) -> Result<()> {
        self.tracker.reset(base, None, &mut self.runtime)
    }

    fn launch_targets(&self, kernel: Handle) -> Vec<(Address, u64)> {
        self.args
            .indirect_offsets_for(kernel, &self.regions)
            .into_iter()
            .filter_map(|(id, _)| self.regions.get(id).map(|r| (r.base, r.size)))
            .collect()
    }

    fn persist_dirty(&mut self, kernel: Handle) -> Result<()> {
        for (base, size) in self.launch_targets(kernel) {
            let dirty = self.tracker.dirty_pages(base, &mut self.runtime)?;
            if dirty.is_empty() {
                continue;
            }
            debug!(
                "kernel {}: {:#x} has {} dirty page(s), persisting",
                kernel,
                base,
                dirty.len()
            );
            let contents = self.runtime.read_memory(base, size)?;

            let found = scan_embedded_pointers(&contents, &self.regions);
            if !found.is_empty() && self.indirect.register_indirect_pointer_offsets(base, &found) {
                self.write(
                    RecordOrigin::Injected,
                    Call::RegisterIndirectPointers {
                        ptr: base,
                        offsets: self.indirect.offsets(base),
                    },
                )?;
            }

            let content = self.store.put(&contents)?;
            self.write(
                RecordOrigin::Injected,
                Call::UpdateAllocation {
                    ptr: base,
                    offset: 0,
                    length: size,
                    content,
                },
            )?;
            self.tracker.reset(base, Some(&contents), &mut self.runtime)?;
            self.stats.updates += 1;
            self.stats.bytes_persisted += size;
        }
        Ok(())
    }

    fn persist_mapped(&mut self, mapped_ptr: Address) -> Result<()> {
        let Some(snapshot) = self.state.mapping_mut(mapped_ptr) else {
            warn!("unmap of {:#x} without a live mapping", mapped_ptr);
            return Ok(());
        };
        if !snapshot
            .map_flags
            .intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE_REGION)
        {
            return Ok(());
        }
        let size = snapshot.size;
        let contents = self.runtime.read_memory(mapped_ptr, size)?;
        let content = self.store.put(&contents)?;
        if let Some(snapshot) = self.state.mapping_mut(mapped_ptr) {
            snapshot.contents = Some(contents);
        }
        self.write(
            RecordOrigin::Injected,
            Call::UpdateMappedRegion {
                mapped_ptr,
                length: size,
                content,
            },
        )?;
        self.stats.updates += 1;
        self.stats.bytes_persisted += size;
        Ok(())
    }

    fn before_call(&mut self, call: &Call) -> Result<()> {
        if !self.recording
            && self
                .config
                .subcapture
                .is_some_and(|range| self.stats.application_calls >= range.start)
        {
            self.start_recording()?;
        }
        if !self.recording {
            return Ok(());
        }
        match call {
            Call::EnqueueNdRangeKernel { kernel, .. } => self.persist_dirty(*kernel),
            Call::EnqueueUnmapMemObject { mapped_ptr, .. } => self.persist_mapped(*mapped_ptr),
            _ => Ok(()),
        }
    }

    /// Fold a call the runtime completed into the tracked state and the trace
    pub fn on_call_captured(&mut self, call: &Call) -> Result<()> {
        let applied = self.state.apply(call)?;

        if let Some((kind, base, size)) = call.allocation_result() {
            if base != 0 {
                self.regions.register(base, size, kind)?;
                self.tracker.track(base, size, kind, &mut self.runtime);
            }
        }
        if let Some((base, freed)) = &applied.freed {
            self.regions.unregister(*base);
            self.tracker.untrack(*base, &mut self.runtime);
            self.indirect.remove(*base);
            self.args.forget_allocation(*base, freed.size);
        }

        self.args.record(call, &self.regions);
        for (kind, handle) in &applied.destroyed {
            match kind {
                HandleKind::Kernel => self.args.clear(*handle),
                HandleKind::Mem | HandleKind::Sampler => self.args.forget_handle(*kind, *handle),
                _ => {}
            }
        }

        if self.recording {
            self.write(RecordOrigin::Application, call.clone())?;
            // Replay reruns the kernel, so its writes are not changes to
            // persist. Only compared memory sees them.
            if let Call::EnqueueNdRangeKernel { kernel, .. } = call {
                for (base, _) in self.launch_targets(*kernel) {
                    if self.tracker.sees_device_writes(base) {
                        self.resync(base)?;
                    }
                }
            }
        }
        self.stats.application_calls += 1;
        Ok(())
    }

    fn import_content(&mut self, call: &Call, content: &dyn ContentStore) -> Result<()> {
        for content_ref in call.content_refs() {
            if !self.store.contains(content_ref) {
                let bytes = content.get(content_ref)?;
                self.store.put(&bytes)?;
            }
        }
        Ok(())
    }
}

impl<R: Runtime, W: Write, S: ContentStore> Runtime for Recorder<R, W, S> {
    fn dispatch(&mut self, call: &mut Call, content: &dyn ContentStore) -> Result<()> {
        self.import_content(call, content)?;
        self.before_call(call)?;
        self.runtime.dispatch(call, content)?;
        self.on_call_captured(call)
    }

    fn read_memory(&mut self, ptr: Address, len: u64) -> Result<Vec<u8>> {
        self.runtime.read_memory(ptr, len)
    }

    fn write_memory(&mut self, ptr: Address, bytes: &[u8]) -> Result<()> {
        self.runtime.write_memory(ptr, bytes)
    }

    fn read_buffer(&mut self, mem: Handle, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.runtime.read_buffer(mem, offset, len)
    }

    fn write_buffer(&mut self, mem: Handle, offset: u64, bytes: &[u8]) -> Result<()> {
        self.runtime.write_buffer(mem, offset, bytes)
    }

    fn set_thread(&mut self, thread: ThreadId) {
        self.thread = thread;
        self.runtime.set_thread(thread);
    }

    fn protect_pages(&mut self, ptr: Address, len: u64, page_size: u64) -> bool {
        self.runtime.protect_pages(ptr, len, page_size)
    }

    fn written_pages(&mut self, ptr: Address, len: u64, page_size: u64) -> Result<Vec<u64>> {
        self.runtime.written_pages(ptr, len, page_size)
    }

    fn unprotect_pages(&mut self, ptr: Address) {
        self.runtime.unprotect_pages(ptr)
    }
}
