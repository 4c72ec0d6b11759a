//! Replay Pipeline
//!
//! [`Player`] re-issues a trace against a live runtime. Before each call its
//! handles are looked up in the registry and its pointers translated from the
//! recorded to the live address space; after it, the handles and allocations
//! the runtime produced are bound to the recorded ones and the live state
//! store is updated. Injected records are applied directly to live memory.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::kernel_args::IndirectPointerTable;
use crate::pointers::PointerSpace;
use crate::registry::HandleRegistry;
use crate::runtime::Runtime;
use crate::state::StateStore;
use crate::subcapture::teardown;
use retrace_shared::{
    Call, ContentStore, HandleKind, PointerRole, PointerSlot, RecordOrigin, ThreadId,
    TraceReader, TraceRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::{debug, info, warn};

/// What a replay did, per record origin and per call name
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayStats {
    pub application: u64,
    pub injected: u64,
    pub reconstruction: u64,
    pub teardown: u64,
    /// Tolerated problems, such as untracked pointers passed through raw
    pub warnings: u64,
    pub calls: BTreeMap<String, u64>,
}

impl ReplayStats {
    fn count(&mut self, origin: RecordOrigin, call: &Call) {
        match origin {
            RecordOrigin::Application => self.application += 1,
            RecordOrigin::Injected => self.injected += 1,
            RecordOrigin::Reconstruction => self.reconstruction += 1,
            RecordOrigin::Teardown => self.teardown += 1,
        }
        *self.calls.entry(call.name().to_string()).or_default() += 1;
    }

    pub fn total(&self) -> u64 {
        self.application + self.injected + self.reconstruction + self.teardown
    }
}

pub struct Player<R: Runtime> {
    runtime: R,
    registry: HandleRegistry,
    pointers: PointerSpace,
    /// Keyed by live handle and live address
    state: StateStore,
    /// Keyed by recorded allocation base
    indirect: IndirectPointerTable,
    thread: ThreadId,
    stats: ReplayStats,
}

impl<R: Runtime> Player<R> {
    pub fn new(runtime: R, config: &EngineConfig) -> Self {
        Self {
            runtime,
            registry: HandleRegistry::new().with_rewrite_logging(config.logs_handles()),
            pointers: PointerSpace::new().with_rewrite_logging(config.logs_pointers()),
            state: StateStore::new(),
            indirect: IndirectPointerTable::new(),
            thread: ThreadId::default(),
            stats: ReplayStats::default(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn into_runtime(self) -> R {
        self.runtime
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn pointers(&self) -> &PointerSpace {
        &self.pointers
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Application thread of the last thread marker
    pub fn current_thread(&self) -> ThreadId {
        self.thread
    }

    /// Replay every record of `reader`, then tear down reconstructed state
    /// if the trace is a subcapture
    pub fn run<T: Read>(
        &mut self,
        reader: TraceReader<T>,
        content: &dyn ContentStore,
    ) -> Result<ReplayStats> {
        let subcapture = reader.header().is_subcapture();
        info!(
            "replaying '{}' recorded at {}",
            reader.header().description,
            reader.header().recorded_at
        );
        for record in reader {
            self.replay_record(&record?, content)?;
        }
        if subcapture {
            self.teardown(content)?;
        }
        info!(
            "replay finished: {} records, {} warnings",
            self.stats.total(),
            self.stats.warnings
        );
        Ok(self.stats.clone())
    }

    pub fn replay_record(&mut self, record: &TraceRecord, content: &dyn ContentStore) -> Result<()> {
        self.stats.count(record.origin, &record.call);
        let result = if record.call.is_injected() {
            self.apply_injected(&record.call, content)
        } else {
            self.replay_call(&record.call, record.origin, content)
        };
        self.tolerate(record.call.name(), result)
    }

    fn tolerate(&mut self, name: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if !e.is_fatal() => {
                warn!("{}: {}", name, e);
                self.stats.warnings += 1;
                Ok(())
            }
            other => other,
        }
    }

    fn replay_call(
        &mut self,
        original: &Call,
        origin: RecordOrigin,
        content: &dyn ContentStore,
    ) -> Result<()> {
        let mut live = self.on_call_about_to_replay(original)?;
        let dispatched = self.runtime.dispatch(&mut live, content);
        if let (Err(e), Call::GetExtensionFunctionAddress { name, .. }) = (&dispatched, original) {
            // Lookups only return function addresses; nothing downstream depends on them
            debug!("extension function {} unavailable ({}), skipping", name, e);
            return Ok(());
        }
        dispatched?;
        self.on_call_replayed(original, &live, origin)
    }

    /// Rewrite a recorded call into the live handle and address space.
    ///
    /// Unmapped handles are fatal. Pointers that resolve to no allocation are
    /// passed through unchanged with a warning; pointers that may legitimately
    /// address plain host memory are passed through silently.
    pub fn on_call_about_to_replay(&mut self, call: &Call) -> Result<Call> {
        let mut live = call.clone();

        let mut failure = None;
        let registry = &self.registry;
        live.visit_inputs(&mut |kind, handle| {
            if failure.is_some() {
                return;
            }
            match registry.lookup(kind, *handle) {
                Ok(mapped) => *handle = mapped,
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        let mut untracked = Vec::new();
        let pointers = &self.pointers;
        live.visit_pointers(&mut |slot: PointerSlot<'_>| {
            let exact = slot.role == PointerRole::Base;
            match pointers.translate(*slot.value, slot.family, exact) {
                Ok(mapped) => *slot.value = mapped,
                Err(e) if slot.role != PointerRole::MaybeHost => untracked.push(e),
                Err(_) => {}
            }
        });

        if let Call::EnqueueUnmapMemObject { mapped_ptr, .. } = &mut live {
            match self.pointers.peek_mapping(*mapped_ptr) {
                Some(mapped) => *mapped_ptr = mapped,
                None => untracked.push(EngineError::UntrackedPointer { ptr: *mapped_ptr }),
            }
        }

        for e in untracked {
            warn!("{}: {}, passing the raw value through", call.name(), e);
            self.stats.warnings += 1;
        }
        Ok(live)
    }

    /// Bind what the runtime produced for `original` and update live state
    pub fn on_call_replayed(
        &mut self,
        original: &Call,
        live: &Call,
        origin: RecordOrigin,
    ) -> Result<()> {
        for ((kind, recorded), (_, produced)) in original.outputs().into_iter().zip(live.outputs())
        {
            if recorded.is_null() {
                continue;
            }
            if produced.is_null() {
                warn!("{} produced no {} for {}", original.name(), kind, recorded);
                continue;
            }
            self.registry.bind(kind, recorded, produced);
        }

        if let (Some((kind, recorded, size)), Some((_, produced, _))) =
            (original.allocation_result(), live.allocation_result())
        {
            if recorded != 0 {
                if produced == 0 {
                    return Err(EngineError::AllocationFailure {
                        call: original.name(),
                        reason: format!("no memory for {} bytes", size),
                    });
                }
                self.pointers.bind_allocation(kind, recorded, produced, size)?;
            }
        }
        if let (
            Call::EnqueueMapBuffer {
                mapped_ptr: recorded,
                ..
            },
            Call::EnqueueMapBuffer {
                mapped_ptr: produced,
                ..
            },
        ) = (original, live)
        {
            self.pointers.push_mapping(*recorded, *produced);
        }

        let applied = self.state.apply(live)?;
        for (kind, handle) in &applied.destroyed {
            let originals = self.registry.unbind_live(*kind, *handle);
            debug!("{} {} destroyed, unbound {:?}", kind, handle, originals);
        }
        match original {
            Call::SvmFree { ptr, .. } | Call::UsmFree { ptr, .. } => {
                self.pointers.release_allocation(*ptr);
                self.indirect.remove(*ptr);
            }
            Call::EnqueueUnmapMemObject { mapped_ptr, .. } => {
                self.pointers.pop_mapping(*mapped_ptr);
            }
            _ => {}
        }

        if origin == RecordOrigin::Reconstruction {
            self.mark_restored(live)?;
        }
        Ok(())
    }

    /// Objects materialized by reconstruction are torn down at the end
    fn mark_restored(&mut self, live: &Call) -> Result<()> {
        for (kind, handle) in live.outputs() {
            if self.state.contains(kind, handle) {
                self.state.mark_restored(kind, handle)?;
            }
        }
        if let Some((_, base, _)) = live.allocation_result() {
            self.state.allocation_mut(base)?.restored = true;
        }
        if let Call::EnqueueMapBuffer { mapped_ptr, .. } = live {
            if let Some(snapshot) = self.state.mapping_mut(*mapped_ptr) {
                snapshot.restored = true;
            }
        }
        Ok(())
    }

    fn apply_injected(&mut self, call: &Call, content: &dyn ContentStore) -> Result<()> {
        match call {
            Call::SetThread { thread } => {
                debug!("switching to thread {}", thread);
                self.thread = *thread;
                self.runtime.set_thread(*thread);
            }
            Call::UpdateAllocation {
                ptr,
                offset,
                content: blob,
                ..
            } => {
                let live = self.pointers.translate(*ptr, None, true)?;
                let mut bytes = content.get(blob)?;
                if self.indirect.has_offsets(*ptr) {
                    self.indirect.reset_translated(*ptr);
                    let pointers = &self.pointers;
                    let rewritten = self.indirect.translate_buffer(*ptr, *offset, &mut bytes, |p| {
                        pointers.translate_embedded(p)
                    });
                    debug!("{:#x}: {} embedded pointer(s) rewritten", ptr, rewritten);
                }
                self.runtime.write_memory(live + offset, &bytes)?;
            }
            Call::UpdateBuffer {
                buffer,
                offset,
                content: blob,
                ..
            } => {
                let live = self.registry.lookup(HandleKind::Mem, *buffer)?;
                self.runtime.write_buffer(live, *offset, &content.get(blob)?)?;
            }
            Call::UpdateMappedRegion {
                mapped_ptr,
                content: blob,
                ..
            } => {
                let live = self
                    .pointers
                    .peek_mapping(*mapped_ptr)
                    .ok_or(EngineError::UntrackedPointer { ptr: *mapped_ptr })?;
                self.runtime.write_memory(live, &content.get(blob)?)?;
            }
            Call::RegisterIndirectPointers { ptr, offsets } => {
                self.indirect.register_indirect_pointer_offsets(*ptr, offsets);
            }
            other => debug!("{} is not an injected record", other.name()),
        }
        Ok(())
    }

    /// Release everything reconstruction restored and the segment left alive
    fn teardown(&mut self, content: &dyn ContentStore) -> Result<()> {
        let calls = teardown(&self.state);
        info!("tearing down reconstructed state: {} calls", calls.len());
        for mut call in calls {
            self.stats.count(RecordOrigin::Teardown, &call);
            self.runtime.dispatch(&mut call, content)?;
            let applied = self.state.apply(&call)?;
            for (kind, handle) in &applied.destroyed {
                self.registry.unbind_live(*kind, *handle);
            }
        }
        Ok(())
    }
}
