//! Memory Change Tracker
//!
//! Tells the recorder which pages of a tracked allocation changed since the
//! contents were last persisted. Two mechanisms sit behind [`PageTracker`]:
//!
//! - [`ProtectedPageTracker`] write-protects host-resident allocations through
//!   the runtime and asks it which pages the host wrote. Checking a clean
//!   allocation reads nothing, and device writes do not fault.
//! - [`ShadowPageTracker`] keeps a digest per page of the last persisted
//!   contents and compares against an explicit copy. Device-only USM needs
//!   this, as does any host-resident memory the runtime cannot protect.
//!
//! [`ChangeTracker`] routes each allocation to one of them. Fine-grained SVM
//! is shared with the device without protection faults, so it is either
//! always dirty or never checked depending on configuration.

use crate::error::Result;
use crate::runtime::Runtime;
use retrace_shared::{Address, AllocKind};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

type PageDigest = [u8; 32];

pub trait PageTracker {
    /// Start tracking an allocation. Nothing has been persisted yet, so
    /// every page counts as dirty until the first [`reset`](Self::reset).
    fn track(&mut self, base: Address, size: u64, kind: AllocKind, memory: &mut dyn Runtime);

    fn untrack(&mut self, base: Address, memory: &mut dyn Runtime);

    /// Indices of pages changed since the last reset
    fn dirty_pages(&mut self, base: Address, memory: &mut dyn Runtime) -> Result<Vec<u64>>;

    /// Re-arm tracking with the current contents as the persisted state.
    /// `contents` is passed when the caller already holds them.
    fn reset(
        &mut self,
        base: Address,
        contents: Option<&[u8]>,
        memory: &mut dyn Runtime,
    ) -> Result<()>;

    fn is_tracked(&self, base: Address) -> bool;

    /// Whether writes made by a kernel show up as dirty pages, in which case
    /// the allocation has to be reset after each launch
    fn sees_device_writes(&self, base: Address) -> bool;
}

fn page_count(size: u64, page_size: u64) -> u64 {
    size.div_ceil(page_size)
}

#[derive(Debug)]
struct Tracked {
    size: u64,
    kind: AllocKind,
    shadow: Option<Vec<PageDigest>>,
}

#[derive(Debug)]
pub struct ShadowPageTracker {
    page_size: usize,
    track_device_memory: bool,
    fine_grain_always_dirty: bool,
    allocations: HashMap<Address, Tracked>,
}

impl ShadowPageTracker {
    pub fn new(page_size: usize, track_device_memory: bool, fine_grain_always_dirty: bool) -> Self {
        Self {
            page_size: page_size.max(1),
            track_device_memory,
            fine_grain_always_dirty,
            allocations: HashMap::new(),
        }
    }

    fn digests(&self, contents: &[u8]) -> Vec<PageDigest> {
        contents
            .chunks(self.page_size)
            .map(|page| Sha256::digest(page).into())
            .collect()
    }

    /// Whether dirtiness of this kind is decided by comparing contents
    fn compares(&self, kind: AllocKind) -> bool {
        match kind {
            AllocKind::SvmFineGrain => false,
            kind => !kind.is_device_only() || self.track_device_memory,
        }
    }
}

impl PageTracker for ShadowPageTracker {
    fn track(&mut self, base: Address, size: u64, kind: AllocKind, _memory: &mut dyn Runtime) {
        self.allocations.insert(
            base,
            Tracked {
                size,
                kind,
                shadow: None,
            },
        );
    }

    fn untrack(&mut self, base: Address, _memory: &mut dyn Runtime) {
        self.allocations.remove(&base);
    }

    fn dirty_pages(&mut self, base: Address, memory: &mut dyn Runtime) -> Result<Vec<u64>> {
        let Some(tracked) = self.allocations.get(&base) else {
            return Ok(Vec::new());
        };
        let all_pages = || (0..page_count(tracked.size, self.page_size as u64)).collect::<Vec<u64>>();

        if tracked.kind == AllocKind::SvmFineGrain {
            return Ok(if self.fine_grain_always_dirty {
                all_pages()
            } else {
                Vec::new()
            });
        }
        if !self.compares(tracked.kind) {
            return Ok(Vec::new());
        }
        let Some(shadow) = &tracked.shadow else {
            return Ok(all_pages());
        };

        let current = self.digests(&memory.read_memory(base, tracked.size)?);
        let dirty: Vec<u64> = current
            .iter()
            .enumerate()
            .filter(|(page, digest)| shadow.get(*page) != Some(*digest))
            .map(|(page, _)| page as u64)
            .collect();
        if !dirty.is_empty() {
            debug!("{:#x}: {} dirty page(s)", base, dirty.len());
        }
        Ok(dirty)
    }

    fn reset(
        &mut self,
        base: Address,
        contents: Option<&[u8]>,
        memory: &mut dyn Runtime,
    ) -> Result<()> {
        let Some(tracked) = self.allocations.get(&base) else {
            return Ok(());
        };
        if !self.compares(tracked.kind) {
            return Ok(());
        }
        let digests = match contents {
            Some(contents) => self.digests(contents),
            None => self.digests(&memory.read_memory(base, tracked.size)?),
        };
        if let Some(tracked) = self.allocations.get_mut(&base) {
            tracked.shadow = Some(digests);
        }
        Ok(())
    }

    fn is_tracked(&self, base: Address) -> bool {
        self.allocations.contains_key(&base)
    }

    fn sees_device_writes(&self, base: Address) -> bool {
        self.allocations
            .get(&base)
            .is_some_and(|tracked| self.compares(tracked.kind))
    }
}

#[derive(Debug, Clone, Copy)]
struct Protected {
    size: u64,
    persisted: bool,
}

/// Dirty pages from host write protection provided by the runtime
#[derive(Debug)]
pub struct ProtectedPageTracker {
    page_size: u64,
    allocations: HashMap<Address, Protected>,
}

impl ProtectedPageTracker {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1) as u64,
            allocations: HashMap::new(),
        }
    }

    /// Protect the allocation; false when the runtime cannot watch it
    pub fn try_track(&mut self, base: Address, size: u64, memory: &mut dyn Runtime) -> bool {
        if !memory.protect_pages(base, size, self.page_size) {
            return false;
        }
        self.allocations.insert(
            base,
            Protected {
                size,
                persisted: false,
            },
        );
        true
    }
}

impl PageTracker for ProtectedPageTracker {
    fn track(&mut self, base: Address, size: u64, _kind: AllocKind, memory: &mut dyn Runtime) {
        if !self.try_track(base, size, memory) {
            warn!("{:#x}: runtime refused write protection", base);
        }
    }

    fn untrack(&mut self, base: Address, memory: &mut dyn Runtime) {
        if self.allocations.remove(&base).is_some() {
            memory.unprotect_pages(base);
        }
    }

    fn dirty_pages(&mut self, base: Address, memory: &mut dyn Runtime) -> Result<Vec<u64>> {
        let Some(tracked) = self.allocations.get(&base).copied() else {
            return Ok(Vec::new());
        };
        if !tracked.persisted {
            return Ok((0..page_count(tracked.size, self.page_size)).collect());
        }
        let dirty = memory.written_pages(base, tracked.size, self.page_size)?;
        if !dirty.is_empty() {
            debug!("{:#x}: {} page(s) written by the host", base, dirty.len());
        }
        Ok(dirty)
    }

    fn reset(
        &mut self,
        base: Address,
        _contents: Option<&[u8]>,
        memory: &mut dyn Runtime,
    ) -> Result<()> {
        let page_size = self.page_size;
        let Some(tracked) = self.allocations.get_mut(&base) else {
            return Ok(());
        };
        if memory.protect_pages(base, tracked.size, page_size) {
            tracked.persisted = true;
        } else {
            // Protection lost: keep reporting every page
            warn!("{:#x}: runtime refused to re-arm write protection", base);
            tracked.persisted = false;
        }
        Ok(())
    }

    fn is_tracked(&self, base: Address) -> bool {
        self.allocations.contains_key(&base)
    }

    fn sees_device_writes(&self, _base: Address) -> bool {
        false
    }
}

/// Routes host-resident allocations to write protection when the runtime
/// supports it and everything else to content comparison
#[derive(Debug)]
pub struct ChangeTracker {
    protected: ProtectedPageTracker,
    shadow: ShadowPageTracker,
}

impl ChangeTracker {
    pub fn new(page_size: usize, track_device_memory: bool, fine_grain_always_dirty: bool) -> Self {
        Self {
            protected: ProtectedPageTracker::new(page_size),
            shadow: ShadowPageTracker::new(page_size, track_device_memory, fine_grain_always_dirty),
        }
    }

    fn tracker_for(&mut self, base: Address) -> &mut dyn PageTracker {
        if self.protected.is_tracked(base) {
            &mut self.protected
        } else {
            &mut self.shadow
        }
    }

    /// Whether `base` is watched through write protection
    pub fn is_protected(&self, base: Address) -> bool {
        self.protected.is_tracked(base)
    }
}

impl PageTracker for ChangeTracker {
    fn track(&mut self, base: Address, size: u64, kind: AllocKind, memory: &mut dyn Runtime) {
        if kind.is_host_resident() && self.protected.try_track(base, size, memory) {
            return;
        }
        self.shadow.track(base, size, kind, memory);
    }

    fn untrack(&mut self, base: Address, memory: &mut dyn Runtime) {
        self.tracker_for(base).untrack(base, memory);
    }

    fn dirty_pages(&mut self, base: Address, memory: &mut dyn Runtime) -> Result<Vec<u64>> {
        self.tracker_for(base).dirty_pages(base, memory)
    }

    fn reset(
        &mut self,
        base: Address,
        contents: Option<&[u8]>,
        memory: &mut dyn Runtime,
    ) -> Result<()> {
        self.tracker_for(base).reset(base, contents, memory)
    }

    fn is_tracked(&self, base: Address) -> bool {
        self.protected.is_tracked(base) || self.shadow.is_tracked(base)
    }

    fn sees_device_writes(&self, base: Address) -> bool {
        !self.protected.is_tracked(base) && self.shadow.sees_device_writes(base)
    }
}
