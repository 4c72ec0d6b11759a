//! Pointer virtualization between the recorded and the live address space
//!
//! Every SVM/USM allocation exists twice during replay: once at the address
//! the application saw when recording and once at the address the replay
//! runtime handed out. Both are tracked in their own [`RegionIndex`] and
//! paired by region, so a recorded pointer translates as
//! `live_base(pair(region(ptr))) + offset(ptr)`.

use crate::error::{EngineError, Result};
use crate::regions::{Region, RegionId, RegionIndex};
use retrace_shared::{Address, AllocFamily, AllocKind};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PointerSpace {
    recorded: RegionIndex,
    live: RegionIndex,
    /// recorded region -> live region
    pairs: HashMap<RegionId, RegionId>,
    /// recorded mapped pointer -> stack of live mapped pointers
    mapped: HashMap<Address, Vec<Address>>,
    log_rewrites: bool,
}

impl PointerSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rewrite_logging(mut self, enabled: bool) -> Self {
        self.log_rewrites = enabled;
        self
    }

    pub fn recorded(&self) -> &RegionIndex {
        &self.recorded
    }

    pub fn live(&self) -> &RegionIndex {
        &self.live
    }

    /// Pair a recorded allocation with the live allocation that replaces it
    pub fn bind_allocation(
        &mut self,
        kind: AllocKind,
        original_base: Address,
        live_base: Address,
        size: u64,
    ) -> Result<(RegionId, RegionId)> {
        let recorded = self.recorded.register(original_base, size, kind)?;
        let live = match self.live.register(live_base, size, kind) {
            Ok(id) => id,
            Err(e) => {
                self.recorded.unregister(original_base);
                return Err(e);
            }
        };
        self.pairs.insert(recorded, live);
        if self.log_rewrites {
            debug!(
                "bind {:?} allocation {:#x} -> {:#x} ({} bytes)",
                kind, original_base, live_base, size
            );
        }
        Ok((recorded, live))
    }

    /// Forget the allocation recorded at `original_base`; returns (recorded, live) regions
    pub fn release_allocation(&mut self, original_base: Address) -> Option<(Region, Region)> {
        let (recorded_id, recorded) = self.recorded.unregister(original_base)?;
        let live_id = self.pairs.remove(&recorded_id)?;
        let live_base = self.live.get(live_id)?.base;
        let (_, live) = self.live.unregister(live_base)?;
        Some((recorded, live))
    }

    /// Live region paired with the recorded region containing `ptr`
    pub fn live_region_for(&self, ptr: Address) -> Option<(RegionId, u64)> {
        let (recorded_id, offset) = self.recorded.resolve(ptr, false)?;
        self.pairs.get(&recorded_id).map(|live| (*live, offset))
    }

    /// Translate a recorded pointer to the live address space.
    ///
    /// `family` restricts the lookup when the API call fixes it; `exact_only`
    /// demands an allocation base (free calls).
    pub fn translate(
        &self,
        ptr: Address,
        family: Option<AllocFamily>,
        exact_only: bool,
    ) -> Result<Address> {
        if ptr == 0 {
            return Ok(0);
        }
        let resolved = match family {
            Some(family) => self.recorded.resolve_in(family, ptr, exact_only),
            None => self.recorded.resolve(ptr, exact_only),
        };
        let (recorded_id, offset) = resolved.ok_or(EngineError::UntrackedPointer { ptr })?;
        let live_id = self
            .pairs
            .get(&recorded_id)
            .ok_or(EngineError::UntrackedPointer { ptr })?;
        let live = self
            .live
            .address_of(*live_id, offset)
            .ok_or(EngineError::UntrackedPointer { ptr })?;
        if self.log_rewrites {
            debug!(
                "rewrite pointer {:#x} -> {:#x} ({} +{:#x})",
                ptr, live, live_id, offset
            );
        }
        Ok(live)
    }

    /// Translate a pointer value found inside copied allocation contents
    pub fn translate_embedded(&self, stored: Address) -> Option<Address> {
        self.translate(stored, None, false).ok()
    }

    /// Remember the live address of a region mapped at `original` during recording
    pub fn push_mapping(&mut self, original: Address, live: Address) {
        self.mapped.entry(original).or_default().push(live);
    }

    /// Most recent live mapping of `original`, without consuming it
    pub fn peek_mapping(&self, original: Address) -> Option<Address> {
        self.mapped.get(&original).and_then(|stack| stack.last()).copied()
    }

    /// Consume the most recent live mapping of `original`
    pub fn pop_mapping(&mut self, original: Address) -> Option<Address> {
        let stack = self.mapped.get_mut(&original)?;
        let live = stack.pop();
        if stack.is_empty() {
            self.mapped.remove(&original);
        }
        live
    }

    pub fn allocation_count(&self) -> usize {
        self.pairs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> PointerSpace {
        let mut space = PointerSpace::new();
        space
            .bind_allocation(AllocKind::UsmDevice, 0x1000, 0xA000, 0x400)
            .unwrap();
        space
            .bind_allocation(AllocKind::SvmCoarseGrain, 0x8000, 0x3_0000, 0x100)
            .unwrap();
        space
    }

    #[test]
    fn test_translate_preserves_offset() {
        let space = space();
        assert_eq!(space.translate(0x1000, None, false).unwrap(), 0xA000);
        assert_eq!(space.translate(0x1123, None, false).unwrap(), 0xA123);
        assert_eq!(
            space
                .translate(0x8010, Some(AllocFamily::Svm), false)
                .unwrap(),
            0x3_0010
        );
    }

    #[test]
    fn test_family_restriction() {
        let space = space();
        assert!(matches!(
            space.translate(0x8010, Some(AllocFamily::Usm), false),
            Err(EngineError::UntrackedPointer { ptr: 0x8010 })
        ));
    }

    #[test]
    fn test_exact_only_rejects_interior() {
        let space = space();
        assert!(space.translate(0x1004, None, true).is_err());
        assert_eq!(space.translate(0x1000, None, true).unwrap(), 0xA000);
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(PointerSpace::new().translate(0, None, false).unwrap(), 0);
    }

    #[test]
    fn test_release_allocation() {
        let mut space = space();
        let (recorded, live) = space.release_allocation(0x1000).unwrap();
        assert_eq!(recorded.base, 0x1000);
        assert_eq!(live.base, 0xA000);
        assert!(space.translate(0x1000, None, false).is_err());
        assert_eq!(space.allocation_count(), 1);
    }

    #[test]
    fn test_mapping_stack_is_lifo() {
        let mut space = PointerSpace::new();
        space.push_mapping(0x500, 0x9000);
        space.push_mapping(0x500, 0x9800);
        assert_eq!(space.peek_mapping(0x500), Some(0x9800));
        assert_eq!(space.pop_mapping(0x500), Some(0x9800));
        assert_eq!(space.pop_mapping(0x500), Some(0x9000));
        assert_eq!(space.pop_mapping(0x500), None);
    }
}
