//! Allocation Region Index
//!
//! Interval index over pointer-addressed allocations (SVM and USM). Regions
//! live in an arena and are referred to by [`RegionId`], a generation-checked
//! index that stays valid for the lifetime of the region and never aliases a
//! later region reusing the same slot. Lookups by address go through one
//! ordered map per allocator family.

use crate::error::{EngineError, Result};
use retrace_shared::{Address, AllocFamily, AllocKind};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier of a tracked region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}.{}", self.index, self.generation)
    }
}

/// One pointer-addressed allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: Address,
    pub size: u64,
    pub kind: AllocKind,
}

impl Region {
    /// One past the last byte; zero-sized allocations still own their base
    pub fn end(&self) -> Address {
        self.base.saturating_add(self.size.max(1))
    }

    pub fn contains(&self, ptr: Address) -> bool {
        ptr >= self.base && ptr < self.end()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    region: Option<Region>,
}

#[derive(Debug, Default)]
pub struct RegionIndex {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    svm: BTreeMap<Address, RegionId>,
    usm: BTreeMap<Address, RegionId>,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn family_map(&self, family: AllocFamily) -> &BTreeMap<Address, RegionId> {
        match family {
            AllocFamily::Svm => &self.svm,
            AllocFamily::Usm => &self.usm,
        }
    }

    fn family_map_mut(&mut self, family: AllocFamily) -> &mut BTreeMap<Address, RegionId> {
        match family {
            AllocFamily::Svm => &mut self.svm,
            AllocFamily::Usm => &mut self.usm,
        }
    }

    /// Track a new allocation. Fails if it overlaps a live allocation of the same family.
    pub fn register(&mut self, base: Address, size: u64, kind: AllocKind) -> Result<RegionId> {
        let candidate = Region { base, size, kind };
        let family = kind.family();
        let map = self.family_map(family);

        let overlaps_prev = map
            .range(..=base)
            .next_back()
            .and_then(|(_, id)| self.get(*id))
            .is_some_and(|prev| prev.end() > base);
        let overlaps_next = map
            .range(base..candidate.end())
            .next()
            .is_some();
        if overlaps_prev || overlaps_next {
            return Err(EngineError::OverlappingAllocation { base, size });
        }

        let id = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.region = Some(candidate);
                RegionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    region: Some(candidate),
                });
                RegionId {
                    index,
                    generation: 0,
                }
            }
        };
        self.family_map_mut(family).insert(base, id);
        Ok(id)
    }

    /// Stop tracking the allocation based exactly at `base`
    pub fn unregister(&mut self, base: Address) -> Option<(RegionId, Region)> {
        let (family, id) = [AllocFamily::Svm, AllocFamily::Usm]
            .into_iter()
            .find_map(|family| self.family_map(family).get(&base).map(|id| (family, *id)))?;
        self.family_map_mut(family).remove(&base);
        let slot = &mut self.slots[id.index as usize];
        let region = slot.region.take()?;
        self.free_slots.push(id.index);
        Some((id, region))
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.region.as_ref())
    }

    /// Region based exactly at `base`
    pub fn at_base(&self, base: Address) -> Option<RegionId> {
        self.svm.get(&base).or_else(|| self.usm.get(&base)).copied()
    }

    /// Resolve `ptr` to `(region, offset)` within one family.
    ///
    /// With `exact_only` only a region base matches.
    pub fn resolve_in(
        &self,
        family: AllocFamily,
        ptr: Address,
        exact_only: bool,
    ) -> Option<(RegionId, u64)> {
        let map = self.family_map(family);
        if exact_only {
            return map.get(&ptr).map(|id| (*id, 0));
        }
        let (_, id) = map.range(..=ptr).next_back()?;
        let region = self.get(*id)?;
        region.contains(ptr).then(|| (*id, ptr - region.base))
    }

    /// Resolve `ptr` against both families
    pub fn resolve(&self, ptr: Address, exact_only: bool) -> Option<(RegionId, u64)> {
        self.resolve_in(AllocFamily::Usm, ptr, exact_only)
            .or_else(|| self.resolve_in(AllocFamily::Svm, ptr, exact_only))
    }

    /// Resolve a pointer argument that may have been delivered indirectly.
    ///
    /// When `indirect` is set, `value` is the location of the pointer and
    /// `deref` reads it; otherwise `value` is the pointer itself.
    pub fn resolve_arg(
        &self,
        value: Address,
        indirect: bool,
        exact_only: bool,
        deref: impl FnOnce(Address) -> Option<Address>,
    ) -> Option<(RegionId, u64)> {
        let ptr = if indirect { deref(value)? } else { value };
        self.resolve(ptr, exact_only)
    }

    /// Address `offset` bytes into `id`
    pub fn address_of(&self, id: RegionId, offset: u64) -> Option<Address> {
        self.get(id).map(|region| region.base + offset)
    }

    /// Live regions ordered by base address, USM first
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> + '_ {
        self.usm
            .values()
            .chain(self.svm.values())
            .filter_map(move |id| self.get(*id).map(|region| (*id, region)))
    }

    pub fn len(&self) -> usize {
        self.svm.len() + self.usm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
