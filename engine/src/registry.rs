//! Handle Mapping Registry
//!
//! Translates recorded ("original") handles into the live handles issued by
//! the replay runtime. One independent table per handle kind; handles never
//! cross kinds. Several originals may share one live value (a runtime that
//! reuses a freed handle value hands the same live identity out again), so
//! each table counts how many originals currently point at every live handle.

use crate::error::{EngineError, Result};
use retrace_shared::{Handle, HandleKind};
use std::collections::HashMap;
use tracing::debug;

/// Outcome of [`HandleTable::unbind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbound {
    /// The original was not bound
    NotBound,
    /// Mapping removed; other originals still map to the same live handle
    Shared(Handle),
    /// Mapping removed and no original refers to the live handle anymore
    Released(Handle),
}

/// Bidirectional original→live table for one handle kind
#[derive(Debug, Default)]
pub struct HandleTable {
    forward: HashMap<Handle, Handle>,
    /// Number of originals mapped to each live handle
    live_refs: HashMap<Handle, usize>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `original` to `live`, replacing any previous binding of `original`
    pub fn bind(&mut self, original: Handle, live: Handle) {
        if original.is_null() {
            return;
        }
        if let Some(previous) = self.forward.insert(original, live) {
            self.drop_live_ref(previous);
        }
        *self.live_refs.entry(live).or_insert(0) += 1;
    }

    /// Live handle for `original`; null always maps to null
    pub fn lookup(&self, original: Handle) -> Option<Handle> {
        if original.is_null() {
            return Some(Handle::NULL);
        }
        self.forward.get(&original).copied()
    }

    /// Original handle mapped to `live`.
    ///
    /// Linear scan; only used for diagnostics and reconstruction bookkeeping.
    pub fn reverse_lookup(&self, live: Handle) -> Option<Handle> {
        self.forward
            .iter()
            .filter(|(_, l)| **l == live)
            .map(|(original, _)| *original)
            .min()
    }

    pub fn unbind(&mut self, original: Handle) -> Unbound {
        match self.forward.remove(&original) {
            None => Unbound::NotBound,
            Some(live) => {
                if self.drop_live_ref(live) {
                    Unbound::Released(live)
                } else {
                    Unbound::Shared(live)
                }
            }
        }
    }

    /// Whether any original currently maps to `live`
    pub fn is_live_bound(&self, live: Handle) -> bool {
        self.live_refs.contains_key(&live)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Returns true when the last reference to `live` was dropped
    fn drop_live_ref(&mut self, live: Handle) -> bool {
        match self.live_refs.get_mut(&live) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.live_refs.remove(&live);
                true
            }
            None => true,
        }
    }
}

/// All per-kind tables
#[derive(Debug, Default)]
pub struct HandleRegistry {
    tables: HashMap<HandleKind, HandleTable>,
    log_rewrites: bool,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a debug line for every lookup
    pub fn with_rewrite_logging(mut self, enabled: bool) -> Self {
        self.log_rewrites = enabled;
        self
    }

    pub fn table(&self, kind: HandleKind) -> Option<&HandleTable> {
        self.tables.get(&kind)
    }

    pub fn bind(&mut self, kind: HandleKind, original: Handle, live: Handle) {
        if self.log_rewrites {
            debug!("bind {} {} -> {}", kind, original, live);
        }
        self.tables.entry(kind).or_default().bind(original, live);
    }

    /// Live handle for `original`, failing with `UnmappedHandle` when absent
    pub fn lookup(&self, kind: HandleKind, original: Handle) -> Result<Handle> {
        let live = self
            .tables
            .get(&kind)
            .and_then(|table| table.lookup(original))
            .or_else(|| original.is_null().then_some(Handle::NULL))
            .ok_or(EngineError::UnmappedHandle {
                kind,
                handle: original,
            })?;
        if self.log_rewrites && !original.is_null() {
            debug!("rewrite {} {} -> {}", kind, original, live);
        }
        Ok(live)
    }

    pub fn reverse_lookup(&self, kind: HandleKind, live: Handle) -> Option<Handle> {
        self.tables
            .get(&kind)
            .and_then(|table| table.reverse_lookup(live))
    }

    pub fn unbind(&mut self, kind: HandleKind, original: Handle) -> Unbound {
        let outcome = self
            .tables
            .get_mut(&kind)
            .map(|table| table.unbind(original))
            .unwrap_or(Unbound::NotBound);
        if self.log_rewrites {
            debug!("unbind {} {}: {:?}", kind, original, outcome);
        }
        outcome
    }

    /// Drop every mapping that targets `live`; returns the originals removed
    pub fn unbind_live(&mut self, kind: HandleKind, live: Handle) -> Vec<Handle> {
        let Some(table) = self.tables.get_mut(&kind) else {
            return Vec::new();
        };
        let mut originals: Vec<Handle> = table
            .forward
            .iter()
            .filter(|(_, l)| **l == live)
            .map(|(original, _)| *original)
            .collect();
        originals.sort();
        for original in &originals {
            table.unbind(*original);
        }
        originals
    }

    /// Total number of bindings across all kinds
    pub fn len(&self) -> usize {
        self.tables.values().map(HandleTable::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_maps_to_null() {
        let registry = HandleRegistry::new();
        assert_eq!(
            registry.lookup(HandleKind::Mem, Handle::NULL).unwrap(),
            Handle::NULL
        );
    }

    #[test]
    fn test_unmapped_handle() {
        let registry = HandleRegistry::new();
        let err = registry.lookup(HandleKind::Mem, Handle(0x42)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnmappedHandle {
                kind: HandleKind::Mem,
                handle: Handle(0x42)
            }
        ));
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut registry = HandleRegistry::new();
        registry.bind(HandleKind::Mem, Handle(1), Handle(100));
        assert!(registry.lookup(HandleKind::Kernel, Handle(1)).is_err());
        assert_eq!(
            registry.lookup(HandleKind::Mem, Handle(1)).unwrap(),
            Handle(100)
        );
    }

    #[test]
    fn test_shared_live_identity_survives_first_unbind() {
        let mut table = HandleTable::new();
        // Runtime reused the live value for a second object
        table.bind(Handle(1), Handle(500));
        table.bind(Handle(2), Handle(500));

        assert_eq!(table.unbind(Handle(1)), Unbound::Shared(Handle(500)));
        assert!(table.is_live_bound(Handle(500)));
        assert_eq!(table.lookup(Handle(2)), Some(Handle(500)));

        assert_eq!(table.unbind(Handle(2)), Unbound::Released(Handle(500)));
        assert!(!table.is_live_bound(Handle(500)));
        assert_eq!(table.unbind(Handle(2)), Unbound::NotBound);
    }

    #[test]
    fn test_rebind_moves_live_reference() {
        let mut table = HandleTable::new();
        table.bind(Handle(1), Handle(10));
        table.bind(Handle(1), Handle(20));
        assert!(!table.is_live_bound(Handle(10)));
        assert_eq!(table.lookup(Handle(1)), Some(Handle(20)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reverse_lookup() {
        let mut registry = HandleRegistry::new();
        registry.bind(HandleKind::Queue, Handle(7), Handle(70));
        registry.bind(HandleKind::Queue, Handle(8), Handle(80));
        assert_eq!(
            registry.reverse_lookup(HandleKind::Queue, Handle(80)),
            Some(Handle(8))
        );
        assert_eq!(registry.reverse_lookup(HandleKind::Queue, Handle(90)), None);
    }

    #[test]
    fn test_unbind_live_removes_all_originals() {
        let mut registry = HandleRegistry::new();
        registry.bind(HandleKind::Event, Handle(1), Handle(9));
        registry.bind(HandleKind::Event, Handle(2), Handle(9));
        registry.bind(HandleKind::Event, Handle(3), Handle(10));
        assert_eq!(
            registry.unbind_live(HandleKind::Event, Handle(9)),
            vec![Handle(1), Handle(2)]
        );
        assert_eq!(registry.len(), 1);
    }
}
