//! Kernel Argument & Indirect-Pointer Table
//!
//! Bound kernel arguments are copied at bind time (the application may reuse
//! its source buffer right after the call) and classified so that pointer
//! arguments can be resolved against the allocation index before a launch.
//! The indirect-pointer half of this module remembers which byte offsets
//! inside an allocation themselves hold pointers into other allocations.

use crate::regions::{RegionId, RegionIndex};
use retrace_shared::{
    Address, AllocFamily, ArgValue, Call, ExecInfo, Handle, HandleKind, IndirectAccess,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// What a bound argument holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Value,
    /// Local memory reservation, no bytes
    Local,
    Mem,
    Sampler,
    SvmPointer,
    UsmPointer,
}

impl ArgClass {
    pub fn is_pointer(self) -> bool {
        matches!(self, ArgClass::SvmPointer | ArgClass::UsmPointer)
    }
}

/// Which call bound the argument; selects the resolver for pointer values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Normal,
    UsmSetter,
    SvmSetter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelArg {
    pub size: u64,
    pub bytes: Vec<u8>,
    pub class: ArgClass,
    pub mode: BindingMode,
}

impl KernelArg {
    /// Pointer value for pointer-classified arguments
    pub fn pointer(&self) -> Option<Address> {
        if !self.class.is_pointer() {
            return None;
        }
        read_u64(&self.bytes, 0)
    }

    /// Handle value for memory object and sampler arguments
    fn handle(&self) -> Handle {
        Handle(read_u64(&self.bytes, 0).unwrap_or(0))
    }

    fn binds(&self, kind: HandleKind, handle: Handle) -> bool {
        let class = match kind {
            HandleKind::Mem => ArgClass::Mem,
            HandleKind::Sampler => ArgClass::Sampler,
            _ => return false,
        };
        self.class == class && self.handle() == handle
    }
}

/// Everything bound on one kernel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelRecord {
    pub args: BTreeMap<u32, KernelArg>,
    pub indirect: IndirectAccess,
    pub svm_pointers: Vec<Address>,
    pub usm_pointers: Vec<Address>,
}

#[derive(Debug, Default)]
pub struct KernelArgTable {
    kernels: HashMap<Handle, KernelRecord>,
}

impl KernelArgTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an argument, overwriting whatever was bound at `index`
    pub fn bind(&mut self, kernel: Handle, index: u32, arg: KernelArg) {
        self.kernels.entry(kernel).or_default().args.insert(index, arg);
    }

    pub fn get(&self, kernel: Handle) -> Option<&KernelRecord> {
        self.kernels.get(&kernel)
    }

    /// Record an argument or exec-info call; other calls are ignored.
    ///
    /// Pointers bound through the generic setter are classified by the
    /// allocation family they resolve to.
    pub fn record(&mut self, call: &Call, regions: &RegionIndex) {
        match call {
            Call::SetKernelArg {
                kernel,
                index,
                size,
                value,
            } => {
                let (class, bytes) = match value {
                    ArgValue::Bytes(bytes) => (ArgClass::Value, bytes.clone()),
                    ArgValue::Local => (ArgClass::Local, Vec::new()),
                    ArgValue::Mem(mem) => (ArgClass::Mem, mem.0.to_le_bytes().to_vec()),
                    ArgValue::Sampler(sampler) => {
                        (ArgClass::Sampler, sampler.0.to_le_bytes().to_vec())
                    }
                    ArgValue::Pointer(ptr) => {
                        let class = match regions.resolve(*ptr, false) {
                            Some((id, _)) => match regions.get(id).map(|r| r.kind.family()) {
                                Some(AllocFamily::Svm) => ArgClass::SvmPointer,
                                _ => ArgClass::UsmPointer,
                            },
                            None => ArgClass::Value,
                        };
                        (class, ptr.to_le_bytes().to_vec())
                    }
                };
                self.bind(
                    *kernel,
                    *index,
                    KernelArg {
                        size: *size,
                        bytes,
                        class,
                        mode: BindingMode::Normal,
                    },
                );
            }
            Call::SetKernelArgSvmPointer { kernel, index, ptr } => self.bind(
                *kernel,
                *index,
                KernelArg {
                    size: 8,
                    bytes: ptr.to_le_bytes().to_vec(),
                    class: ArgClass::SvmPointer,
                    mode: BindingMode::SvmSetter,
                },
            ),
            Call::SetKernelArgMemPointer { kernel, index, ptr } => self.bind(
                *kernel,
                *index,
                KernelArg {
                    size: 8,
                    bytes: ptr.to_le_bytes().to_vec(),
                    class: ArgClass::UsmPointer,
                    mode: BindingMode::UsmSetter,
                },
            ),
            Call::SetKernelExecInfo { kernel, info } => {
                let record = self.kernels.entry(*kernel).or_default();
                match info {
                    ExecInfo::IndirectAccess { access, enabled } => {
                        record.indirect.set(*access, *enabled);
                    }
                    ExecInfo::SvmPointers(ptrs) => record.svm_pointers = ptrs.clone(),
                    ExecInfo::UsmPointers(ptrs) => record.usm_pointers = ptrs.clone(),
                }
            }
            _ => {}
        }
    }

    /// Drop all bindings of a kernel
    pub fn clear(&mut self, kernel: Handle) {
        self.kernels.remove(&kernel);
    }

    /// Drop the bindings of a memory object or sampler that was destroyed
    pub fn forget_handle(&mut self, kind: HandleKind, handle: Handle) {
        for (kernel, record) in &mut self.kernels {
            record.args.retain(|index, arg| {
                let stale = arg.binds(kind, handle);
                if stale {
                    debug!("kernel {} arg {}: {:?} {} destroyed, unbinding", kernel, index, kind, handle);
                }
                !stale
            });
        }
    }

    /// Drop pointer bindings into the freed allocation `base..base + size`
    pub fn forget_allocation(&mut self, base: Address, size: u64) {
        let end = base.saturating_add(size.max(1));
        let inside = |ptr: &Address| (base..end).contains(ptr);
        for (kernel, record) in &mut self.kernels {
            record.args.retain(|index, arg| {
                let stale = arg.pointer().is_some_and(|ptr| inside(&ptr));
                if stale {
                    debug!("kernel {} arg {}: allocation {:#x} freed, unbinding", kernel, index, base);
                }
                !stale
            });
            record.svm_pointers.retain(|ptr| !inside(ptr));
            record.usm_pointers.retain(|ptr| !inside(ptr));
        }
    }

    /// Allocations a launch of `kernel` may touch, with the in-region offset
    /// each was referenced at.
    ///
    /// Union of the bound pointer arguments, the pointers declared through
    /// exec info and every allocation whose kind is covered by a declared
    /// indirect access mode. Each region appears once.
    pub fn indirect_offsets_for(&self, kernel: Handle, regions: &RegionIndex) -> Vec<(RegionId, u64)> {
        let Some(record) = self.kernels.get(&kernel) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |resolved: Option<(RegionId, u64)>| {
            if let Some((id, offset)) = resolved {
                if seen.insert(id) {
                    out.push((id, offset));
                }
            }
        };

        for (index, arg) in &record.args {
            let Some(ptr) = arg.pointer() else {
                continue;
            };
            let resolved = match arg.mode {
                // The generic setter was handed the pointer's location
                BindingMode::Normal => regions.resolve_arg(0, true, false, |at| {
                    read_u64(&arg.bytes, usize::try_from(at).ok()?)
                }),
                BindingMode::UsmSetter => regions.resolve_in(AllocFamily::Usm, ptr, false),
                BindingMode::SvmSetter => regions.resolve_in(AllocFamily::Svm, ptr, false),
            };
            if resolved.is_none() && ptr != 0 {
                warn!("kernel {} arg {} points outside tracked memory: {:#x}", kernel, index, ptr);
            }
            push(resolved);
        }
        for ptr in &record.svm_pointers {
            push(regions.resolve_in(AllocFamily::Svm, *ptr, false));
        }
        for ptr in &record.usm_pointers {
            push(regions.resolve_in(AllocFamily::Usm, *ptr, false));
        }
        if !record.indirect.is_empty() {
            for (id, region) in regions.iter() {
                if record.indirect.covers(region.kind) {
                    push(Some((id, 0)));
                }
            }
        }
        out
    }

    /// Calls that rebind everything recorded for `kernel`, in argument order
    pub fn rebind_calls(&self, kernel: Handle) -> Vec<Call> {
        let Some(record) = self.kernels.get(&kernel) else {
            return Vec::new();
        };
        let mut calls: Vec<Call> = record
            .args
            .iter()
            .map(|(index, arg)| {
                let index = *index;
                match (arg.class, arg.mode) {
                    (ArgClass::SvmPointer, BindingMode::SvmSetter) => Call::SetKernelArgSvmPointer {
                        kernel,
                        index,
                        ptr: read_u64(&arg.bytes, 0).unwrap_or(0),
                    },
                    (ArgClass::UsmPointer, BindingMode::UsmSetter) => Call::SetKernelArgMemPointer {
                        kernel,
                        index,
                        ptr: read_u64(&arg.bytes, 0).unwrap_or(0),
                    },
                    (class, _) => Call::SetKernelArg {
                        kernel,
                        index,
                        size: arg.size,
                        value: match class {
                            ArgClass::Local => ArgValue::Local,
                            ArgClass::Mem => ArgValue::Mem(arg.handle()),
                            ArgClass::Sampler => ArgValue::Sampler(arg.handle()),
                            ArgClass::SvmPointer | ArgClass::UsmPointer => {
                                ArgValue::Pointer(read_u64(&arg.bytes, 0).unwrap_or(0))
                            }
                            ArgClass::Value => ArgValue::Bytes(arg.bytes.clone()),
                        },
                    },
                }
            })
            .collect();

        if !record.indirect.is_empty() {
            calls.push(Call::SetKernelExecInfo {
                kernel,
                info: ExecInfo::IndirectAccess {
                    access: record.indirect,
                    enabled: true,
                },
            });
        }
        if !record.svm_pointers.is_empty() {
            calls.push(Call::SetKernelExecInfo {
                kernel,
                info: ExecInfo::SvmPointers(record.svm_pointers.clone()),
            });
        }
        if !record.usm_pointers.is_empty() {
            calls.push(Call::SetKernelExecInfo {
                kernel,
                info: ExecInfo::UsmPointers(record.usm_pointers.clone()),
            });
        }
        calls
    }
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let chunk: [u8; 8] = bytes.get(at..at.checked_add(8)?)?.try_into().ok()?;
    Some(u64::from_le_bytes(chunk))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PointerOffset {
    offset: u64,
    translated: bool,
}

/// Byte offsets inside allocations that hold pointers to other allocations,
/// keyed by allocation base
#[derive(Debug, Default)]
pub struct IndirectPointerTable {
    allocations: HashMap<Address, Vec<PointerOffset>>,
}

impl IndirectPointerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `offsets` of the allocation at `base` as pointer-holding.
    ///
    /// Returns true when the set of offsets changed.
    pub fn register_indirect_pointer_offsets(&mut self, base: Address, offsets: &[u64]) -> bool {
        let entry = self.allocations.entry(base).or_default();
        let mut changed = false;
        for offset in offsets {
            if !entry.iter().any(|p| p.offset == *offset) {
                entry.push(PointerOffset {
                    offset: *offset,
                    translated: false,
                });
                changed = true;
            }
        }
        entry.sort_by_key(|p| p.offset);
        changed
    }

    pub fn offsets(&self, base: Address) -> Vec<u64> {
        self.allocations
            .get(&base)
            .map(|entry| entry.iter().map(|p| p.offset).collect())
            .unwrap_or_default()
    }

    pub fn has_offsets(&self, base: Address) -> bool {
        self.allocations.get(&base).is_some_and(|entry| !entry.is_empty())
    }

    /// Rewrite the pointers stored in `bytes`, a copy of the allocation at
    /// `base` starting `start` bytes into it.
    ///
    /// Every marked position is translated at most once until
    /// [`reset_translated`](Self::reset_translated); values that `translate`
    /// cannot resolve are left untouched and stay eligible. Returns the number
    /// of values rewritten.
    pub fn translate_buffer(
        &mut self,
        base: Address,
        start: u64,
        bytes: &mut [u8],
        translate: impl Fn(Address) -> Option<Address>,
    ) -> usize {
        let Some(entry) = self.allocations.get_mut(&base) else {
            return 0;
        };
        let mut rewritten = 0;
        for pointer in entry.iter_mut().filter(|p| !p.translated) {
            let Some(at) = pointer.offset.checked_sub(start) else {
                continue;
            };
            let Ok(at) = usize::try_from(at) else {
                continue;
            };
            let Some(stored) = read_u64(bytes, at) else {
                continue;
            };
            if stored == 0 {
                pointer.translated = true;
                continue;
            }
            match translate(stored) {
                Some(live) => {
                    if let Some(slot) = bytes.get_mut(at..at + 8) {
                        slot.copy_from_slice(&live.to_le_bytes());
                    }
                    pointer.translated = true;
                    rewritten += 1;
                }
                None => debug!(
                    "embedded pointer {:#x} at {:#x}+{:#x} not translated",
                    stored, base, pointer.offset
                ),
            }
        }
        rewritten
    }

    /// Clear the one-shot flags, e.g. after fresh contents were read
    pub fn reset_translated(&mut self, base: Address) {
        if let Some(entry) = self.allocations.get_mut(&base) {
            for pointer in entry {
                pointer.translated = false;
            }
        }
    }

    pub fn remove(&mut self, base: Address) {
        self.allocations.remove(&base);
    }
}

/// Offsets of 8-byte aligned values in `bytes` that point into a tracked allocation
pub fn scan_embedded_pointers(bytes: &[u8], regions: &RegionIndex) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let value = u64::from_le_bytes(chunk.try_into().ok()?);
            (value != 0 && regions.resolve(value, false).is_some()).then_some(i as u64 * 8)
        })
        .collect()
}
