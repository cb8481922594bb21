//! Property remap engine.
//!
//! A consumer reads an object's fields in its own fixed order
//! ([`FieldLayout`]), but the wire trait may declare the same properties
//! in a different order. The engine builds, once per
//! (wire trait × layout) pair, a positional [`RemapTable`]; every later
//! read of an object sharing that trait is pure array indexing with no
//! string comparison.
//!
//! Slot convention: the decoded-values scratch buffer keeps the
//! `Undefined` sentinel at position 0 and the wire's property `i` at
//! position `i + 1`. A remap entry is therefore `wire position + 1`, or
//! [`REMAP_ABSENT`] (0) for a field the wire trait does not declare —
//! an absent field still resolves to a valid buffer slot without a
//! branch.
//!
//! The cache hangs off the [`TraitDef`] (see
//! [`TraitDef::cached_remap`]), so it is shared by every Reader that
//! decodes the shape for the lifetime of the process.

use crate::error::{CodecError, Result};
use crate::trait_def::TraitDef;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Remap slot for a field absent from the wire trait: resolves to the
/// sentinel at scratch position 0.
pub const REMAP_ABSENT: u32 = 0;

/// A consumer's expected field order. Each layout gets a unique id at
/// construction; the per-trait remap cache is keyed by it.
#[derive(Debug)]
pub struct FieldLayout {
    id: u64,
    fields: Vec<Arc<str>>,
    strict: bool,
    index: OnceLock<FxHashMap<Arc<str>, usize>>,
}

impl FieldLayout {
    /// Lenient layout: fields missing from the wire trait read as
    /// `Undefined`.
    pub fn new(fields: Vec<Arc<str>>) -> Arc<Self> {
        Self::alloc(fields, false)
    }

    /// Strict layout: a field missing from a non-dynamic wire trait is
    /// an [`CodecError::AmbiguousSchema`] error.
    pub fn new_strict(fields: Vec<Arc<str>>) -> Arc<Self> {
        Self::alloc(fields, true)
    }

    fn alloc(fields: Vec<Arc<str>>, strict: bool) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(FieldLayout {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fields,
            strict,
            index: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fields(&self) -> &[Arc<str>] {
        &self.fields
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Position of `name` within this layout.
    pub fn position(&self, name: &str) -> Option<usize> {
        let map = self.index.get_or_init(|| {
            self.fields
                .iter()
                .enumerate()
                .map(|(i, f)| (f.clone(), i))
                .collect()
        });
        map.get(name).copied()
    }
}

/// Cached positional translation for one (wire trait × layout) pair.
#[derive(Debug)]
pub struct RemapTable {
    slots: Vec<u32>,
}

impl RemapTable {
    /// Scratch-buffer slot for the layout's field `i`:
    /// `wire position + 1`, or [`REMAP_ABSENT`].
    pub fn slot(&self, i: usize) -> u32 {
        self.slots.get(i).copied().unwrap_or(REMAP_ABSENT)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Remap table for reading `trait_def` in `layout` order. Cached on the
/// trait after the first build; later calls return the shared table.
pub fn remap_for(trait_def: &Arc<TraitDef>, layout: &Arc<FieldLayout>) -> Result<Arc<RemapTable>> {
    if let Some(cached) = trait_def.cached_remap(layout.id()) {
        return Ok(cached);
    }

    let mut slots = Vec::with_capacity(layout.fields().len());
    for field in layout.fields() {
        match trait_def.property_index(field) {
            Some(pos) => slots.push(pos as u32 + 1),
            None => {
                if layout.is_strict() && !trait_def.is_dynamic() {
                    return Err(CodecError::ambiguous(format!(
                        "field {:?} is not declared by wire trait {:?}",
                        field,
                        trait_def.name()
                    )));
                }
                slots.push(REMAP_ABSENT);
            }
        }
    }
    Ok(trait_def.store_remap(layout.id(), Arc::new(RemapTable { slots })))
}

// =============================================================================
// Tests
// =============================================================================
