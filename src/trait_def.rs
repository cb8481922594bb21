//! Class-shape descriptors ("traits").
//!
//! A [`TraitDef`] describes one wire-level class shape: name, ordered
//! declared property names, and the dynamic/externalizable flags. Shapes
//! are immutable after construction and are deduplicated by a content
//! hash over `(name, flags, properties)` — two shapes with equal hash
//! input are interchangeable on the wire and share one trait-table slot.
//!
//! ## Invariants
//!
//! - `dynamic` and `externalizable` are mutually exclusive
//! - externalizable shapes declare no property list (the payload is opaque)
//! - property names are unique within one shape
//! - interned shapes live for the process; caches hung off a shape
//!   (name→index map, remap tables) amortize across every Reader that
//!   decodes the shape

use crate::error::{CodecError, Result};
use crate::remap::RemapTable;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock};
use xxhash_rust::xxh64::Xxh64;

/// Immutable wire-level class shape.
#[derive(Debug)]
pub struct TraitDef {
    name: Arc<str>,
    properties: Vec<Arc<str>>,
    dynamic: bool,
    externalizable: bool,
    shape_hash: u64,
    /// Full name -> position map, built lazily on first lookup.
    index: OnceLock<FxHashMap<Arc<str>, usize>>,
    /// One-slot last-lookup memo. Misses are recorded too, so probing a
    /// dynamic key does not poison later declared-name lookups.
    memo: Mutex<Option<(Arc<str>, Option<usize>)>>,
    /// Remap tables keyed by consumer layout id (see [`crate::remap`]).
    remap_cache: Mutex<FxHashMap<u64, Arc<RemapTable>>>,
}

impl TraitDef {
    /// Validate and construct a shape.
    pub fn new(
        name: impl Into<Arc<str>>,
        properties: Vec<Arc<str>>,
        dynamic: bool,
        externalizable: bool,
    ) -> Result<Self> {
        let name = name.into();
        if dynamic && externalizable {
            return Err(CodecError::InvalidTrait(format!(
                "{:?} is both dynamic and externalizable",
                name
            )));
        }
        if externalizable && !properties.is_empty() {
            return Err(CodecError::InvalidTrait(format!(
                "externalizable {:?} declares {} properties",
                name,
                properties.len()
            )));
        }
        for (i, p) in properties.iter().enumerate() {
            if properties[..i].iter().any(|q| q == p) {
                return Err(CodecError::ambiguous(format!(
                    "duplicate property {:?} in trait {:?}",
                    p, name
                )));
            }
        }
        let shape_hash = compute_shape_hash(&name, dynamic, externalizable, &properties);
        Ok(TraitDef {
            name,
            properties,
            dynamic,
            externalizable,
            shape_hash,
            index: OnceLock::new(),
            memo: Mutex::new(None),
            remap_cache: Mutex::new(FxHashMap::default()),
        })
    }

    /// Validate, then return the process-wide shared instance for this
    /// shape. Repeated interning of an equal shape returns the same `Arc`,
    /// so per-shape caches amortize across streams.
    pub fn intern(
        name: impl Into<Arc<str>>,
        properties: Vec<Arc<str>>,
        dynamic: bool,
        externalizable: bool,
    ) -> Result<Arc<Self>> {
        static SHAPE_POOL: OnceLock<Mutex<FxHashMap<u64, Arc<TraitDef>>>> = OnceLock::new();

        let def = TraitDef::new(name, properties, dynamic, externalizable)?;
        let pool = SHAPE_POOL.get_or_init(|| Mutex::new(FxHashMap::default()));
        let mut pool = pool.lock();
        Ok(pool
            .entry(def.shape_hash)
            .or_insert_with(|| Arc::new(def))
            .clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared property names in declared order. Key-enumeration over a
    /// shape follows this order.
    pub fn properties(&self) -> &[Arc<str>] {
        &self.properties
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_externalizable(&self) -> bool {
        self.externalizable
    }

    /// Content hash over `(name, flags, properties)`.
    pub fn shape_hash(&self) -> u64 {
        self.shape_hash
    }

    /// Position of a declared property, or `None` for unknown (e.g.
    /// dynamic) keys. Checks the one-slot memo first; on memo miss the
    /// full map is built once and consulted thereafter.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        {
            let memo = self.memo.lock();
            if let Some((last, result)) = memo.as_ref() {
                if last.as_ref() == name {
                    return *result;
                }
            }
        }

        let map = self.index.get_or_init(|| {
            self.properties
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), i))
                .collect()
        });

        let (key, result) = match map.get_key_value(name) {
            Some((k, idx)) => (k.clone(), Some(*idx)),
            None => (Arc::from(name), None),
        };
        *self.memo.lock() = Some((key, result));
        result
    }

    pub(crate) fn cached_remap(&self, layout_id: u64) -> Option<Arc<RemapTable>> {
        self.remap_cache.lock().get(&layout_id).cloned()
    }

    pub(crate) fn store_remap(&self, layout_id: u64, table: Arc<RemapTable>) -> Arc<RemapTable> {
        self.remap_cache
            .lock()
            .entry(layout_id)
            .or_insert(table)
            .clone()
    }
}

impl PartialEq for TraitDef {
    /// Shapes compare by wire identity (the shape hash).
    fn eq(&self, other: &Self) -> bool {
        self.shape_hash == other.shape_hash
    }
}

impl Eq for TraitDef {}

/// xxh64 over tag-prefixed, length-prefixed segments so distinct shapes
/// cannot collide by concatenation ambiguity.
fn compute_shape_hash(name: &str, dynamic: bool, externalizable: bool, properties: &[Arc<str>]) -> u64 {
    let mut hasher = Xxh64::new(0);
    let flags = (dynamic as u8) | ((externalizable as u8) << 1);
    hasher.update(&[flags]);
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    for p in properties {
        hasher.update(&(p.len() as u64).to_le_bytes());
        hasher.update(p.as_bytes());
    }
    hasher.digest()
}

// =============================================================================
// Tests
// =============================================================================
