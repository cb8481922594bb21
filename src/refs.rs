//! Per-stream reference tables.
//!
//! One set of three append-only tables (strings, complex objects, trait
//! shapes) lives on each Writer and each Reader. A slot, once assigned,
//! is valid for the rest of the stream and is never reassigned or
//! compacted — back-references are positional.
//!
//! The write side keys lookups for O(1) dedup: strings by content,
//! objects by node identity (cell address), traits by shape hash. The
//! read side is a direct indexed vector; an index past the end of a
//! table is a corrupt stream.

use crate::error::{CodecError, Result};
use crate::trait_def::TraitDef;
use crate::value::{ObjRef, Variant};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// Write side
// =============================================================================

/// Dedup tables for one Writer.
#[derive(Debug, Default)]
pub struct WriteTables {
    strings: FxHashMap<Rc<str>, u32>,
    objects: FxHashMap<usize, u32>,
    traits: FxHashMap<u64, u32>,
}

impl WriteTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of a previously stored string, if any.
    pub fn check_string(&self, s: &str) -> Option<u32> {
        self.strings.get(s).copied()
    }

    /// Append a string, returning its new index.
    pub fn store_string(&mut self, s: &str) -> u32 {
        let index = self.strings.len() as u32;
        self.strings.insert(Rc::from(s), index);
        index
    }

    /// Index of a previously stored object node, if any. Identity, not
    /// structural equality: two equal-content nodes get two slots.
    pub fn check_object(&self, obj: &ObjRef) -> Option<u32> {
        self.objects.get(&object_key(obj)).copied()
    }

    /// Append an object node, returning its new index.
    pub fn store_object(&mut self, obj: &ObjRef) -> u32 {
        let index = self.objects.len() as u32;
        self.objects.insert(object_key(obj), index);
        index
    }

    /// Index of a previously stored trait shape, if any.
    pub fn check_trait(&self, def: &TraitDef) -> Option<u32> {
        self.traits.get(&def.shape_hash()).copied()
    }

    /// Append a trait shape, returning its new index.
    pub fn store_trait(&mut self, def: &TraitDef) -> u32 {
        let index = self.traits.len() as u32;
        self.traits.insert(def.shape_hash(), index);
        index
    }
}

fn object_key(obj: &ObjRef) -> usize {
    Rc::as_ptr(obj) as usize
}

// =============================================================================
// Read side
// =============================================================================

/// Indexed tables for one Reader.
#[derive(Debug, Default)]
pub struct ReadTables {
    strings: Vec<Rc<str>>,
    objects: Vec<Variant>,
    traits: Vec<Arc<TraitDef>>,
}

impl ReadTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_string(&mut self, s: Rc<str>) -> usize {
        self.strings.push(s);
        self.strings.len() - 1
    }

    pub fn get_string(&self, index: u32) -> Result<Rc<str>> {
        self.strings
            .get(index as usize)
            .cloned()
            .ok_or(CodecError::BadReference {
                table: "string",
                index,
                len: self.strings.len(),
            })
    }

    /// Register an object node *before* its children decode. The slot
    /// holds the shared cell; back-references taken while children are
    /// still being read observe the final contents through it, which is
    /// what makes self-referential graphs decodable.
    pub fn register_object(&mut self, value: &Variant) -> usize {
        self.objects.push(value.clone());
        self.objects.len() - 1
    }

    pub fn get_object(&self, index: u32) -> Result<Variant> {
        self.objects
            .get(index as usize)
            .cloned()
            .ok_or(CodecError::BadReference {
                table: "object",
                index,
                len: self.objects.len(),
            })
    }

    pub fn register_trait(&mut self, def: Arc<TraitDef>) -> usize {
        self.traits.push(def);
        self.traits.len() - 1
    }

    pub fn get_trait(&self, index: u32) -> Result<Arc<TraitDef>> {
        self.traits
            .get(index as usize)
            .cloned()
            .ok_or(CodecError::BadReference {
                table: "trait",
                index,
                len: self.traits.len(),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Complex;

    #[test]
    fn test_string_dedup_indices() {
        let mut tables = WriteTables::new();

        assert_eq!(tables.check_string("alpha"), None);
        assert_eq!(tables.store_string("alpha"), 0);
        assert_eq!(tables.store_string("beta"), 1);
        assert_eq!(tables.check_string("alpha"), Some(0));
        assert_eq!(tables.check_string("beta"), Some(1));
        assert_eq!(tables.check_string("gamma"), None);
    }

    #[test]
    fn test_object_identity_not_structure() {
        let mut tables = WriteTables::new();
        let a = Variant::object(Complex::Bytes(vec![1]));
        let b = Variant::object(Complex::Bytes(vec![1]));
        let a_ref = a.as_object().unwrap();
        let b_ref = b.as_object().unwrap();

        assert_eq!(tables.store_object(a_ref), 0);
        assert_eq!(tables.check_object(a_ref), Some(0));
        // Equal contents, different node: no dedup
        assert_eq!(tables.check_object(b_ref), None);
        assert_eq!(tables.store_object(b_ref), 1);
    }

    #[test]
    fn test_trait_dedup_by_shape() {
        let mut tables = WriteTables::new();
        let a = TraitDef::new("P", vec![Arc::from("x")], false, false).unwrap();
        let b = TraitDef::new("P", vec![Arc::from("x")], false, false).unwrap();
        let c = TraitDef::new("Q", vec![Arc::from("x")], false, false).unwrap();

        assert_eq!(tables.store_trait(&a), 0);
        // A distinct instance with the same shape hits the same slot
        assert_eq!(tables.check_trait(&b), Some(0));
        assert_eq!(tables.check_trait(&c), None);
        assert_eq!(tables.store_trait(&c), 1);
    }

    #[test]
    fn test_read_side_lookup() {
        let mut tables = ReadTables::new();
        assert_eq!(tables.register_string(Rc::from("s")), 0);
        assert_eq!(tables.get_string(0).unwrap().as_ref(), "s");
        assert!(matches!(
            tables.get_string(1),
            Err(CodecError::BadReference {
                table: "string",
                index: 1,
                len: 1
            })
        ));
    }

    #[test]
    fn test_read_side_object_slot_shares_node() {
        let mut tables = ReadTables::new();
        let shell = Variant::object(Complex::Bytes(Vec::new()));
        let index = tables.register_object(&shell) as u32;

        // Mutating through the shell is visible via the stored slot
        if let Complex::Bytes(bytes) = &mut *shell.as_object().unwrap().borrow_mut() {
            bytes.push(7);
        }
        let fetched = tables.get_object(index).unwrap();
        match &*fetched.as_object().unwrap().borrow() {
            Complex::Bytes(bytes) => assert_eq!(bytes, &vec![7]),
            other => panic!("expected Bytes, got {:?}", other),
        };
    }
}
