//! Variant — polymorphic wire value type.
//!
//! A [`Variant`] holds one decoded (or to-be-encoded) value. Scalar tags
//! live inline in the enum — no heap allocation on the hot read/write
//! path. Complex values (dates, blobs, arrays, class-shaped objects,
//! typed vectors, dictionaries) sit behind a shared [`ObjRef`] cell so
//! that graph identity is observable: two `Variant`s holding the same
//! `ObjRef` are the *same* node, which is what the reference tables key
//! on and what makes self-referential graphs expressible.
//!
//! ## Equality
//!
//! Differently-tagged numeric variants compare as numbers
//! (`Integer(2) == Number(2.0)`). Strings compare by content. Objects
//! compare by node identity — structural recursion would not terminate
//! on cyclic graphs.

use crate::error::{CodecError, Result};
use crate::marker::Marker;
use crate::trait_def::TraitDef;
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Shared handle to a complex value node.
pub type ObjRef = Rc<RefCell<Complex>>;

/// Polymorphic wire value.
#[derive(Debug, Clone)]
pub enum Variant {
    /// No value (distinct from Null on the wire).
    Undefined,
    Null,
    Bool(bool),
    /// Signed integer; encodable compactly when within `[-2^28, 2^28 - 1]`.
    Integer(i32),
    /// 64-bit IEEE-754 double.
    Number(f64),
    String(Rc<str>),
    /// Complex value node (date, blob, array, object, vector, dictionary).
    Object(ObjRef),
}

impl Variant {
    /// Canonical scalar values. Scalars are inline in the enum, so these
    /// are plain `const`s — converting through them allocates nothing.
    pub const ZERO: Variant = Variant::Integer(0);
    pub const ONE: Variant = Variant::Integer(1);
    pub const NEG_ONE: Variant = Variant::Integer(-1);
    pub const NUMBER_ZERO: Variant = Variant::Number(0.0);
    pub const NUMBER_ONE: Variant = Variant::Number(1.0);
    pub const TRUE: Variant = Variant::Bool(true);
    pub const FALSE: Variant = Variant::Bool(false);

    /// Build an integer variant, routing through the canonical constants.
    pub fn from_i32(value: i32) -> Variant {
        match value {
            0 => Variant::ZERO,
            1 => Variant::ONE,
            -1 => Variant::NEG_ONE,
            v => Variant::Integer(v),
        }
    }

    /// Build a number variant, routing through the canonical constants.
    pub fn from_f64(value: f64) -> Variant {
        if value == 0.0 && !value.is_sign_negative() {
            Variant::NUMBER_ZERO
        } else if value == 1.0 {
            Variant::NUMBER_ONE
        } else {
            Variant::Number(value)
        }
    }

    /// Build a string variant.
    pub fn string(s: impl Into<Rc<str>>) -> Variant {
        Variant::String(s.into())
    }

    /// Wrap a complex payload in a fresh shared node.
    pub fn object(payload: Complex) -> Variant {
        Variant::Object(Rc::new(RefCell::new(payload)))
    }

    /// Everything except `Undefined` is defined.
    pub fn is_defined(&self) -> bool {
        !matches!(self, Variant::Undefined)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Variant::Integer(_) | Variant::Number(_))
    }

    /// Numeric value of an `Integer` or `Number` variant.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Integer(v) => Some(*v as f64),
            Variant::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Variant::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Variant::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Undefined, Variant::Undefined) => true,
            (Variant::Null, Variant::Null) => true,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::String(a), Variant::String(b)) => a == b,
            (Variant::Object(a), Variant::Object(b)) => Rc::ptr_eq(a, b),
            // Numeric variants compare as numbers regardless of tag
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.as_f64().unwrap() == b.as_f64().unwrap()
            }
            _ => false,
        }
    }
}

// =============================================================================
// Complex payloads
// =============================================================================

/// Payload of a complex value node.
#[derive(Debug)]
pub enum Complex {
    Date(Date),
    Bytes(Vec<u8>),
    Array(Array),
    Object(ObjectValue),
    VectorInt(TypedVector<i32>),
    VectorUInt(TypedVector<u32>),
    VectorDouble(TypedVector<f64>),
    VectorObject(ObjectVector),
    Dictionary(Dictionary),
}

impl Complex {
    /// Wire marker for this payload kind.
    pub fn marker(&self) -> Marker {
        match self {
            Complex::Date(_) => Marker::Date,
            Complex::Bytes(_) => Marker::ByteArray,
            Complex::Array(_) => Marker::Array,
            Complex::Object(_) => Marker::Object,
            Complex::VectorInt(_) => Marker::VectorInt,
            Complex::VectorUInt(_) => Marker::VectorUInt,
            Complex::VectorDouble(_) => Marker::VectorDouble,
            Complex::VectorObject(_) => Marker::VectorObject,
            Complex::Dictionary(_) => Marker::Dictionary,
        }
    }
}

/// Instant stored as milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Date {
    pub epoch_ms: f64,
}

impl Date {
    pub fn new(epoch_ms: f64) -> Self {
        Date { epoch_ms }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Date {
            epoch_ms: dt.timestamp_millis() as f64,
        }
    }

    /// Civil-time view. `None` for non-finite or out-of-range instants.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if !self.epoch_ms.is_finite() {
            return None;
        }
        DateTime::from_timestamp_millis(self.epoch_ms as i64)
    }
}

/// Ordered list with an optional string-keyed associative section.
///
/// The associative entries precede the dense elements on the wire and are
/// terminated by the empty-string key.
#[derive(Debug, Default)]
pub struct Array {
    pub dense: Vec<Variant>,
    pub assoc: Vec<(Rc<str>, Variant)>,
}

impl Array {
    pub fn new(dense: Vec<Variant>) -> Self {
        Array {
            dense,
            assoc: Vec::new(),
        }
    }

    pub fn get_assoc(&self, key: &str) -> Option<&Variant> {
        self.assoc
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }
}

/// Class-shaped object: a trait plus positional declared values and,
/// for dynamic traits, ordered extra (key, value) pairs.
#[derive(Debug)]
pub struct ObjectValue {
    pub trait_def: Arc<TraitDef>,
    /// Declared property values, positional in trait order.
    /// Always `trait_def.property_count()` long.
    pub properties: Vec<Variant>,
    /// Dynamic extras in insertion order (drives wire order).
    pub extras: Vec<(Rc<str>, Variant)>,
}

impl ObjectValue {
    /// Create an instance with every declared slot set to `Undefined`.
    pub fn new(trait_def: Arc<TraitDef>) -> Self {
        let properties = vec![Variant::Undefined; trait_def.property_count()];
        ObjectValue {
            trait_def,
            properties,
            extras: Vec::new(),
        }
    }

    /// Look up a property by name: declared slots first, then extras.
    pub fn get(&self, name: &str) -> Option<&Variant> {
        if let Some(idx) = self.trait_def.property_index(name) {
            return self.properties.get(idx);
        }
        self.extras
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v)
    }

    /// Set a property by name. Declared names fill their positional slot;
    /// unknown names become dynamic extras on a dynamic trait and are an
    /// error on a sealed one.
    pub fn set(&mut self, name: &str, value: Variant) -> Result<()> {
        if let Some(idx) = self.trait_def.property_index(name) {
            if let Some(slot) = self.properties.get_mut(idx) {
                *slot = value;
                return Ok(());
            }
            return Err(CodecError::unsupported(format!(
                "declared slot {} missing on instance of {:?}",
                idx,
                self.trait_def.name()
            )));
        }
        if !self.trait_def.is_dynamic() {
            return Err(CodecError::unsupported(format!(
                "property {:?} is not declared on sealed trait {:?}",
                name,
                self.trait_def.name()
            )));
        }
        if let Some(slot) = self.extras.iter_mut().find(|(k, _)| k.as_ref() == name) {
            slot.1 = value;
        } else {
            self.extras.push((Rc::from(name), value));
        }
        Ok(())
    }

    /// Declared property names in declared order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.trait_def.properties().iter().map(|p| p.as_ref())
    }

    /// Enumeration order for dynamic instances: extras first, then the
    /// declared properties.
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.extras
            .iter()
            .map(|(k, _)| k.as_ref())
            .chain(self.keys())
    }
}

/// Homogeneous fixed-width-element vector.
#[derive(Debug, Clone, Default)]
pub struct TypedVector<T> {
    pub fixed: bool,
    pub items: Vec<T>,
}

impl<T> TypedVector<T> {
    pub fn new(items: Vec<T>) -> Self {
        TypedVector {
            fixed: false,
            items,
        }
    }
}

/// Homogeneous object vector carrying an element-type alias.
#[derive(Debug)]
pub struct ObjectVector {
    pub fixed: bool,
    /// Element-type alias; empty for untyped element streams.
    pub type_alias: Rc<str>,
    pub items: Vec<Variant>,
}

impl Default for ObjectVector {
    fn default() -> Self {
        ObjectVector {
            fixed: false,
            type_alias: Rc::from(""),
            items: Vec::new(),
        }
    }
}

/// Key/value pairs with a weak-keys flag. The flag is carried on the
/// payload and round-tripped; the codec does not interpret it.
#[derive(Debug, Default)]
pub struct Dictionary {
    pub weak_keys: bool,
    pub entries: Vec<(Variant, Variant)>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_cross_tag_equality() {
        assert_eq!(Variant::Integer(2), Variant::Number(2.0));
        assert_eq!(Variant::Number(-7.0), Variant::Integer(-7));
        assert_ne!(Variant::Integer(2), Variant::Number(2.5));
    }

    #[test]
    fn test_non_numeric_equality() {
        assert_eq!(Variant::Null, Variant::Null);
        assert_ne!(Variant::Null, Variant::Undefined);
        assert_ne!(Variant::Bool(false), Variant::Integer(0));
        assert_eq!(Variant::string("a"), Variant::string("a"));
    }

    #[test]
    fn test_object_identity_equality() {
        let a = Variant::object(Complex::Bytes(vec![1, 2]));
        let b = Variant::object(Complex::Bytes(vec![1, 2]));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonical_constructors() {
        assert!(matches!(Variant::from_i32(0), Variant::Integer(0)));
        assert!(matches!(Variant::from_i32(-1), Variant::Integer(-1)));
        assert!(matches!(Variant::from_f64(1.0), Variant::Number(v) if v == 1.0));
        // -0.0 must not collapse onto the canonical zero
        match Variant::from_f64(-0.0) {
            Variant::Number(v) => assert!(v.is_sign_negative()),
            other => panic!("expected Number, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_predicates() {
        assert!(!Variant::Undefined.is_defined());
        assert!(Variant::Null.is_defined());
        assert!(Variant::Integer(3).is_numeric());
        assert!(Variant::Number(3.5).is_numeric());
        assert!(!Variant::string("3").is_numeric());
    }

    #[test]
    fn test_date_chrono_round_trip() {
        let dt = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let date = Date::from_datetime(dt);
        assert_eq!(date.to_datetime(), Some(dt));
        assert_eq!(Date::new(f64::NAN).to_datetime(), None);
    }

    #[test]
    fn test_array_assoc_lookup() {
        let mut arr = Array::new(vec![Variant::ONE]);
        arr.assoc.push((Rc::from("length"), Variant::Integer(1)));
        assert_eq!(arr.get_assoc("length"), Some(&Variant::Integer(1)));
        assert_eq!(arr.get_assoc("missing"), None);
    }
}
