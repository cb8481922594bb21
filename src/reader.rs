//! Reader: byte stream -> typed value graph.
//!
//! Mirror image of [`crate::writer`]. A [`Reader`] owns one set of
//! reference tables for one stream; complex values register their shared
//! node *before* their children decode, so a back-reference taken while
//! the node is still being filled resolves to the same cell and
//! self-referential graphs come back as cycles, not infinite recursion.
//!
//! Beyond [`Reader::read_value`], the reader exposes the field-order
//! read API (`begin_object` / `field` / `field_at` / `finish_object`):
//! a consumer names its expected field order once (a
//! [`FieldLayout`]) and reads fields positionally while the remap
//! engine translates wire order transparently. The decoded-values
//! scratch buffer is owned by the Reader and reused across objects;
//! its slot 0 always holds the `Undefined` sentinel that absent fields
//! resolve to.
//!
//! A Reader is single-threaded and not re-entrant: calling back into
//! `read_value` from inside an unfinished `read_value` (outside the
//! custom-serializer SPI, which is driven by the reader itself) is not
//! supported.

use crate::error::{CodecError, Result};
use crate::marker::{
    Marker, OBJ_DYNAMIC, OBJ_EXTERNALIZABLE, OBJ_INLINE, OBJ_INLINE_TRAIT, OBJ_PROPERTY_SHIFT,
    VEC_FIXED,
};
use crate::refs::ReadTables;
use crate::registry::{Serializer, SerializerRegistry};
use crate::remap::{remap_for, FieldLayout, RemapTable};
use crate::trait_def::TraitDef;
use crate::value::{
    Array, Complex, Date, Dictionary, ObjectValue, ObjectVector, TypedVector, Variant,
};
use crate::varint;
use std::rc::Rc;
use std::sync::Arc;

/// Reader behavior knobs.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Resolve inline trait definitions through the process-wide shape
    /// pool, so remap caches amortize across streams. Disable to keep
    /// every decoded shape private to this Reader.
    pub intern_traits: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            intern_traits: true,
        }
    }
}

struct CurrentObject {
    layout: Arc<FieldLayout>,
    remap: Arc<RemapTable>,
    object: Variant,
}

/// Parses a byte stream back into a value graph.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    tables: ReadTables,
    registry: Arc<SerializerRegistry>,
    opts: ReaderOptions,
    /// Decoded-values buffer for the field-order API. Slot 0 is the
    /// Undefined sentinel; reused across objects.
    scratch: Vec<Variant>,
    current: Option<CurrentObject>,
}

impl<'a> Reader<'a> {
    /// Reader against the process-wide serializer registry.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_registry(data, SerializerRegistry::global(), ReaderOptions::default())
    }

    pub fn with_options(data: &'a [u8], opts: ReaderOptions) -> Self {
        Self::with_registry(data, SerializerRegistry::global(), opts)
    }

    pub fn with_registry(
        data: &'a [u8],
        registry: Arc<SerializerRegistry>,
        opts: ReaderOptions,
    ) -> Self {
        Reader {
            data,
            pos: 0,
            tables: ReadTables::new(),
            registry,
            opts,
            scratch: Vec::new(),
            current: None,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Parse one value, advancing past its encoding.
    pub fn read_value(&mut self) -> Result<Variant> {
        let marker = Marker::from_u8(varint::take_u8(self.data, &mut self.pos)?)?;
        match marker {
            Marker::Undefined => Ok(Variant::Undefined),
            Marker::Null => Ok(Variant::Null),
            Marker::False => Ok(Variant::FALSE),
            Marker::True => Ok(Variant::TRUE),
            Marker::Integer => Ok(Variant::from_i32(self.read_i29()?)),
            Marker::Double => Ok(Variant::from_f64(self.read_f64()?)),
            Marker::String => Ok(Variant::String(self.read_string()?)),
            Marker::Date => self.read_date(),
            Marker::Array => self.read_array(),
            Marker::Object => self.read_object(),
            Marker::ByteArray => self.read_byte_array(),
            Marker::VectorInt => self.read_vector_int(),
            Marker::VectorUInt => self.read_vector_uint(),
            Marker::VectorDouble => self.read_vector_double(),
            Marker::VectorObject => self.read_vector_object(),
            Marker::Dictionary => self.read_dictionary(),
        }
    }

    // -------------------------------------------------------------------------
    // Primitive source API (used by custom serializers)
    // -------------------------------------------------------------------------

    pub fn read_u29(&mut self) -> Result<u32> {
        varint::decode_u29(self.data, &mut self.pos)
    }

    pub fn read_i29(&mut self) -> Result<i32> {
        varint::decode_i29(self.data, &mut self.pos)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        varint::decode_f64(self.data, &mut self.pos)
    }

    /// Read `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        varint::take(self.data, &mut self.pos, len)
    }

    /// Read a string run: inline UTF-8 (entering the string table unless
    /// empty) or a table back-reference.
    pub fn read_string(&mut self) -> Result<Rc<str>> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return self.tables.get_string(flags >> 1);
        }
        let len = (flags >> 1) as usize;
        if len == 0 {
            return Ok(Rc::from(""));
        }
        let bytes = varint::take(self.data, &mut self.pos, len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| CodecError::malformed(format!("invalid UTF-8 in string: {}", e)))?;
        let value: Rc<str> = Rc::from(s);
        self.tables.register_string(value.clone());
        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Complex values
    // -------------------------------------------------------------------------

    fn read_date(&mut self) -> Result<Variant> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return self.tables.get_object(flags >> 1);
        }
        let epoch_ms = self.read_f64()?;
        let value = Variant::object(Complex::Date(Date::new(epoch_ms)));
        self.tables.register_object(&value);
        Ok(value)
    }

    fn read_byte_array(&mut self) -> Result<Variant> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return self.tables.get_object(flags >> 1);
        }
        let len = (flags >> 1) as usize;
        let bytes = varint::take(self.data, &mut self.pos, len)?.to_vec();
        let value = Variant::object(Complex::Bytes(bytes));
        self.tables.register_object(&value);
        Ok(value)
    }

    fn read_array(&mut self) -> Result<Variant> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return self.tables.get_object(flags >> 1);
        }
        let count = (flags >> 1) as usize;

        // Register the shell before children so cycles resolve to it
        let shell = Variant::object(Complex::Array(Array::default()));
        self.tables.register_object(&shell);

        let mut assoc = Vec::new();
        loop {
            let key = self.read_string()?;
            if key.is_empty() {
                break;
            }
            let value = self.read_value()?;
            assoc.push((key, value));
        }
        let mut dense = Vec::with_capacity(count);
        for _ in 0..count {
            dense.push(self.read_value()?);
        }

        if let Complex::Array(array) = &mut *shell.as_object().unwrap().borrow_mut() {
            array.assoc = assoc;
            array.dense = dense;
        }
        Ok(shell)
    }

    fn read_vector_int(&mut self) -> Result<Variant> {
        let (count, fixed) = match self.read_vector_header()? {
            VectorHeader::Reference(value) => return Ok(value),
            VectorHeader::Inline { count, fixed } => (count, fixed),
        };
        let shell = Variant::object(Complex::VectorInt(TypedVector::default()));
        self.tables.register_object(&shell);

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(varint::decode_i32(self.data, &mut self.pos)?);
        }
        if let Complex::VectorInt(v) = &mut *shell.as_object().unwrap().borrow_mut() {
            v.fixed = fixed;
            v.items = items;
        }
        Ok(shell)
    }

    fn read_vector_uint(&mut self) -> Result<Variant> {
        let (count, fixed) = match self.read_vector_header()? {
            VectorHeader::Reference(value) => return Ok(value),
            VectorHeader::Inline { count, fixed } => (count, fixed),
        };
        let shell = Variant::object(Complex::VectorUInt(TypedVector::default()));
        self.tables.register_object(&shell);

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(varint::decode_u32(self.data, &mut self.pos)?);
        }
        if let Complex::VectorUInt(v) = &mut *shell.as_object().unwrap().borrow_mut() {
            v.fixed = fixed;
            v.items = items;
        }
        Ok(shell)
    }

    fn read_vector_double(&mut self) -> Result<Variant> {
        let (count, fixed) = match self.read_vector_header()? {
            VectorHeader::Reference(value) => return Ok(value),
            VectorHeader::Inline { count, fixed } => (count, fixed),
        };
        let shell = Variant::object(Complex::VectorDouble(TypedVector::default()));
        self.tables.register_object(&shell);

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_f64()?);
        }
        if let Complex::VectorDouble(v) = &mut *shell.as_object().unwrap().borrow_mut() {
            v.fixed = fixed;
            v.items = items;
        }
        Ok(shell)
    }

    fn read_vector_object(&mut self) -> Result<Variant> {
        let (count, fixed) = match self.read_vector_header()? {
            VectorHeader::Reference(value) => return Ok(value),
            VectorHeader::Inline { count, fixed } => (count, fixed),
        };
        let shell = Variant::object(Complex::VectorObject(ObjectVector::default()));
        self.tables.register_object(&shell);

        let type_alias = self.read_string()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_value()?);
        }
        if let Complex::VectorObject(v) = &mut *shell.as_object().unwrap().borrow_mut() {
            v.fixed = fixed;
            v.type_alias = type_alias;
            v.items = items;
        }
        Ok(shell)
    }

    fn read_vector_header(&mut self) -> Result<VectorHeader> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return Ok(VectorHeader::Reference(
                self.tables.get_object(flags >> 1)?,
            ));
        }
        let fixed_byte = varint::take_u8(self.data, &mut self.pos)?;
        Ok(VectorHeader::Inline {
            count: (flags >> 1) as usize,
            fixed: fixed_byte == VEC_FIXED,
        })
    }

    fn read_dictionary(&mut self) -> Result<Variant> {
        let flags = self.read_u29()?;
        if flags & 1 == 0 {
            return self.tables.get_object(flags >> 1);
        }
        let count = (flags >> 1) as usize;
        let weak_keys = varint::take_u8(self.data, &mut self.pos)? != 0;

        let shell = Variant::object(Complex::Dictionary(Dictionary::default()));
        self.tables.register_object(&shell);

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.read_value()?;
            let value = self.read_value()?;
            entries.push((key, value));
        }
        if let Complex::Dictionary(dict) = &mut *shell.as_object().unwrap().borrow_mut() {
            dict.weak_keys = weak_keys;
            dict.entries = entries;
        }
        Ok(shell)
    }

    fn read_object(&mut self) -> Result<Variant> {
        let flags = self.read_u29()?;
        if flags & OBJ_INLINE == 0 {
            return self.tables.get_object(flags >> 1);
        }

        // Trait: back-reference or inline definition
        let def = if flags & OBJ_INLINE_TRAIT == 0 {
            self.tables.get_trait(flags >> 2)?
        } else {
            let externalizable = flags & OBJ_EXTERNALIZABLE != 0;
            let dynamic = flags & OBJ_DYNAMIC != 0;
            let count = (flags >> OBJ_PROPERTY_SHIFT) as usize;
            let name = self.read_string()?;
            let mut properties: Vec<Arc<str>> = Vec::with_capacity(count);
            for _ in 0..count {
                properties.push(Arc::from(self.read_string()?.as_ref()));
            }
            let name: Arc<str> = Arc::from(name.as_ref());
            let def = if self.opts.intern_traits {
                TraitDef::intern(name, properties, dynamic, externalizable)?
            } else {
                Arc::new(TraitDef::new(name, properties, dynamic, externalizable)?)
            };
            self.tables.register_trait(def.clone());
            def
        };

        // Reserve the object slot before property values decode
        let shell = Variant::object(Complex::Object(ObjectValue::new(def.clone())));
        self.tables.register_object(&shell);

        if def.is_externalizable() {
            let serializer = self.registry.resolve(def.name());
            let Serializer::Custom(external) = serializer else {
                return Err(CodecError::unsupported(format!(
                    "externalizable class {:?} has no custom serializer registered",
                    def.name()
                )));
            };
            let mut obj_value = ObjectValue::new(def);
            external.read_object(self, &mut obj_value)?;
            if let Complex::Object(slot) = &mut *shell.as_object().unwrap().borrow_mut() {
                *slot = obj_value;
            }
            return Ok(shell);
        }

        // Declared properties, positional in trait order
        let count = def.property_count();
        let mut properties = Vec::with_capacity(count);
        for _ in 0..count {
            properties.push(self.read_value()?);
        }

        // Dynamic (key, value) pairs until the empty-string sentinel
        let mut extras = Vec::new();
        if def.is_dynamic() {
            loop {
                let key = self.read_string()?;
                if key.is_empty() {
                    break;
                }
                let value = self.read_value()?;
                extras.push((key, value));
            }
        }

        if let Complex::Object(obj_value) = &mut *shell.as_object().unwrap().borrow_mut() {
            obj_value.properties = properties;
            obj_value.extras = extras;
        }
        Ok(shell)
    }

    // -------------------------------------------------------------------------
    // Field-order read API
    // -------------------------------------------------------------------------

    /// Read the next value, which must be a class-shaped object, and
    /// stage its declared values for positional access in `layout`
    /// order. The remap table is cached on the wire trait, so repeated
    /// objects of one shape stage with no name comparisons.
    pub fn begin_object(&mut self, layout: &Arc<FieldLayout>) -> Result<()> {
        let value = self.read_value()?;
        let obj_ref = match &value {
            Variant::Object(obj_ref) => obj_ref.clone(),
            other => {
                return Err(CodecError::malformed(format!(
                    "expected a class-shaped object, found {:?}",
                    other
                )))
            }
        };

        let remap = {
            let payload = obj_ref.borrow();
            let obj_value = match &*payload {
                Complex::Object(obj_value) => obj_value,
                other => {
                    return Err(CodecError::malformed(format!(
                        "expected a class-shaped object, found {:?} payload",
                        other.marker()
                    )))
                }
            };
            self.scratch.clear();
            self.scratch.push(Variant::Undefined);
            self.scratch.extend(obj_value.properties.iter().cloned());
            remap_for(&obj_value.trait_def, layout)?
        };

        self.current = Some(CurrentObject {
            layout: layout.clone(),
            remap,
            object: value,
        });
        Ok(())
    }

    /// Staged value of the layout field `name`. Absent wire properties
    /// read as `Undefined` (lenient layouts).
    pub fn field(&self, name: &str) -> Result<&Variant> {
        let current = self.current.as_ref().ok_or_else(|| {
            CodecError::unsupported("field read outside begin_object/finish_object")
        })?;
        let index = current.layout.position(name).ok_or_else(|| {
            CodecError::ambiguous(format!("field {:?} is not part of the read layout", name))
        })?;
        Ok(self.staged(current.remap.slot(index)))
    }

    /// Staged value of the layout field at position `index`.
    pub fn field_at(&self, index: usize) -> Result<&Variant> {
        let current = self.current.as_ref().ok_or_else(|| {
            CodecError::unsupported("field read outside begin_object/finish_object")
        })?;
        Ok(self.staged(current.remap.slot(index)))
    }

    fn staged(&self, slot: u32) -> &Variant {
        // scratch always holds the sentinel at 0 while an object is staged
        match self.scratch.get(slot as usize) {
            Some(value) => value,
            None => &self.scratch[0],
        }
    }

    /// Finish the staged object and return it (dynamic extras and all).
    pub fn finish_object(&mut self) -> Result<Variant> {
        let current = self.current.take().ok_or_else(|| {
            CodecError::unsupported("finish_object without a matching begin_object")
        })?;
        Ok(current.object)
    }
}

enum VectorHeader {
    Reference(Variant),
    Inline { count: usize, fixed: bool },
}

/// Parse one value graph from `bytes` with a fresh [`Reader`].
/// Trailing bytes after the root value are rejected.
pub fn decode(bytes: &[u8]) -> Result<Variant> {
    let _span = tracing::debug_span!("decode_value", len = bytes.len()).entered();
    let mut reader = Reader::new(bytes);
    let value = reader.read_value()?;
    if !reader.is_at_end() {
        return Err(CodecError::malformed(format!(
            "{} trailing bytes after the root value",
            reader.remaining()
        )));
    }
    tracing::debug!(bytes = bytes.len(), "value decoded");
    Ok(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::Marker;

    #[test]
    fn test_unknown_marker_rejected() {
        let mut reader = Reader::new(&[0x42]);
        assert!(matches!(
            reader.read_value(),
            Err(CodecError::UnknownMarker(0x42))
        ));
    }

    #[test]
    fn test_truncated_double_rejected() {
        let data = [Marker::Double as u8, 0x3F, 0xF0];
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_value(),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_string_back_reference_out_of_range() {
        // (1 << 1) | 0: reference to slot 1 of an empty table
        let data = [Marker::String as u8, 0x02];
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_value(),
            Err(CodecError::BadReference {
                table: "string",
                index: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_object_back_reference_out_of_range() {
        let data = [Marker::Object as u8, 0x04]; // reference to object slot 2
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_value(),
            Err(CodecError::BadReference {
                table: "object",
                index: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_corrupt_trait_flags_rejected() {
        // Inline object, inline trait, externalizable AND dynamic
        let mut data = vec![Marker::Object as u8];
        data.push(0x01 | 0x02 | 0x04 | 0x08);
        data.push(0x03); // trait name "X": (1 << 1) | 1
        data.push(b'X');
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_value(),
            Err(CodecError::InvalidTrait(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let data = [Marker::Null as u8, 0x00];
        assert!(matches!(
            decode(&data),
            Err(CodecError::MalformedStream(_))
        ));
    }

    #[test]
    fn test_scalar_decode() {
        let data = [
            Marker::Undefined as u8,
            Marker::Null as u8,
            Marker::False as u8,
            Marker::True as u8,
            Marker::Integer as u8,
            0x07,
        ];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_value().unwrap(), Variant::Undefined);
        assert_eq!(reader.read_value().unwrap(), Variant::Null);
        assert_eq!(reader.read_value().unwrap(), Variant::FALSE);
        assert_eq!(reader.read_value().unwrap(), Variant::TRUE);
        assert_eq!(reader.read_value().unwrap(), Variant::Integer(7));
        assert!(reader.is_at_end());
    }
}
