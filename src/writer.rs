//! Writer: typed value graph -> byte stream.
//!
//! A [`Writer`] owns its output buffer and one set of reference tables
//! for exactly one stream. Complex values are checked against the object
//! table by node identity before anything is emitted; a hit becomes a
//! back-reference, a miss stores the node *before* its children are
//! written so that cyclic graphs serialize as back-references instead of
//! recursing forever. Trait shapes deduplicate the same way through the
//! trait table.
//!
//! A Writer is single-threaded and not re-entrant; see the crate docs
//! for the concurrency contract.

use crate::error::{CodecError, Result};
use crate::marker::{
    Marker, OBJ_DYNAMIC, OBJ_EXTERNALIZABLE, OBJ_INLINE, OBJ_INLINE_TRAIT, OBJ_PROPERTY_SHIFT,
    VEC_FIXED,
};
use crate::refs::WriteTables;
use crate::registry::{Serializer, SerializerRegistry};
use crate::value::{Complex, ObjRef, ObjectValue, Variant};
use crate::varint::{self, INT_MAX, INT_MIN, U29_MAX};
use std::sync::Arc;

/// Writer behavior knobs.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Write a double with no fractional part, inside the 29-bit integer
    /// domain, in the compact Integer form instead of the 8-byte Number
    /// form. The decoded value is numerically equal either way, but the
    /// wire tag changes; callers that distinguish "was a float" above
    /// the codec should disable this. `-0.0`, `NaN`, and infinities
    /// always keep the 8-byte form.
    pub compact_integral_doubles: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            compact_integral_doubles: true,
        }
    }
}

/// Serializes one typed value graph to bytes.
pub struct Writer {
    buf: Vec<u8>,
    tables: WriteTables,
    registry: Arc<SerializerRegistry>,
    opts: WriterOptions,
}

impl Writer {
    /// Writer against the process-wide serializer registry.
    pub fn new() -> Self {
        Self::with_registry(SerializerRegistry::global(), WriterOptions::default())
    }

    pub fn with_options(opts: WriterOptions) -> Self {
        Self::with_registry(SerializerRegistry::global(), opts)
    }

    pub fn with_registry(registry: Arc<SerializerRegistry>, opts: WriterOptions) -> Self {
        Writer {
            buf: Vec::new(),
            tables: WriteTables::new(),
            registry,
            opts,
        }
    }

    /// Bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Serialize one value, appending to the stream.
    pub fn write_value(&mut self, value: &Variant) -> Result<()> {
        match value {
            Variant::Undefined => self.push_marker(Marker::Undefined),
            Variant::Null => self.push_marker(Marker::Null),
            Variant::Bool(false) => self.push_marker(Marker::False),
            Variant::Bool(true) => self.push_marker(Marker::True),
            Variant::Integer(v) => {
                if !(INT_MIN..=INT_MAX).contains(v) {
                    return Err(CodecError::IntegerRange(*v as i64));
                }
                self.push_marker(Marker::Integer);
                varint::encode_i29(*v, &mut self.buf)?;
            }
            Variant::Number(d) => {
                match self.compact_integer_form(*d) {
                    Some(v) => {
                        self.push_marker(Marker::Integer);
                        varint::encode_i29(v, &mut self.buf)?;
                    }
                    None => {
                        self.push_marker(Marker::Double);
                        varint::encode_f64(*d, &mut self.buf);
                    }
                }
            }
            Variant::String(s) => {
                self.push_marker(Marker::String);
                self.write_string(s)?;
            }
            Variant::Object(obj) => self.write_complex(obj)?,
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Primitive sink API (used by custom serializers)
    // -------------------------------------------------------------------------

    /// Append a 29-bit varint.
    pub fn write_u29(&mut self, value: u32) -> Result<()> {
        varint::encode_u29(value, &mut self.buf)
    }

    /// Append an 8-byte big-endian double.
    pub fn write_f64(&mut self, value: f64) {
        varint::encode_f64(value, &mut self.buf);
    }

    /// Append raw bytes verbatim.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a string run: `(len << 1) | 1` + UTF-8 for a fresh value,
    /// `(index << 1)` for a previously written one. The empty string is
    /// always the inline literal `0x01` and never enters the table.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        if s.is_empty() {
            return self.write_u29(1);
        }
        if let Some(index) = self.tables.check_string(s) {
            return self.write_u29(index << 1);
        }
        let len = counted(s.len())?;
        self.write_u29((len << 1) | 1)?;
        self.buf.extend_from_slice(s.as_bytes());
        self.tables.store_string(s);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Complex values
    // -------------------------------------------------------------------------

    fn push_marker(&mut self, marker: Marker) {
        self.buf.push(marker as u8);
    }

    /// Compact Integer form for an integral double, when the policy is on.
    fn compact_integer_form(&self, d: f64) -> Option<i32> {
        if !self.opts.compact_integral_doubles {
            return None;
        }
        if d.fract() != 0.0 {
            return None; // also rejects NaN and infinities
        }
        if d == 0.0 && d.is_sign_negative() {
            return None; // -0.0 keeps its bit pattern in the 8-byte form
        }
        if !(INT_MIN as f64..=INT_MAX as f64).contains(&d) {
            return None;
        }
        Some(d as i32)
    }

    fn write_complex(&mut self, obj: &ObjRef) -> Result<()> {
        let payload = obj.borrow();
        self.push_marker(payload.marker());

        // 1. Identity check: a previously written node is a back-reference
        if let Some(index) = self.tables.check_object(obj) {
            return self.write_u29(index << 1);
        }

        // 2. Store the node before its children so cycles terminate
        self.tables.store_object(obj);

        match &*payload {
            Complex::Date(date) => {
                self.write_u29(1)?;
                varint::encode_f64(date.epoch_ms, &mut self.buf);
            }
            Complex::Bytes(bytes) => {
                let len = counted(bytes.len())?;
                self.write_u29((len << 1) | 1)?;
                self.buf.extend_from_slice(bytes);
            }
            Complex::Array(array) => {
                let count = counted(array.dense.len())?;
                self.write_u29((count << 1) | 1)?;
                for (key, value) in &array.assoc {
                    self.write_nonempty_key(key)?;
                    self.write_value(value)?;
                }
                self.write_u29(1)?; // terminator for the associative section
                for value in &array.dense {
                    self.write_value(value)?;
                }
            }
            Complex::Object(obj_value) => self.write_object_value(obj_value)?,
            Complex::VectorInt(v) => {
                self.write_vector_header(v.items.len(), v.fixed)?;
                for item in &v.items {
                    varint::encode_i32(*item, &mut self.buf);
                }
            }
            Complex::VectorUInt(v) => {
                self.write_vector_header(v.items.len(), v.fixed)?;
                for item in &v.items {
                    varint::encode_u32(*item, &mut self.buf);
                }
            }
            Complex::VectorDouble(v) => {
                self.write_vector_header(v.items.len(), v.fixed)?;
                for item in &v.items {
                    varint::encode_f64(*item, &mut self.buf);
                }
            }
            Complex::VectorObject(v) => {
                self.write_vector_header(v.items.len(), v.fixed)?;
                self.write_string(&v.type_alias)?;
                for item in &v.items {
                    self.write_value(item)?;
                }
            }
            Complex::Dictionary(dict) => {
                let count = counted(dict.entries.len())?;
                self.write_u29((count << 1) | 1)?;
                self.buf.push(dict.weak_keys as u8);
                for (key, value) in &dict.entries {
                    self.write_value(key)?;
                    self.write_value(value)?;
                }
            }
        }
        Ok(())
    }

    fn write_vector_header(&mut self, len: usize, fixed: bool) -> Result<()> {
        let count = counted(len)?;
        self.write_u29((count << 1) | 1)?;
        self.buf.push(if fixed { VEC_FIXED } else { 0 });
        Ok(())
    }

    fn write_object_value(&mut self, obj_value: &ObjectValue) -> Result<()> {
        let def = &obj_value.trait_def;

        // 3. Trait: back-reference if the shape was written before,
        //    otherwise the full inline definition
        if let Some(index) = self.tables.check_trait(def) {
            self.write_u29((index << 2) | OBJ_INLINE)?;
        } else {
            let count = counted(def.property_count())?;
            let mut flags = (count << OBJ_PROPERTY_SHIFT) | OBJ_INLINE | OBJ_INLINE_TRAIT;
            if def.is_externalizable() {
                flags |= OBJ_EXTERNALIZABLE;
            }
            if def.is_dynamic() {
                flags |= OBJ_DYNAMIC;
            }
            self.write_u29(flags)?;
            self.write_string(def.name())?;
            for property in def.properties() {
                self.write_string(property)?;
            }
            self.tables.store_trait(def);
        }

        // 4. Externalizable payloads belong to the registered serializer
        if def.is_externalizable() {
            let serializer = self.registry.resolve(def.name());
            let Serializer::Custom(external) = serializer else {
                return Err(CodecError::unsupported(format!(
                    "externalizable class {:?} has no custom serializer registered",
                    def.name()
                )));
            };
            return external.write_object(self, obj_value);
        }

        // 5. Declared properties, positional in trait order
        if obj_value.properties.len() != def.property_count() {
            return Err(CodecError::unsupported(format!(
                "object carries {} values for the {} declared properties of {:?}",
                obj_value.properties.len(),
                def.property_count(),
                def.name()
            )));
        }
        for value in &obj_value.properties {
            self.write_value(value)?;
        }

        // 6. Dynamic extras as (key, value) pairs, empty-string terminated
        if def.is_dynamic() {
            for (key, value) in &obj_value.extras {
                self.write_nonempty_key(key)?;
                self.write_value(value)?;
            }
            self.write_u29(1)?;
        } else if !obj_value.extras.is_empty() {
            return Err(CodecError::unsupported(format!(
                "sealed trait {:?} cannot carry dynamic extras",
                def.name()
            )));
        }
        Ok(())
    }

    fn write_nonempty_key(&mut self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CodecError::unsupported(
                "the empty string is reserved as the key terminator",
            ));
        }
        self.write_string(key)
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a count/length for the `(n << 1) | 1` varint form.
fn counted(len: usize) -> Result<u32> {
    if len > (U29_MAX >> 1) as usize {
        return Err(CodecError::IntegerRange(len as i64));
    }
    Ok(len as u32)
}

/// Serialize one value graph with a fresh [`Writer`].
pub fn encode(value: &Variant) -> Result<Vec<u8>> {
    let _span = tracing::debug_span!("encode_value").entered();
    let mut writer = Writer::new();
    writer.write_value(value)?;
    let bytes = writer.into_bytes();
    tracing::debug!(bytes = bytes.len(), "value encoded");
    Ok(bytes)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::Marker;

    #[test]
    fn test_scalar_markers() {
        let mut writer = Writer::new();
        writer.write_value(&Variant::Undefined).unwrap();
        writer.write_value(&Variant::Null).unwrap();
        writer.write_value(&Variant::Bool(false)).unwrap();
        writer.write_value(&Variant::Bool(true)).unwrap();
        assert_eq!(writer.bytes(), &[0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_integer_out_of_range_rejected() {
        let mut writer = Writer::new();
        assert!(matches!(
            writer.write_value(&Variant::Integer(INT_MAX + 1)),
            Err(CodecError::IntegerRange(_))
        ));
        assert!(matches!(
            writer.write_value(&Variant::Integer(INT_MIN - 1)),
            Err(CodecError::IntegerRange(_))
        ));
    }

    #[test]
    fn test_integral_double_compacts_by_default() {
        let mut writer = Writer::new();
        writer.write_value(&Variant::Number(7.0)).unwrap();
        assert_eq!(writer.bytes(), &[Marker::Integer as u8, 0x07]);
    }

    #[test]
    fn test_compact_policy_opt_out() {
        let mut writer = Writer::with_options(WriterOptions {
            compact_integral_doubles: false,
        });
        writer.write_value(&Variant::Number(7.0)).unwrap();
        assert_eq!(writer.bytes()[0], Marker::Double as u8);
        assert_eq!(writer.bytes().len(), 9);
    }

    #[test]
    fn test_negative_zero_keeps_double_form() {
        let mut writer = Writer::new();
        writer.write_value(&Variant::Number(-0.0)).unwrap();
        assert_eq!(writer.bytes()[0], Marker::Double as u8);
    }

    #[test]
    fn test_fractional_and_nonfinite_keep_double_form() {
        for d in [2.5, f64::NAN, f64::INFINITY, 1e300] {
            let mut writer = Writer::new();
            writer.write_value(&Variant::Number(d)).unwrap();
            assert_eq!(writer.bytes()[0], Marker::Double as u8);
        }
    }

    #[test]
    fn test_empty_string_is_inline_literal() {
        let mut writer = Writer::new();
        writer.write_value(&Variant::string("")).unwrap();
        writer.write_value(&Variant::string("")).unwrap();
        // Twice the literal, never a table reference
        assert_eq!(
            writer.bytes(),
            &[Marker::String as u8, 0x01, Marker::String as u8, 0x01]
        );
    }

    #[test]
    fn test_string_second_occurrence_is_back_reference() {
        let mut writer = Writer::new();
        writer.write_value(&Variant::string("hello")).unwrap();
        writer.write_value(&Variant::string("hello")).unwrap();

        let expected_first: &[u8] = &[Marker::String as u8, 0x0B, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(&writer.bytes()[..7], expected_first);
        // Back-reference to table slot 0: (0 << 1) | 0
        assert_eq!(&writer.bytes()[7..], &[Marker::String as u8, 0x00]);
    }
}
