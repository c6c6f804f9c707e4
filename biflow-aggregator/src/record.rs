//! Dynamic record schemas and the byte-level record layout.
//!
//! A record is a single byte buffer in two parts. The fixed part holds every
//! scalar field at a precomputed offset, in schema order. Variable-length
//! fields (strings, byte sequences, element arrays) occupy a four-byte slot in
//! the fixed part — a 16-bit offset from the start of the record and a 16-bit
//! byte length — and their payload lives in the tail. The layout is validated
//! once when a record is received; afterwards every accessor can index
//! directly without re-checking bounds.

use std::fmt;

use thiserror::Error;

use crate::types::{FieldKind, Scalar, Timestamp};

/// Width of the fixed-part slot of a variable-length field.
const VAR_SLOT: usize = 4;

/// Largest serialised record the layout can address.
pub const MAX_RECORD: usize = u16::MAX as usize;

/// Errors in schema specifications.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Two fields share a name.
    #[error("duplicate field name {0:?} in schema")]
    DuplicateName(String),
    /// A field entry is not a `type name` pair.
    #[error("malformed schema entry {0:?}, expected \"type name\"")]
    BadEntry(String),
    /// A field entry names an unknown type.
    #[error("unknown field type {0:?}")]
    UnknownType(String),
}

/// Errors raised while validating or assembling a single record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The buffer is shorter than the schema's fixed part.
    #[error("record of {got} bytes is shorter than the {want}-byte fixed part")]
    Truncated {
        /// Received length.
        got: usize,
        /// Required fixed-part length.
        want: usize,
    },
    /// A variable-length slot points outside the buffer.
    #[error("field {field} points outside the record")]
    BadSlot {
        /// Offending field id.
        field: usize,
    },
    /// An array's byte length is not a multiple of its element width.
    #[error("field {field} has a partial trailing element")]
    BadArrayLength {
        /// Offending field id.
        field: usize,
    },
    /// An assembled record would exceed the addressable size.
    #[error("record exceeds {MAX_RECORD} bytes")]
    TooLarge,
}

/// One named, typed field of a schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name, unique within its schema.
    pub name: String,
    /// Field shape and element type.
    pub kind: FieldKind,
}

/// An ordered list of named fields. Field ids are positions in this list.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Builds a schema from a field list, rejecting duplicate names.
    pub fn new(fields: Vec<FieldDef>) -> Result<Schema, SchemaError> {
        for (index, field) in fields.iter().enumerate() {
            if fields[..index].iter().any(|prior| prior.name == field.name) {
                return Err(SchemaError::DuplicateName(field.name.clone()));
            }
        }
        Ok(Schema { fields })
    }

    /// Parses a comma-separated `type name` list, e.g.
    /// `"time TIME_FIRST,time TIME_LAST,uint32 COUNT"`.
    pub fn parse(spec: &str) -> Result<Schema, SchemaError> {
        let mut fields = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split_whitespace();
            let (kind, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(kind), Some(name), None) => (kind, name),
                _ => return Err(SchemaError::BadEntry(entry.to_string())),
            };
            let kind = FieldKind::parse(kind).ok_or_else(|| SchemaError::UnknownType(kind.to_string()))?;
            fields.push(FieldDef { name: name.to_string(), kind });
        }
        Schema::new(fields)
    }

    /// The id of the named field, if present.
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// The field with the given id.
    #[inline]
    pub fn field(&self, id: usize) -> &FieldDef {
        &self.fields[id]
    }

    /// Number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in id order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{} {}", field.kind, field.name)?;
        }
        Ok(())
    }
}

/// Precomputed byte offsets for one schema.
#[derive(Clone, Debug)]
pub struct Template {
    kinds: Vec<FieldKind>,
    offsets: Vec<usize>,
    fixed_size: usize,
}

impl Template {
    /// Computes the layout of the given schema.
    pub fn new(schema: &Schema) -> Template {
        let mut offsets = Vec::with_capacity(schema.len());
        let mut kinds = Vec::with_capacity(schema.len());
        let mut cursor = 0;
        for field in schema.iter() {
            offsets.push(cursor);
            kinds.push(field.kind);
            cursor += match field.kind {
                FieldKind::Scalar(kind) => kind.size(),
                _ => VAR_SLOT,
            };
        }
        Template { kinds, offsets, fixed_size: cursor }
    }

    /// Size of the fixed part in bytes.
    #[inline]
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    /// The shape of the field with the given id.
    #[inline]
    pub fn kind(&self, id: usize) -> FieldKind {
        self.kinds[id]
    }

    /// Number of fields in the layout.
    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when the layout has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn var_slot(&self, bytes: &[u8], id: usize) -> (usize, usize) {
        let at = self.offsets[id];
        let offset = u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
        let len = u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]) as usize;
        (offset, len)
    }
}

/// A validated, read-only view over one received record.
#[derive(Clone, Copy, Debug)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    template: &'a Template,
}

impl<'a> RecordView<'a> {
    /// Validates `bytes` against the layout and wraps it.
    ///
    /// Checks the fixed-part length, every variable-length slot's bounds, and
    /// that array payloads are whole multiples of their element width. All
    /// accessors rely on these checks.
    pub fn new(bytes: &'a [u8], template: &'a Template) -> Result<RecordView<'a>, RecordError> {
        if bytes.len() < template.fixed_size {
            return Err(RecordError::Truncated { got: bytes.len(), want: template.fixed_size });
        }
        for id in 0..template.len() {
            let kind = template.kind(id);
            if !kind.is_variable() {
                continue;
            }
            let (offset, len) = template.var_slot(bytes, id);
            if offset < template.fixed_size || offset + len > bytes.len() {
                return Err(RecordError::BadSlot { field: id });
            }
            if let FieldKind::Array(elem) = kind {
                if len % elem.size() != 0 {
                    return Err(RecordError::BadArrayLength { field: id });
                }
            }
        }
        Ok(RecordView { bytes, template })
    }

    /// Reads the scalar field with the given id.
    pub fn scalar(&self, id: usize) -> Scalar {
        match self.template.kind(id) {
            FieldKind::Scalar(kind) => Scalar::read(kind, &self.bytes[self.template.offsets[id]..]),
            other => panic!("field {} is not a scalar, it is {}", id, other),
        }
    }

    /// Reads a timestamp field with the given id.
    pub fn time(&self, id: usize) -> Timestamp {
        match self.scalar(id) {
            Scalar::Time(ts) => ts,
            other => panic!("field {} is not a time, it is {:?}", id, other.kind()),
        }
    }

    /// The raw payload of a variable-length field.
    pub fn var_bytes(&self, id: usize) -> &'a [u8] {
        let (offset, len) = self.template.var_slot(self.bytes, id);
        &self.bytes[offset..offset + len]
    }

    /// The raw bytes of the field with the given id, fixed or variable.
    pub fn raw(&self, id: usize) -> &'a [u8] {
        match self.template.kind(id) {
            FieldKind::Scalar(kind) => {
                let at = self.template.offsets[id];
                &self.bytes[at..at + kind.size()]
            }
            _ => self.var_bytes(id),
        }
    }

    /// Number of elements in an array field.
    pub fn elem_count(&self, id: usize) -> usize {
        match self.template.kind(id) {
            FieldKind::Array(elem) => self.var_bytes(id).len() / elem.size(),
            FieldKind::String | FieldKind::Bytes => self.var_bytes(id).len(),
            FieldKind::Scalar(_) => 1,
        }
    }

    /// Iterates the elements of an array field as scalars.
    pub fn array(&self, id: usize) -> impl Iterator<Item = Scalar> + 'a {
        let elem = match self.template.kind(id) {
            FieldKind::Array(elem) => elem,
            other => panic!("field {} is not an array, it is {}", id, other),
        };
        self.var_bytes(id).chunks_exact(elem.size()).map(move |chunk| Scalar::read(elem, chunk))
    }
}

/// Assembles output records for one layout. The builder's buffers are reused
/// across records; `finish` leaves the assembled bytes in an internal buffer
/// valid until the next `clear`.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    fixed: Vec<u8>,
    var_buf: Vec<u8>,
    var_slots: Vec<Option<(usize, usize)>>,
    scratch: Vec<u8>,
    out: Vec<u8>,
}

impl RecordBuilder {
    /// A builder for records of the given layout.
    pub fn new(template: &Template) -> RecordBuilder {
        let mut builder = RecordBuilder::default();
        builder.clear(template);
        builder
    }

    /// Resets the builder for a fresh record of the given layout.
    pub fn clear(&mut self, template: &Template) {
        self.fixed.clear();
        self.fixed.resize(template.fixed_size(), 0);
        self.var_buf.clear();
        self.var_slots.clear();
        self.var_slots.resize(template.len(), None);
        self.out.clear();
    }

    /// Writes a scalar field.
    pub fn set_scalar(&mut self, template: &Template, id: usize, value: &Scalar) {
        debug_assert_eq!(template.kind(id), FieldKind::Scalar(value.kind()));
        self.scratch.clear();
        value.write(&mut self.scratch);
        let at = template.offsets[id];
        self.fixed[at..at + self.scratch.len()].copy_from_slice(&self.scratch);
    }

    /// Copies a field's raw bytes; scalars land in the fixed part, everything
    /// else in the variable tail.
    pub fn set_raw(&mut self, template: &Template, id: usize, bytes: &[u8]) {
        match template.kind(id) {
            FieldKind::Scalar(kind) => {
                debug_assert_eq!(bytes.len(), kind.size());
                let at = template.offsets[id];
                self.fixed[at..at + bytes.len()].copy_from_slice(bytes);
            }
            _ => self.set_var(id, bytes),
        }
    }

    /// Writes a variable-length field's payload.
    pub fn set_var(&mut self, id: usize, bytes: &[u8]) {
        let start = self.var_buf.len();
        self.var_buf.extend_from_slice(bytes);
        self.var_slots[id] = Some((start, bytes.len()));
    }

    /// Writes an array field from a slice of scalars.
    pub fn set_array(&mut self, id: usize, values: &[Scalar]) {
        let start = self.var_buf.len();
        for value in values {
            value.write(&mut self.var_buf);
        }
        self.var_slots[id] = Some((start, self.var_buf.len() - start));
    }

    /// Assembles the record and returns its bytes.
    ///
    /// Unset variable-length fields serialise as empty. The result aliases an
    /// internal buffer, reused by the next `clear`.
    pub fn finish(&mut self, template: &Template) -> Result<&[u8], RecordError> {
        let total = self.fixed.len() + self.var_buf.len();
        if total > MAX_RECORD {
            return Err(RecordError::TooLarge);
        }
        self.out.clear();
        self.out.extend_from_slice(&self.fixed);
        self.out.extend_from_slice(&self.var_buf);
        let base = self.fixed.len();
        for id in 0..template.len() {
            if !template.kind(id).is_variable() {
                continue;
            }
            let (start, len) = self.var_slots[id].unwrap_or((0, 0));
            let at = template.offsets[id];
            let offset = (base + start) as u16;
            self.out[at..at + 2].copy_from_slice(&offset.to_le_bytes());
            self.out[at + 2..at + 4].copy_from_slice(&(len as u16).to_le_bytes());
        }
        Ok(&self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ip, Mac};

    fn test_schema() -> Schema {
        Schema::parse("time TIME_FIRST,uint32 COUNT,ipaddr SRC_IP,string LABEL,int16* VALUES,macaddr SRC_MAC")
            .unwrap()
    }

    #[test]
    fn schema_spec_roundtrip() {
        let schema = test_schema();
        assert_eq!(Schema::parse(&schema.to_string()).unwrap(), schema);
        assert_eq!(schema.id_of("SRC_IP"), Some(2));
        assert_eq!(schema.id_of("MISSING"), None);
    }

    #[test]
    fn schema_rejects_duplicates() {
        assert_eq!(
            Schema::parse("uint32 A,uint64 A"),
            Err(SchemaError::DuplicateName("A".to_string()))
        );
    }

    #[test]
    fn build_and_view_roundtrip() {
        let schema = test_schema();
        let template = Template::new(&schema);

        let mut builder = RecordBuilder::new(&template);
        builder.set_scalar(&template, 0, &Scalar::Time(Timestamp::from_secs(100)));
        builder.set_scalar(&template, 1, &Scalar::U32(7));
        builder.set_scalar(&template, 2, &Scalar::Ip(Ip::from_v4([10, 0, 0, 1])));
        builder.set_var(3, b"web");
        builder.set_array(4, &[Scalar::I16(-5), Scalar::I16(9)]);
        builder.set_scalar(&template, 5, &Scalar::Mac(Mac([6, 5, 4, 3, 2, 1])));
        let bytes = builder.finish(&template).unwrap().to_vec();

        let view = RecordView::new(&bytes, &template).unwrap();
        assert_eq!(view.time(0), Timestamp::from_secs(100));
        assert_eq!(view.scalar(1), Scalar::U32(7));
        assert_eq!(view.scalar(2), Scalar::Ip(Ip::from_v4([10, 0, 0, 1])));
        assert_eq!(view.var_bytes(3), b"web");
        assert_eq!(view.elem_count(4), 2);
        let values: Vec<_> = view.array(4).collect();
        assert_eq!(values, vec![Scalar::I16(-5), Scalar::I16(9)]);
        assert_eq!(view.scalar(5), Scalar::Mac(Mac([6, 5, 4, 3, 2, 1])));
    }

    #[test]
    fn view_rejects_truncated_records() {
        let schema = test_schema();
        let template = Template::new(&schema);
        let err = RecordView::new(&[0u8; 4], &template).unwrap_err();
        assert!(matches!(err, RecordError::Truncated { .. }));
    }

    #[test]
    fn view_rejects_out_of_range_slots() {
        let schema = Schema::parse("string LABEL").unwrap();
        let template = Template::new(&schema);
        // Slot claims 8 bytes at offset 4 in a 4-byte record.
        let bytes = [4u8, 0, 8, 0];
        let err = RecordView::new(&bytes, &template).unwrap_err();
        assert_eq!(err, RecordError::BadSlot { field: 0 });
    }

    #[test]
    fn view_rejects_partial_array_elements() {
        let schema = Schema::parse("int16* VALUES").unwrap();
        let template = Template::new(&schema);
        let bytes = [4u8, 0, 3, 0, 1, 2, 3];
        let err = RecordView::new(&bytes, &template).unwrap_err();
        assert_eq!(err, RecordError::BadArrayLength { field: 0 });
    }

    #[test]
    fn unset_variable_fields_serialise_empty() {
        let schema = Schema::parse("uint8 A,string B").unwrap();
        let template = Template::new(&schema);
        let mut builder = RecordBuilder::new(&template);
        builder.set_scalar(&template, 0, &Scalar::U8(1));
        let bytes = builder.finish(&template).unwrap().to_vec();
        let view = RecordView::new(&bytes, &template).unwrap();
        assert_eq!(view.var_bytes(1), b"");
    }
}
