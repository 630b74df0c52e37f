//! Tuples and tuple formats.
//!
//! A tuple is an immutable MessagePack array of fields plus the id of the
//! format it was built with. Tuple bytes are never mutated; sharing happens
//! through [`TupleRef`] reference counting. A format is a lightweight
//! identity object: two tuples are byte-compatible when their format ids
//! match, and reformatting a tuple copies its bytes under the new id.

use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::key_def::KeyDef;
use crate::{Result, TupleError};

/// Process-wide identity of a tuple format.
pub type FormatId = u32;

/// Id of the default runtime format.
pub const RUNTIME_FORMAT_ID: FormatId = 0;

static NEXT_FORMAT_ID: AtomicU32 = AtomicU32::new(1);

/// A tuple format: an identity plus the minimal field layout implied by
/// the key definition it was derived from.
#[derive(Clone, Debug)]
pub struct TupleFormat {
    /// Unique format id. Id 0 is the runtime format.
    id: FormatId,
    /// Minimal field count a tuple of this format must have.
    min_field_count: u32,
}

impl TupleFormat {
    /// The default runtime format. Puts no constraints on tuples.
    pub fn runtime() -> Self {
        Self {
            id: RUNTIME_FORMAT_ID,
            min_field_count: 0,
        }
    }

    /// Create a new format derived from a key definition.
    ///
    /// Every tuple of this format must have at least enough fields to
    /// cover the highest key part field index.
    pub fn new(key_def: &KeyDef) -> Self {
        let min_field_count = key_def
            .parts()
            .iter()
            .map(|p| p.field_no + 1)
            .max()
            .unwrap_or(0);
        Self {
            id: NEXT_FORMAT_ID.fetch_add(1, Ordering::Relaxed),
            min_field_count,
        }
    }

    /// Return the format id.
    pub fn id(&self) -> FormatId {
        self.id
    }

    /// Return the minimal field count for tuples of this format.
    pub fn min_field_count(&self) -> u32 {
        self.min_field_count
    }
}

impl Default for TupleFormat {
    fn default() -> Self {
        Self::runtime()
    }
}

impl PartialEq for TupleFormat {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TupleFormat {}

/// A shared, reference-counted tuple.
pub type TupleRef = Rc<Tuple>;

/// An immutable tuple: a MessagePack array of fields and a format id.
#[derive(Debug)]
pub struct Tuple {
    /// MessagePack bytes: array header followed by the fields.
    data: Box<[u8]>,
    /// Id of the format this tuple was built with.
    format_id: FormatId,
    /// Number of fields, decoded once at construction.
    field_count: u32,
}

impl Tuple {
    /// Build a tuple from MessagePack bytes under the given format.
    ///
    /// The bytes must be exactly one well-formed MessagePack array with at
    /// least [`TupleFormat::min_field_count`] elements.
    ///
    /// # Errors
    ///
    /// Returns [`TupleError::IllegalParams`] if the data is not a single
    /// MessagePack array or is too short for the format.
    pub fn new(format: &TupleFormat, data: &[u8]) -> Result<TupleRef> {
        let mut rd = data;
        let field_count = rmp::decode::read_array_len(&mut rd)
            .map_err(|e| TupleError::IllegalParams(format!("tuple is not an array: {e}")))?;
        for i in 0..field_count {
            rmpv::decode::read_value(&mut rd).map_err(|e| {
                TupleError::IllegalParams(format!("malformed tuple field {i}: {e}"))
            })?;
        }
        if !rd.is_empty() {
            return Err(TupleError::IllegalParams(format!(
                "{} trailing bytes after tuple",
                rd.len()
            )));
        }
        if field_count < format.min_field_count {
            return Err(TupleError::IllegalParams(format!(
                "tuple has {field_count} fields, format requires at least {}",
                format.min_field_count
            )));
        }
        Ok(Rc::new(Self {
            data: data.into(),
            format_id: format.id,
            field_count,
        }))
    }

    /// Build a tuple by encoding a decoded MessagePack row.
    ///
    /// # Errors
    ///
    /// Returns [`TupleError::IllegalParams`] if the row is not an array
    /// or does not satisfy the format.
    pub fn from_value(format: &TupleFormat, row: &rmpv::Value) -> Result<TupleRef> {
        if !matches!(row, rmpv::Value::Array(_)) {
            return Err(TupleError::IllegalParams(
                "tuple row is not an array".to_string(),
            ));
        }
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, row)
            .map_err(|e| TupleError::IllegalParams(format!("cannot encode tuple row: {e}")))?;
        Self::new(format, &buf)
    }

    /// Return the raw MessagePack bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Return the id of the format this tuple belongs to.
    pub fn format_id(&self) -> FormatId {
        self.format_id
    }

    /// Return the number of fields.
    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Decode the field at `index`, or `None` when out of range.
    ///
    /// Decoding is linear from the start of the tuple; tuples are small
    /// and the bytes were validated at construction.
    pub fn field(&self, index: u32) -> Option<rmpv::Value> {
        if index >= self.field_count {
            return None;
        }
        let mut rd: &[u8] = &self.data;
        rmp::decode::read_array_len(&mut rd).ok()?;
        let mut value = None;
        for _ in 0..=index {
            value = rmpv::decode::read_value(&mut rd).ok();
        }
        value
    }

    /// Copy this tuple into another format.
    ///
    /// Returns a new tuple (a new allocation and a fresh reference) with
    /// the same bytes and the target format id. Callers are expected to
    /// skip the copy when the ids already match.
    ///
    /// # Errors
    ///
    /// Returns [`TupleError::IllegalParams`] if the tuple is too short
    /// for the target format.
    pub fn in_format(&self, format: &TupleFormat) -> Result<TupleRef> {
        Tuple::new(format, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_def::{FieldType, KeyPart};

    fn unsigned_key_def() -> KeyDef {
        KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def")
    }

    #[test]
    fn test_format_ids_are_unique() {
        let def = unsigned_key_def();
        let f1 = TupleFormat::new(&def);
        let f2 = TupleFormat::new(&def);
        assert_ne!(f1.id(), f2.id());
        assert_ne!(f1.id(), RUNTIME_FORMAT_ID);
        assert_eq!(TupleFormat::runtime().id(), RUNTIME_FORMAT_ID);
    }

    #[test]
    fn test_new_tuple_roundtrip() {
        // [1, "a"]
        let data = b"\x92\x01\xa1a";
        let tuple = Tuple::new(&TupleFormat::runtime(), data).expect("tuple");
        assert_eq!(tuple.data(), data);
        assert_eq!(tuple.field_count(), 2);
        assert_eq!(tuple.field(0), Some(rmpv::Value::from(1u64)));
        assert_eq!(tuple.field(1), Some(rmpv::Value::from("a")));
        assert_eq!(tuple.field(2), None);
    }

    #[test]
    fn test_non_array_rejected() {
        // A bare uint is not a tuple.
        let result = Tuple::new(&TupleFormat::runtime(), b"\x01");
        assert!(result.is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        // [1] followed by a stray byte.
        let result = Tuple::new(&TupleFormat::runtime(), b"\x91\x01\x01");
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_field_rejected() {
        // Array of one claims a str of length 5 with no body.
        let result = Tuple::new(&TupleFormat::runtime(), b"\x91\xa5");
        assert!(result.is_err());
    }

    #[test]
    fn test_format_min_field_count() {
        let def = KeyDef::new(vec![KeyPart::new(2, FieldType::Unsigned)]).expect("key def");
        let format = TupleFormat::new(&def);
        assert_eq!(format.min_field_count(), 3);
        // [1] has too few fields for a key on field 2.
        assert!(Tuple::new(&format, b"\x91\x01").is_err());
        // [1, 2, 3] is fine.
        assert!(Tuple::new(&format, b"\x93\x01\x02\x03").is_ok());
    }

    #[test]
    fn test_in_format_copies_bytes() {
        let def = unsigned_key_def();
        let format = TupleFormat::new(&def);
        let tuple = Tuple::new(&TupleFormat::runtime(), b"\x91\x01").expect("tuple");
        let copy = tuple.in_format(&format).expect("reformat");
        assert_eq!(copy.data(), tuple.data());
        assert_eq!(copy.format_id(), format.id());
        assert_ne!(copy.format_id(), tuple.format_id());
    }

    #[test]
    fn test_from_value() {
        let row = rmpv::Value::Array(vec![rmpv::Value::from(7u64)]);
        let tuple = Tuple::from_value(&TupleFormat::runtime(), &row).expect("tuple");
        assert_eq!(tuple.data(), b"\x91\x07");

        let not_a_row = rmpv::Value::from(7u64);
        assert!(Tuple::from_value(&TupleFormat::runtime(), &not_a_row).is_err());
    }
}
