//! Key definitions: which fields to extract and how to order them.

use serde::{Deserialize, Serialize};

use crate::{Result, TupleError};

/// Type of an indexed field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Non-negative integers.
    Unsigned,
    /// Signed integers.
    Integer,
    /// Signed integers or floating point numbers.
    Number,
    /// Booleans, false < true.
    Boolean,
    /// UTF-8 strings, binary order unless a collation is set.
    String,
}

/// String collation. Changes both ordering and hint derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collation {
    /// ASCII case-insensitive ordering.
    CaseInsensitive,
}

impl Collation {
    /// Derive a 64-bit hint for a string under this collation.
    ///
    /// The unsigned order of hints mirrors the collation order of the
    /// strings they were derived from.
    pub fn hint(&self, s: &[u8]) -> u64 {
        match self {
            Collation::CaseInsensitive => {
                let mut result = 0u64;
                let take = s.len().min(8);
                for &byte in &s[..take] {
                    result = (result << 8) | u64::from(byte.to_ascii_lowercase());
                }
                result << (8 * (8 - take))
            }
        }
    }

    /// Compare two strings under this collation.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        match self {
            Collation::CaseInsensitive => {
                let ia = a.iter().map(u8::to_ascii_lowercase);
                let ib = b.iter().map(u8::to_ascii_lowercase);
                ia.cmp(ib)
            }
        }
    }
}

/// One part of a key definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    /// Zero-based index of the tuple field this part reads.
    pub field_no: u32,
    /// Field type.
    pub field_type: FieldType,
    /// Optional collation; only meaningful for string parts.
    #[serde(default)]
    pub collation: Option<Collation>,
    /// Whether the field may be absent or nil. Nil sorts first.
    #[serde(default)]
    pub is_nullable: bool,
}

impl KeyPart {
    /// Create a non-nullable part without collation.
    pub fn new(field_no: u32, field_type: FieldType) -> Self {
        Self {
            field_no,
            field_type,
            collation: None,
            is_nullable: false,
        }
    }

    /// Mark this part nullable.
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Attach a collation to this part.
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }
}

/// An ordered list of key parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDef {
    parts: Vec<KeyPart>,
}

impl KeyDef {
    /// Create a key definition from parts.
    ///
    /// # Errors
    ///
    /// Returns [`TupleError::IllegalParams`] when `parts` is empty.
    pub fn new(parts: Vec<KeyPart>) -> Result<Self> {
        if parts.is_empty() {
            return Err(TupleError::IllegalParams(
                "key definition must have at least one part".to_string(),
            ));
        }
        Ok(Self { parts })
    }

    /// Return the parts in order.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Return the number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Whether any part is nullable.
    pub fn is_nullable(&self) -> bool {
        self.parts.iter().any(|p| p.is_nullable)
    }

    /// Merge primary-key parts into this definition.
    ///
    /// Returns the extended definition used for tie-breaking: this
    /// definition's parts followed by the primary parts whose fields
    /// are not already covered. Mergers over non-unique or nullable
    /// indexes compare with the extended definition so equal user keys
    /// still have a total order.
    pub fn merge(&self, primary: &KeyDef) -> KeyDef {
        let mut parts = self.parts.clone();
        for part in &primary.parts {
            if !parts.iter().any(|p| p.field_no == part.field_no) {
                parts.push(part.clone());
            }
        }
        KeyDef { parts }
    }

    /// Derive a comparison hint from an encoded key.
    ///
    /// `key` holds the MessagePack value of the first key part. See
    /// [`crate::hint`] for the encoding table.
    pub fn key_hint(&self, key: &[u8]) -> u64 {
        crate::hint::key_hint(self, key)
    }

    /// Derive a comparison hint from a tuple.
    pub fn tuple_hint(&self, tuple: &crate::Tuple) -> u64 {
        crate::hint::tuple_hint(self, tuple)
    }
}
