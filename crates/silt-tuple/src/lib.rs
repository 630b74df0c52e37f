//! # silt-tuple
//!
//! Tuples, tuple formats and key definitions for the Silt merge framework.
//!
//! This crate implements:
//! - Immutable, reference-counted tuples holding a MessagePack field array
//! - Lightweight tuple formats with process-wide identity
//! - Key definitions: ordered field/type/collation/nullability parts
//! - 64-bit comparison hints whose unsigned order mirrors field order
//! - The tuple comparator (hint fast path, field-wise fallback)
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Hint width | 64 bits |
//! | Invalid hint sentinel | `u64::MAX` |
//! | String hint prefix | first 8 bytes, big-endian, zero-padded |
//! | Runtime format id | 0 |

pub mod compare;
pub mod hint;
pub mod key_def;
pub mod tuple;

pub use compare::tuple_compare;
pub use key_def::{Collation, FieldType, KeyDef, KeyPart};
pub use tuple::{FormatId, Tuple, TupleFormat, TupleRef};

/// Sentinel hint meaning "no useful hint, run the full comparator".
pub const INVALID_HINT: u64 = u64::MAX;

/// Error types for tuple operations.
#[derive(Debug, thiserror::Error)]
pub enum TupleError {
    /// Malformed MessagePack data or an invalid argument.
    #[error("illegal params: {0}")]
    IllegalParams(String),
}

/// Convenience result type for tuple operations.
pub type Result<T> = std::result::Result<T, TupleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_hint_is_max() {
        assert_eq!(INVALID_HINT, u64::MAX);
    }

    #[test]
    fn test_error_display() {
        let err = TupleError::IllegalParams("not an array".to_string());
        assert_eq!(err.to_string(), "illegal params: not an array");
    }
}
