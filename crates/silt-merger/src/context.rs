//! Merger contexts.

use std::rc::Rc;

use silt_tuple::{KeyDef, TupleFormat};

/// A shared, reference-counted merger context.
pub type ContextRef = Rc<MergerContext>;

/// Immutable parameters shared by any number of mergers: the key
/// definition and the internal tuple format derived from it.
///
/// The context owns its copy of the key definition, so the caller's copy
/// may go away while mergers built over this context live on. Mergers
/// keep child tuples in the context format for fast comparisons and
/// reformat on the way out when the caller asks for something else.
#[derive(Debug)]
pub struct MergerContext {
    key_def: KeyDef,
    format: TupleFormat,
}

impl MergerContext {
    /// Create a context from a key definition.
    pub fn new(key_def: &KeyDef) -> ContextRef {
        let key_def = key_def.clone();
        let format = TupleFormat::new(&key_def);
        Rc::new(Self { key_def, format })
    }

    /// The key definition tuples are ordered by.
    pub fn key_def(&self) -> &KeyDef {
        &self.key_def
    }

    /// The internal format merged tuples are stored in.
    pub fn format(&self) -> &TupleFormat {
        &self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_tuple::{FieldType, KeyPart};

    #[test]
    fn test_context_owns_key_def_copy() {
        let key_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
        let ctx = MergerContext::new(&key_def);
        drop(key_def);
        assert_eq!(ctx.key_def().part_count(), 1);
        assert_ne!(ctx.format().id(), TupleFormat::runtime().id());
    }

    #[test]
    fn test_contexts_get_distinct_formats() {
        let key_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
        let a = MergerContext::new(&key_def);
        let b = MergerContext::new(&key_def);
        assert_ne!(a.format().id(), b.format().id());
    }
}
