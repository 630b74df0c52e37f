//! The source capability.

use std::cell::RefCell;
use std::rc::Rc;

use silt_tuple::{TupleFormat, TupleRef};

use crate::Result;

/// A pull-based producer of tuples.
///
/// A source hands out one tuple per `next` call and signals end-of-stream
/// with `None`. The returned tuple is a fresh reference owned by the
/// caller. When `format` is given, the tuple is delivered in that format
/// (reformatting allocates a new tuple); when `None`, any format will do.
///
/// Cleanup happens on drop at refcount zero; there is no separate delete
/// operation.
pub trait Source {
    /// Fetch the next tuple, or `None` at end-of-stream.
    fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>>;
}

/// A shared, reference-counted source.
///
/// Sources are co-owned: the creating side keeps a reference while a
/// merger holds another through its heap nodes.
pub type SourceRef = Rc<RefCell<dyn Source>>;

/// Wrap a concrete source into a shared reference.
pub fn shared<S: Source + 'static>(source: S) -> SourceRef {
    Rc::new(RefCell::new(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_tuple::Tuple;

    /// A source producing a fixed run of single-field tuples.
    struct CountSource {
        next_value: u8,
        end: u8,
    }

    impl Source for CountSource {
        fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>> {
            if self.next_value >= self.end {
                return Ok(None);
            }
            let data = [0x91, self.next_value];
            self.next_value += 1;
            let runtime = TupleFormat::runtime();
            let format = format.unwrap_or(&runtime);
            Ok(Some(Tuple::new(format, &data)?))
        }
    }

    #[test]
    fn test_shared_source_is_co_owned() {
        let source = shared(CountSource {
            next_value: 1,
            end: 3,
        });
        let other = Rc::clone(&source);
        assert_eq!(Rc::strong_count(&source), 2);

        let first = other.borrow_mut().next(None).expect("next");
        assert_eq!(first.expect("tuple").data(), b"\x91\x01");
        let second = source.borrow_mut().next(None).expect("next");
        assert_eq!(second.expect("tuple").data(), b"\x91\x02");
        let end = source.borrow_mut().next(None).expect("next");
        assert!(end.is_none());
    }
}
