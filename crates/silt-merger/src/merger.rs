//! The k-way merger.

use std::cmp::Ordering;

use tracing::debug;

use silt_tuple::{tuple_compare, TupleFormat, TupleRef};

use crate::context::ContextRef;
use crate::source::{Source, SourceRef};
use crate::{MergeError, Result};

/// Holds a source to fetch next tuples from and the last fetched tuple
/// to compare against other nodes.
///
/// A node is distinct from its source: a source may be shared across
/// mergers, while the node carries the ephemeral per-merger tuple. The
/// tuple is `Some` exactly while the node sits in the heap.
struct HeapNode {
    source: SourceRef,
    tuple: Option<TupleRef>,
}

/// A source that merges N child sources into one ordered stream.
///
/// Tuples are stored internally in the context format for fast
/// comparisons and reformatted on the way out when the caller requests a
/// different format. The merger postpones charging its heap until the
/// first output tuple is requested, so building a merger is cheap and
/// nothing is pulled from the children early.
pub struct Merger {
    ctx: ContextRef,
    /// One node per child source, populated by `set_sources`.
    nodes: Vec<HeapNode>,
    /// Heap of indices into `nodes`; the root holds the next tuple.
    heap: Vec<usize>,
    /// Whether the merge started. Sources and direction freeze then.
    started: bool,
    /// Ascending (false) / descending (true) order.
    reverse: bool,
}

impl Merger {
    /// Create a merger without sources over a shared context.
    pub fn new(ctx: ContextRef) -> Self {
        Self {
            ctx,
            nodes: Vec::new(),
            heap: Vec::new(),
            started: false,
            reverse: false,
        }
    }

    /// Set the child sources.
    ///
    /// Valid exactly once, before the first `next` call.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::IllegalParams`] when the merge already
    /// started or sources were already set.
    pub fn set_sources(&mut self, sources: Vec<SourceRef>) -> Result<()> {
        if self.started || !self.nodes.is_empty() {
            return Err(MergeError::IllegalParams(
                "merger sources can only be set once, before the merge starts".to_string(),
            ));
        }
        self.nodes = sources
            .into_iter()
            .map(|source| HeapNode {
                source,
                tuple: None,
            })
            .collect();
        Ok(())
    }

    /// Set the merge direction.
    ///
    /// Valid only before the first `next` call.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::IllegalParams`] when the merge already
    /// started.
    pub fn set_reverse(&mut self, reverse: bool) -> Result<()> {
        if self.started {
            return Err(MergeError::IllegalParams(
                "merge direction cannot change after the merge starts".to_string(),
            ));
        }
        self.reverse = reverse;
        Ok(())
    }

    /// Fetch a first tuple from every source and build the heap.
    /// Empty sources are skipped and never polled again.
    fn start(&mut self) -> Result<()> {
        for index in 0..self.nodes.len() {
            let tuple = self.nodes[index]
                .source
                .borrow_mut()
                .next(Some(self.ctx.format()))?;
            if let Some(tuple) = tuple {
                self.nodes[index].tuple = Some(tuple);
                self.heap.push(index);
                self.sift_up(self.heap.len() - 1);
            }
        }
        self.started = true;
        debug!(
            sources = self.nodes.len(),
            charged = self.heap.len(),
            reverse = self.reverse,
            "merge started"
        );
        Ok(())
    }

    /// Whether node `a` must sit above node `b` in the heap.
    fn node_less(&self, a: usize, b: usize) -> bool {
        match (&self.nodes[a].tuple, &self.nodes[b].tuple) {
            (Some(ta), Some(tb)) => {
                let cmp = tuple_compare(ta, tb, self.ctx.key_def());
                if self.reverse {
                    cmp != Ordering::Less
                } else {
                    cmp == Ordering::Less
                }
            }
            // A node without a tuple does not belong to the heap; keep
            // it below everything until it is removed.
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.node_less(self.heap[pos], self.heap[parent]) {
                self.heap.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let mut best = pos;
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < self.heap.len() && self.node_less(self.heap[child], self.heap[best]) {
                    best = child;
                }
            }
            if best == pos {
                break;
            }
            self.heap.swap(pos, best);
            pos = best;
        }
    }

    /// Drop the heap root and restore the heap property.
    fn remove_root(&mut self) {
        if let Some(last) = self.heap.pop() {
            if !self.heap.is_empty() {
                self.heap[0] = last;
                self.sift_down(0);
            }
        }
    }
}

impl Source for Merger {
    fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>> {
        if !self.started {
            self.start()?;
        }

        let Some(&top) = self.heap.first() else {
            // Drained. Stays drained no matter how often it is polled.
            return Ok(None);
        };
        let Some(tuple) = self.nodes[top].tuple.clone() else {
            return Err(MergeError::IllegalParams(
                "heap node lost its tuple".to_string(),
            ));
        };

        // Reformat before touching the heap, so an error here leaves the
        // merge fully resumable.
        let out = match format {
            Some(f) if f.id() != tuple.format_id() => tuple.in_format(f)?,
            _ => tuple,
        };

        // Refill the root from its source. On error the node keeps its
        // old tuple and the heap stays consistent.
        let replacement = self.nodes[top]
            .source
            .borrow_mut()
            .next(Some(self.ctx.format()))?;
        match replacement {
            Some(t) => {
                self.nodes[top].tuple = Some(t);
                self.sift_down(0);
            }
            None => {
                self.nodes[top].tuple = None;
                self.remove_root();
            }
        }

        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ArraySource;
    use crate::context::MergerContext;
    use crate::source::shared;
    use rmpv::Value;
    use silt_tuple::{FieldType, KeyDef, KeyPart};
    use std::rc::Rc;

    fn unsigned_ctx() -> ContextRef {
        let key_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
        MergerContext::new(&key_def)
    }

    /// Array source over single-unsigned-field rows.
    fn array_source(values: Vec<u64>) -> SourceRef {
        let mut chunks = vec![values
            .into_iter()
            .map(|v| Value::Array(vec![Value::from(v)]))
            .collect::<Vec<_>>()]
        .into_iter();
        shared(ArraySource::new(Box::new(move || Ok(chunks.next()))))
    }

    fn drain_values(merger: &mut Merger) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(tuple) = merger.next(None).expect("next") {
            let field = tuple.field(0).expect("field 0");
            out.push(field.as_u64().expect("unsigned"));
        }
        out
    }

    #[test]
    fn test_basic_merge() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![array_source(vec![1, 3]), array_source(vec![2, 4])])
            .expect("set sources");
        assert_eq!(drain_values(&mut merger), vec![1, 2, 3, 4]);
        // Drained stays drained.
        assert!(merger.next(None).expect("next").is_none());
    }

    #[test]
    fn test_reverse_merge() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![array_source(vec![3, 1]), array_source(vec![4, 2])])
            .expect("set sources");
        merger.set_reverse(true).expect("set reverse");
        assert_eq!(drain_values(&mut merger), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_empty_sources_are_skipped() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![
                array_source(vec![]),
                array_source(vec![2]),
                array_source(vec![]),
            ])
            .expect("set sources");
        assert_eq!(drain_values(&mut merger), vec![2]);
    }

    #[test]
    fn test_all_sources_empty() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![array_source(vec![]), array_source(vec![])])
            .expect("set sources");
        assert!(merger.next(None).expect("next").is_none());
    }

    #[test]
    fn test_no_sources() {
        let mut merger = Merger::new(unsigned_ctx());
        assert!(merger.next(None).expect("next").is_none());
    }

    #[test]
    fn test_config_frozen_after_start() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![array_source(vec![1])])
            .expect("set sources");
        let _ = merger.next(None).expect("next");
        assert!(merger.set_reverse(true).is_err());
        assert!(merger.set_sources(vec![array_source(vec![2])]).is_err());
    }

    #[test]
    fn test_sources_set_only_once() {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![array_source(vec![1])])
            .expect("set sources");
        assert!(merger.set_sources(vec![array_source(vec![2])]).is_err());
    }

    #[test]
    fn test_lazy_first_fetch() {
        let calls = Rc::new(std::cell::Cell::new(0u32));
        let probe_calls = Rc::clone(&calls);
        let probe: SourceRef = shared(ArraySource::new(Box::new(move || {
            probe_calls.set(probe_calls.get() + 1);
            Ok(None)
        })));
        let mut merger = Merger::new(unsigned_ctx());
        merger.set_sources(vec![probe]).expect("set sources");
        // Nothing pulled yet: the merger charges lazily.
        assert_eq!(calls.get(), 0);
        assert!(merger.next(None).expect("next").is_none());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_internal_format_and_requested_format() {
        let ctx = unsigned_ctx();
        let internal_id = ctx.format().id();
        let mut merger = Merger::new(Rc::clone(&ctx));
        merger
            .set_sources(vec![array_source(vec![1])])
            .expect("set sources");

        let key_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
        let other = TupleFormat::new(&key_def);
        let tuple = merger
            .next(Some(&other))
            .expect("next")
            .expect("one tuple");
        assert_eq!(tuple.format_id(), other.id());
        assert_ne!(tuple.format_id(), internal_id);
        assert_eq!(tuple.data(), b"\x91\x01");
    }

    #[test]
    fn test_no_format_returns_internal() {
        let ctx = unsigned_ctx();
        let internal_id = ctx.format().id();
        let mut merger = Merger::new(ctx);
        merger
            .set_sources(vec![array_source(vec![1])])
            .expect("set sources");
        let tuple = merger.next(None).expect("next").expect("one tuple");
        assert_eq!(tuple.format_id(), internal_id);
    }

    #[test]
    fn test_nested_merger() {
        let ctx = unsigned_ctx();
        let mut inner = Merger::new(Rc::clone(&ctx));
        inner
            .set_sources(vec![array_source(vec![1, 5]), array_source(vec![3])])
            .expect("set sources");

        let mut outer = Merger::new(ctx);
        outer
            .set_sources(vec![shared(inner), array_source(vec![2, 4])])
            .expect("set sources");
        assert_eq!(drain_values(&mut outer), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let run = || {
            let mut merger = Merger::new(unsigned_ctx());
            merger
                .set_sources(vec![
                    array_source(vec![1, 2, 2, 7]),
                    array_source(vec![2, 2, 3]),
                    array_source(vec![0, 2]),
                ])
                .expect("set sources");
            let mut bytes = Vec::new();
            while let Some(tuple) = merger.next(None).expect("next") {
                bytes.extend_from_slice(tuple.data());
            }
            bytes
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_error_leaves_merge_resumable() {
        // A source that fails one refill, then recovers.
        let mut calls = 0u32;
        let flaky: SourceRef = shared(crate::adapters::SingleItemSource::new(Box::new(
            move || {
                calls += 1;
                match calls {
                    1 => Ok(Some(Value::Array(vec![Value::from(1u64)]))),
                    2 => Err(MergeError::IllegalParams("transient".to_string())),
                    3 => Ok(Some(Value::Array(vec![Value::from(3u64)]))),
                    _ => Ok(None),
                }
            },
        )));

        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![flaky, array_source(vec![2])])
            .expect("set sources");

        // The first step emits nothing: refilling the root fails and
        // the step aborts, with the root keeping its old tuple.
        assert!(merger.next(None).is_err());
        // The merge resumes consistently afterwards.
        assert_eq!(drain_values(&mut merger), vec![1, 2, 3]);
    }
}
