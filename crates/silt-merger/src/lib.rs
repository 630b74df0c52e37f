//! # silt-merger
//!
//! Streaming k-way merge over heterogeneous tuple sources.
//!
//! This crate implements:
//! - The [`Source`](source::Source) capability: a pull-based producer of
//!   ordered tuples with an optional output format
//! - Three concrete adapters over fetcher callbacks: binary buffers,
//!   decoded row arrays, and single-item producers
//! - The [`Merger`](merger::Merger): a source that merges N child sources
//!   into one globally ordered stream via a binary min-heap (max-heap when
//!   reversed)
//! - Drain helpers that collect or re-encode a merged stream
//!
//! A merger is itself a source, so mergers nest into a DAG: leaf adapters
//! feed inner mergers which feed outer mergers. Sources are shared through
//! reference counting and fetched lazily; nothing is pulled before the
//! first call to `next`.

pub mod adapters;
pub mod context;
pub mod drain;
pub mod merger;
pub mod source;

pub use adapters::{ArraySource, BufferSource, SingleItemSource};
pub use context::{ContextRef, MergerContext};
pub use merger::Merger;
pub use source::{shared, Source, SourceRef};

use silt_tuple::TupleError;

/// Error types for merge operations.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// A fetcher produced malformed data or an argument was invalid.
    #[error("illegal params: {0}")]
    IllegalParams(String),

    /// A tuple claimed by a chunk header runs past the chunk.
    #[error("unexpected msgpack buffer end")]
    UnexpectedEnd,

    /// Error bubbled up from tuple construction.
    #[error(transparent)]
    Tuple(#[from] TupleError),
}

/// Convenience result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
