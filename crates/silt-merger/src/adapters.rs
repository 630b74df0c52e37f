//! Concrete sources over fetcher callbacks.
//!
//! Each adapter owns a boxed fetcher closure with the contract "called
//! repeatedly; returns `Some(chunk)` with the next chunk of data or
//! `None` at end-of-stream". Fetchers are invoked lazily: nothing is
//! pulled until a consumer actually asks for a tuple, and a drained
//! chunk triggers exactly one re-fetch.

use rmpv::Value;
use tracing::debug;

use silt_tuple::{Tuple, TupleFormat, TupleRef};

use crate::source::Source;
use crate::{MergeError, Result};

/// Fetcher for [`BufferSource`]: raw MessagePack chunks.
pub type BufferFetcher = Box<dyn FnMut() -> Result<Option<Vec<u8>>>>;

/// Fetcher for [`ArraySource`]: chunks of decoded rows.
pub type ArrayFetcher = Box<dyn FnMut() -> Result<Option<Vec<Value>>>>;

/// Fetcher for [`SingleItemSource`]: one decoded row per call.
pub type ItemFetcher = Box<dyn FnMut() -> Result<Option<Value>>>;

/// A source decoding tuples out of binary MessagePack chunks.
///
/// Every chunk starts with an array header carrying the number of tuples
/// that follow. Decoding is linear, one tuple per `next` call; the chunk
/// is dropped and the fetcher re-invoked once the claimed count is
/// consumed.
pub struct BufferSource {
    fetch: BufferFetcher,
    /// Current chunk; tuples are sliced out of it in place.
    chunk: Vec<u8>,
    /// Read position within the chunk.
    pos: usize,
    /// Tuples still claimed by the chunk header.
    remaining: u32,
}

impl BufferSource {
    /// Create a buffer source over a fetcher.
    pub fn new(fetch: BufferFetcher) -> Self {
        Self {
            fetch,
            chunk: Vec::new(),
            pos: 0,
            remaining: 0,
        }
    }

    /// Pull the next chunk and decode its header.
    ///
    /// A missing chunk or a zero-length array ends the stream (keeps
    /// `remaining` at 0).
    fn refill(&mut self) -> Result<()> {
        let Some(chunk) = (self.fetch)()? else {
            return Ok(());
        };
        let mut rd: &[u8] = &chunk;
        let count = rmp::decode::read_array_len(&mut rd).map_err(|e| {
            MergeError::IllegalParams(format!("buffer chunk does not start with an array: {e}"))
        })?;
        self.pos = chunk.len() - rd.len();
        self.chunk = chunk;
        self.remaining = count;
        debug!(tuples = count, "buffer source fetched a chunk");
        Ok(())
    }
}

impl Source for BufferSource {
    fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>> {
        if self.remaining == 0 {
            self.refill()?;
            if self.remaining == 0 {
                return Ok(None);
            }
        }
        // Find the boundary of the next tuple. A truncated value means
        // the header claimed more than the chunk holds.
        let mut rd = &self.chunk[self.pos..];
        let before = rd.len();
        rmpv::decode::read_value(&mut rd).map_err(|_| MergeError::UnexpectedEnd)?;
        let consumed = before - rd.len();

        let data = &self.chunk[self.pos..self.pos + consumed];
        self.pos += consumed;
        self.remaining -= 1;

        let runtime = TupleFormat::runtime();
        let format = format.unwrap_or(&runtime);
        Ok(Some(Tuple::new(format, data)?))
    }
}

/// A source emitting tuples out of chunks of decoded rows.
pub struct ArraySource {
    fetch: ArrayFetcher,
    chunk: Vec<Value>,
    next_idx: usize,
}

impl ArraySource {
    /// Create an array source over a fetcher.
    pub fn new(fetch: ArrayFetcher) -> Self {
        Self {
            fetch,
            chunk: Vec::new(),
            next_idx: 0,
        }
    }
}

impl Source for ArraySource {
    fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>> {
        if self.next_idx >= self.chunk.len() {
            let Some(chunk) = (self.fetch)()? else {
                return Ok(None);
            };
            self.chunk = chunk;
            self.next_idx = 0;
            if self.chunk.is_empty() {
                return Ok(None);
            }
        }
        let row = &self.chunk[self.next_idx];
        self.next_idx += 1;

        let runtime = TupleFormat::runtime();
        let format = format.unwrap_or(&runtime);
        Ok(Some(Tuple::from_value(format, row)?))
    }
}

/// A source whose fetcher yields at most one row per call.
pub struct SingleItemSource {
    fetch: ItemFetcher,
}

impl SingleItemSource {
    /// Create a single-item source over a fetcher.
    pub fn new(fetch: ItemFetcher) -> Self {
        Self { fetch }
    }
}

impl Source for SingleItemSource {
    fn next(&mut self, format: Option<&TupleFormat>) -> Result<Option<TupleRef>> {
        let Some(row) = (self.fetch)()? else {
            return Ok(None);
        };
        let runtime = TupleFormat::runtime();
        let format = format.unwrap_or(&runtime);
        Ok(Some(Tuple::from_value(format, &row)?))
    }
}
