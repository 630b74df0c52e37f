//! Helpers that consume a source to the end.

use silt_tuple::TupleRef;

use crate::source::SourceRef;
use crate::Result;

/// Pull up to `limit` tuples out of a source into a vector.
///
/// `None` means no limit: drain to end-of-stream.
pub fn collect_into_vec(source: &SourceRef, limit: Option<usize>) -> Result<Vec<TupleRef>> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    while out.len() < limit {
        match source.borrow_mut().next(None)? {
            Some(tuple) => out.push(tuple),
            None => break,
        }
    }
    Ok(out)
}

/// Drain a source and re-encode the result as one MessagePack array.
///
/// The output starts with an array header carrying the tuple count,
/// followed by the raw bytes of every tuple, which makes it a valid
/// chunk for a [`BufferSource`](crate::adapters::BufferSource).
pub fn encode_into_buffer(source: &SourceRef, limit: Option<usize>) -> Result<Vec<u8>> {
    let tuples = collect_into_vec(source, limit)?;
    let mut buf = Vec::new();
    rmp::encode::write_array_len(&mut buf, tuples.len() as u32).map_err(|e| {
        crate::MergeError::IllegalParams(format!("cannot encode result header: {e}"))
    })?;
    for tuple in &tuples {
        buf.extend_from_slice(tuple.data());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BufferSource;
    use crate::source::shared;

    fn one_chunk_source(chunk: Vec<u8>) -> SourceRef {
        let mut chunks = vec![chunk].into_iter();
        shared(BufferSource::new(Box::new(move || Ok(chunks.next()))))
    }

    #[test]
    fn test_collect_with_limit() {
        let source = one_chunk_source(b"\x93\x91\x01\x91\x02\x91\x03".to_vec());
        let tuples = collect_into_vec(&source, Some(2)).expect("collect");
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].data(), b"\x91\x01");
        assert_eq!(tuples[1].data(), b"\x91\x02");
    }

    #[test]
    fn test_encode_roundtrips_through_buffer_source() {
        let chunk = b"\x92\x91\x01\x91\x02".to_vec();
        let source = one_chunk_source(chunk.clone());
        let encoded = encode_into_buffer(&source, None).expect("encode");
        assert_eq!(encoded, chunk);

        // The encoded stream feeds a buffer source again.
        let reread = one_chunk_source(encoded);
        let tuples = collect_into_vec(&reread, None).expect("collect");
        assert_eq!(tuples.len(), 2);
    }

    #[test]
    fn test_encode_empty_source() {
        let source = one_chunk_source(b"\x90".to_vec());
        let encoded = encode_into_buffer(&source, None).expect("encode");
        assert_eq!(encoded, b"\x90".to_vec());
    }
}
