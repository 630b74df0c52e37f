//! Integration test: k-way merging across source kinds.
//!
//! Exercises the complete merge pipeline:
//! 1. Array sources merged under an unsigned single-part key
//! 2. Buffer sources with chunked fetches feeding a nested merger
//! 3. Reverse duality between forward and reverse merges
//! 4. Reformat behavior on the output boundary
//! 5. A collated string key across mixed source kinds

use std::rc::Rc;

use rmpv::Value;

use silt_merger::{
    drain, shared, ArraySource, BufferSource, Merger, MergerContext, Source, SingleItemSource,
    SourceRef,
};
use silt_tuple::{Collation, FieldType, KeyDef, KeyPart, TupleFormat};

/// Array source over rows of single unsigned fields.
fn array_source(values: Vec<u64>) -> SourceRef {
    let mut chunks = vec![values
        .into_iter()
        .map(|v| Value::Array(vec![Value::from(v)]))
        .collect::<Vec<_>>()]
    .into_iter();
    shared(ArraySource::new(Box::new(move || Ok(chunks.next()))))
}

/// Buffer source serving the given pre-encoded chunks one per fetch.
fn buffer_source(chunks: Vec<Vec<u8>>) -> SourceRef {
    let mut iter = chunks.into_iter();
    shared(BufferSource::new(Box::new(move || Ok(iter.next()))))
}

/// Encode `values` as one buffer chunk: array header + `[v]` tuples.
fn chunk_of(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    rmp::encode::write_array_len(&mut buf, values.len() as u32).expect("header");
    for &v in values {
        rmp::encode::write_array_len(&mut buf, 1).expect("tuple header");
        rmp::encode::write_uint(&mut buf, v).expect("field");
    }
    buf
}

fn unsigned_ctx() -> Rc<MergerContext> {
    let key_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
    MergerContext::new(&key_def)
}

fn drain_firsts(merger: Merger) -> Vec<u64> {
    let source = shared(merger);
    drain::collect_into_vec(&source, None)
        .expect("drain")
        .into_iter()
        .map(|t| t.field(0).expect("field").as_u64().expect("unsigned"))
        .collect()
}

#[test]
fn merger_basic_two_array_sources() {
    // =========================================================
    // The canonical merge: {1},{3} with {2},{4} gives 1,2,3,4.
    // =========================================================
    let mut merger = Merger::new(unsigned_ctx());
    merger
        .set_sources(vec![array_source(vec![1, 3]), array_source(vec![2, 4])])
        .expect("set sources");

    let source = shared(merger);
    let tuples = drain::collect_into_vec(&source, None).expect("drain");
    assert_eq!(tuples.len(), 4);
    let expected: Vec<&[u8]> = vec![b"\x91\x01", b"\x91\x02", b"\x91\x03", b"\x91\x04"];
    for (tuple, want) in tuples.iter().zip(expected) {
        assert_eq!(tuple.data(), want);
    }
    // End-of-stream is sticky.
    assert!(source.borrow_mut().next(None).expect("next").is_none());
}

#[test]
fn buffer_sources_feed_nested_merger() {
    // =========================================================
    // Step 1: two buffer sources, each split across two fetches
    // =========================================================
    let evens = buffer_source(vec![chunk_of(&[0, 2, 4]), chunk_of(&[6, 8])]);
    let odds = buffer_source(vec![chunk_of(&[1, 3]), chunk_of(&[5, 7, 9])]);

    // =========================================================
    // Step 2: inner merger over the buffers, outer merger adds
    // an array source on top
    // =========================================================
    let ctx = unsigned_ctx();
    let mut inner = Merger::new(Rc::clone(&ctx));
    inner.set_sources(vec![evens, odds]).expect("set sources");

    let mut outer = Merger::new(ctx);
    outer
        .set_sources(vec![shared(inner), array_source(vec![10, 11])])
        .expect("set sources");

    assert_eq!(drain_firsts(outer), (0..=11).collect::<Vec<u64>>());
}

#[test]
fn reverse_duality() {
    let forward = {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![
                array_source(vec![1, 4, 9]),
                array_source(vec![2, 3]),
                array_source(vec![]),
            ])
            .expect("set sources");
        drain_firsts(merger)
    };

    let backward = {
        let mut merger = Merger::new(unsigned_ctx());
        merger
            .set_sources(vec![
                array_source(vec![9, 4, 1]),
                array_source(vec![3, 2]),
                array_source(vec![]),
            ])
            .expect("set sources");
        merger.set_reverse(true).expect("set reverse");
        drain_firsts(merger)
    };

    let mut reversed = forward.clone();
    reversed.reverse();
    assert_eq!(backward, reversed);
    assert_eq!(forward, vec![1, 2, 3, 4, 9]);
}

#[test]
fn native_format_output_keeps_bytes() {
    let ctx = unsigned_ctx();
    let mut merger = Merger::new(Rc::clone(&ctx));
    merger
        .set_sources(vec![array_source(vec![5])])
        .expect("set sources");

    // Asking for the merger's own internal format must not copy or
    // alter the bytes.
    let tuple = merger
        .next(Some(ctx.format()))
        .expect("next")
        .expect("tuple");
    assert_eq!(tuple.data(), b"\x91\x05");
    assert_eq!(tuple.format_id(), ctx.format().id());

    // A different format keeps bytes identical too, under a new id.
    let other_def = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).expect("key def");
    let other = TupleFormat::new(&other_def);
    let mut merger = Merger::new(Rc::clone(&ctx));
    merger
        .set_sources(vec![array_source(vec![5])])
        .expect("set sources");
    let tuple = merger.next(Some(&other)).expect("next").expect("tuple");
    assert_eq!(tuple.data(), b"\x91\x05");
    assert_eq!(tuple.format_id(), other.id());
}

#[test]
fn collated_string_key_across_source_kinds() {
    let key_def = KeyDef::new(vec![
        KeyPart::new(0, FieldType::String).with_collation(Collation::CaseInsensitive)
    ])
    .expect("key def");
    let ctx = MergerContext::new(&key_def);

    let upper = {
        let mut chunks = vec![vec![
            Value::Array(vec![Value::from("Apple")]),
            Value::Array(vec![Value::from("Cherry")]),
        ]]
        .into_iter();
        shared(ArraySource::new(Box::new(move || Ok(chunks.next()))))
    };
    let lower = {
        let mut rows = vec![
            Value::Array(vec![Value::from("banana")]),
            Value::Array(vec![Value::from("date")]),
        ]
        .into_iter();
        shared(SingleItemSource::new(Box::new(move || Ok(rows.next()))))
    };

    let mut merger = Merger::new(ctx);
    merger.set_sources(vec![upper, lower]).expect("set sources");

    let source = shared(merger);
    let words: Vec<String> = drain::collect_into_vec(&source, None)
        .expect("drain")
        .into_iter()
        .map(|t| {
            t.field(0)
                .expect("field")
                .as_str()
                .expect("string")
                .to_string()
        })
        .collect();
    assert_eq!(words, vec!["Apple", "banana", "Cherry", "date"]);
}

#[test]
fn merged_stream_reencodes_as_buffer_chunk() {
    let mut merger = Merger::new(unsigned_ctx());
    merger
        .set_sources(vec![array_source(vec![1, 3]), array_source(vec![2])])
        .expect("set sources");
    let source = shared(merger);

    let encoded = drain::encode_into_buffer(&source, None).expect("encode");
    assert_eq!(encoded, chunk_of(&[1, 2, 3]));

    // The re-encoded stream is itself a valid buffer-source chunk.
    let reread = buffer_source(vec![encoded]);
    let tuples = drain::collect_into_vec(&reread, None).expect("drain");
    assert_eq!(tuples.len(), 3);
}
