//! The tuple comparator.
//!
//! Compares two tuples under a key definition: a hint fast path first,
//! then a field-wise walk. The comparator is total even on dirty data
//! so a merge over it always terminates with a deterministic order.

use std::cmp::Ordering;

use rmpv::Value;

use crate::hint;
use crate::key_def::{FieldType, KeyDef, KeyPart};
use crate::tuple::Tuple;
use crate::INVALID_HINT;

/// Compare two tuples under a key definition.
///
/// When both hints are valid and unequal, their unsigned order decides.
/// Otherwise every key part is compared in turn; nil and missing
/// nullable fields sort first.
pub fn tuple_compare(a: &Tuple, b: &Tuple, def: &KeyDef) -> Ordering {
    let ha = hint::tuple_hint(def, a);
    let hb = hint::tuple_hint(def, b);
    if ha != INVALID_HINT && hb != INVALID_HINT && ha != hb {
        return ha.cmp(&hb);
    }
    for part in def.parts() {
        let av = a.field(part.field_no);
        let bv = b.field(part.field_no);
        let ord = field_compare(part, av.as_ref(), bv.as_ref());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compare one field of each tuple under one key part.
fn field_compare(part: &KeyPart, a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !matches!(v, Value::Nil));
    let b = b.filter(|v| !matches!(v, Value::Nil));
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => value_compare(part, a, b),
    }
}

fn value_compare(part: &KeyPart, a: &Value, b: &Value) -> Ordering {
    match part.field_type {
        FieldType::Unsigned | FieldType::Integer | FieldType::Number => {
            match (numeric(a), numeric(b)) {
                (Some(na), Some(nb)) => na.compare(&nb),
                _ => fallback_compare(a, b),
            }
        }
        FieldType::Boolean => match (a, b) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => fallback_compare(a, b),
        },
        FieldType::String => match (a, b) {
            (Value::String(a), Value::String(b)) => match part.collation {
                Some(coll) => coll.compare(a.as_bytes(), b.as_bytes()),
                None => a.as_bytes().cmp(b.as_bytes()),
            },
            _ => fallback_compare(a, b),
        },
    }
}

/// Exact numeric value of a field: a wide integer or a float.
enum Num {
    Int(i128),
    Float(f64),
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Integer(i) => {
            if let Some(v) = i.as_i64() {
                Some(Num::Int(i128::from(v)))
            } else {
                i.as_u64().map(|v| Num::Int(i128::from(v)))
            }
        }
        Value::F32(f) => Some(Num::Float(f64::from(*f))),
        Value::F64(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

impl Num {
    /// Exact comparison; integers never go through a lossy cast.
    /// NaN sorts after every number, deterministically.
    fn compare(&self, other: &Num) -> Ordering {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.cmp(b),
            (Num::Float(a), Num::Float(b)) => a.total_cmp(b),
            (Num::Int(a), Num::Float(b)) => int_float_compare(*a, *b),
            (Num::Float(a), Num::Int(b)) => int_float_compare(*b, *a).reverse(),
        }
    }
}

fn int_float_compare(i: i128, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    if f > i128::MAX as f64 {
        return Ordering::Less;
    }
    if f < i128::MIN as f64 {
        return Ordering::Greater;
    }
    let trunc = f.trunc() as i128;
    match i.cmp(&trunc) {
        Ordering::Equal => {
            if f.fract() > 0.0 {
                Ordering::Less
            } else if f.fract() < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ord => ord,
    }
}

/// Total order for values that do not match the declared field type.
///
/// Ranks by MessagePack class first, then by encoded bytes, so merges
/// over dirty data still terminate with a stable order.
fn fallback_compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Nil => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::F32(_) | Value::F64(_) => 2,
            Value::String(_) => 3,
            Value::Binary(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
            Value::Ext(..) => 7,
        }
    }
    fn encoded(v: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = rmpv::encode::write_value(&mut buf, v);
        buf
    }
    rank(a).cmp(&rank(b)).then_with(|| encoded(a).cmp(&encoded(b)))
}
