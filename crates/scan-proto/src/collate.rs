//! Collation ordering over encoded index keys.
//!
//! Collate-encoded binary keys (6.5+ servers) sort bytewise in index order,
//! which is the only property the merge layer relies on. JSON-encoded keys
//! (legacy servers) are compared by parsed JSON type then value, mirroring
//! the index's composite ordering.

use crate::messages::DataEncoding;
use std::cmp::Ordering;

/// Compare two encoded secondary keys under the given wire encoding.
pub fn compare_keys(encoding: DataEncoding, a: &[u8], b: &[u8]) -> Ordering {
    match encoding {
        DataEncoding::Collated => a.cmp(b),
        DataEncoding::Json => compare_json_keys(a, b),
    }
}

fn compare_json_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (
        serde_json::from_slice::<serde_json::Value>(a),
        serde_json::from_slice::<serde_json::Value>(b),
    ) {
        (Ok(a), Ok(b)) => compare_json(&a, &b),
        // Un-parseable keys order after everything, stably by raw bytes.
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// JSON values order by type rank (null < false < true < number < string <
/// array < object), then by value within the type.
pub fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value::*;

    fn rank(v: &serde_json::Value) -> u8 {
        match v {
            Null => 0,
            Bool(false) => 1,
            Bool(true) => 2,
            Number(_) => 3,
            String(_) => 4,
            Array(_) => 5,
            Object(_) => 6,
        }
    }

    match (a, b) {
        (Number(a), Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (String(a), String(b)) => a.cmp(b),
        (Array(a), Array(b)) => {
            for (a, b) in a.iter().zip(b.iter()) {
                match compare_json(a, b) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        (Object(a), Object(b)) => {
            for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                match ak.cmp(bk).then_with(|| compare_json(av, bv)) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        (a, b) => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_type_ranks_order_before_values() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-10),
            json!(3.5),
            json!("a"),
            json!("ab"),
            json!([1]),
            json!([1, 2]),
            json!({"k": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_json(&pair[0], &pair[1]),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn collated_keys_compare_bytewise() {
        assert_eq!(
            compare_keys(DataEncoding::Collated, b"\x05abc", b"\x05abd"),
            Ordering::Less
        );
        assert_eq!(
            compare_keys(DataEncoding::Collated, b"\x06", b"\x05zzzz"),
            Ordering::Greater
        );
    }

    #[test]
    fn json_keys_compare_by_parsed_value() {
        // "10" sorts after "9" numerically even though it is lexically smaller.
        assert_eq!(
            compare_keys(DataEncoding::Json, b"[10]", b"[9]"),
            Ordering::Greater
        );
    }
}
