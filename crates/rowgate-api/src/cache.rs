//! The content-addressed response cache.
//!
//! Keys are a 64-bit non-cryptographic hash over the URI and the ordered
//! coerced parameter values, each framed by a start byte (0x02) and an
//! end byte (0x03). Scalars hash in big-endian native width, strings as
//! UTF-8 bytes, string-array elements individually framed, and nulls
//! contribute no inner bytes. Values are stored as an 8-byte big-endian
//! nanosecond timestamp followed by the encoded body.

use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use twox_hash::XxHash64;

use rowgate_data::ArgValue;

const START_OF_VALUE: [u8; 1] = [2];
const END_OF_VALUE: [u8; 1] = [3];

/// Compute the cache key for a URI and its coerced parameter values.
#[must_use]
pub fn cache_key(uri: &str, args: &[ArgValue]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);

    hasher.write(&START_OF_VALUE);
    hasher.write(uri.as_bytes());
    hasher.write(&END_OF_VALUE);

    for arg in args {
        hasher.write(&START_OF_VALUE);
        match arg {
            // NULLs contribute no inner bytes, whatever their bind type.
            ArgValue::Null(_) => {}
            ArgValue::Bool(b) => hasher.write(&[u8::from(*b)]),
            ArgValue::Int(i) => hasher.write(&i.to_be_bytes()),
            ArgValue::Float(f) => hasher.write(&f.to_be_bytes()),
            ArgValue::Text(s) => hasher.write(s.as_bytes()),
            ArgValue::Json(v) => hasher.write(v.to_string().as_bytes()),
            ArgValue::BoolArray(a) => {
                for b in a {
                    hasher.write(&[u8::from(*b)]);
                }
            }
            ArgValue::IntArray(a) => {
                for i in a {
                    hasher.write(&i.to_be_bytes());
                }
            }
            ArgValue::FloatArray(a) => {
                for f in a {
                    hasher.write(&f.to_be_bytes());
                }
            }
            ArgValue::TextArray(a) => {
                for s in a {
                    hasher.write(&START_OF_VALUE);
                    hasher.write(s.as_bytes());
                    hasher.write(&END_OF_VALUE);
                }
            }
        }
        hasher.write(&END_OF_VALUE);
    }

    hasher.finish()
}

/// Wrap an encoded body into the stored cache layout.
#[must_use]
pub fn store_value(body: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + body.len());
    value.extend_from_slice(&now_nanos().to_be_bytes());
    value.extend_from_slice(body);
    value
}

/// Extract the body from a cached value if it is still within the TTL.
/// Returns `None` for malformed or stale entries.
#[must_use]
pub fn fresh_body(entry: &[u8], ttl_nanos: u64) -> Option<&[u8]> {
    if entry.len() < 8 {
        return None;
    }
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&entry[0..8]);
    let written = u64::from_be_bytes(stamp);
    let elapsed = now_nanos().saturating_sub(written);
    (elapsed <= ttl_nanos).then(|| &entry[8..])
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use rowgate_data::NullKind;

    #[test]
    fn keys_are_deterministic_for_equal_inputs() {
        let args = vec![
            ArgValue::Text("x".to_string()),
            ArgValue::Int(42),
            ArgValue::Null(NullKind::Text),
            ArgValue::TextArray(vec!["a".to_string(), "b".to_string()]),
        ];
        assert_eq!(cache_key("/movies", &args), cache_key("/movies", &args.clone()));
    }

    #[test]
    fn null_bind_type_does_not_affect_the_key() {
        assert_eq!(
            cache_key("/u", &[ArgValue::Null(NullKind::Text)]),
            cache_key("/u", &[ArgValue::Null(NullKind::Int)])
        );
    }

    #[test]
    fn keys_separate_adjacent_values() {
        // "ab" + "c" and "a" + "bc" must not collide thanks to framing.
        let left = vec![
            ArgValue::Text("ab".to_string()),
            ArgValue::Text("c".to_string()),
        ];
        let right = vec![
            ArgValue::Text("a".to_string()),
            ArgValue::Text("bc".to_string()),
        ];
        assert_ne!(cache_key("/u", &left), cache_key("/u", &right));
    }

    #[test]
    fn null_differs_from_empty_string() {
        assert_ne!(
            cache_key("/u", &[ArgValue::Null(NullKind::Text)]),
            cache_key("/u", &[ArgValue::Text(String::new())])
        );
    }

    #[test]
    fn uri_participates_in_the_key() {
        assert_ne!(cache_key("/a", &[]), cache_key("/b", &[]));
    }

    #[test]
    fn stored_values_round_trip_within_ttl() {
        let value = store_value(b"payload");
        assert_eq!(value.len(), 8 + 7);
        let body = fresh_body(&value, 60 * 1_000_000_000).expect("fresh");
        assert_eq!(body, b"payload");
    }

    #[test]
    fn stale_and_short_entries_are_rejected() {
        let mut value = store_value(b"payload");
        // Rewind the timestamp far into the past.
        value[0..8].copy_from_slice(&1u64.to_be_bytes());
        assert!(fresh_body(&value, 1_000_000_000).is_none());
        assert!(fresh_body(&[1, 2, 3], 1_000_000_000).is_none());
    }
}
