//! One-shot encode/decode.
//!
//! Each call builds a fresh [`Writer`] or [`Reader`], so reference and class
//! tables never leak between independent values.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::{Formatter, Value};
//!
//! let value = Value::list(vec![Value::from(1), Value::from("two")]);
//! let encoded = Formatter::serialize(&value, false, false).unwrap();
//! let decoded = Formatter::unserialize(&encoded, false, false, false).unwrap();
//! assert_eq!(decoded, value);
//! ```

use bytes::Bytes;

use super::reader::Reader;
use super::value::Value;
use super::writer::Writer;
use crate::error::Result;

/// Stateless formatter.
pub struct Formatter;

impl Formatter {
    /// Encode one value.
    ///
    /// # Errors
    ///
    /// Fails on blobs outside binary mode and on cycles in simple mode.
    #[inline]
    pub fn serialize(value: &Value, simple: bool, binary: bool) -> Result<Bytes> {
        let mut writer = Writer::new(simple, binary);
        writer.serialize(value)?;
        Ok(writer.take())
    }

    /// Decode one value from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on malformed input.
    #[inline]
    pub fn unserialize(
        data: &[u8],
        simple: bool,
        use_harmony_map: bool,
        binary: bool,
    ) -> Result<Value> {
        Reader::new(data, simple, use_harmony_map, binary).unserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::Object;
    use chrono::NaiveDate;

    fn round_trip(value: &Value) -> Value {
        let encoded = Formatter::serialize(value, false, true).unwrap();
        Formatter::unserialize(&encoded, false, true, true).unwrap()
    }

    #[test]
    fn test_round_trip_shapes() {
        let dt = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_nano_opt(23, 59, 58, 1)
            .unwrap();
        let values = vec![
            Value::Null,
            Value::from(true),
            Value::from(0),
            Value::from(9),
            Value::from(-2147483648i64),
            Value::from(1i64 << 40),
            Value::BigInt("-99999999999999999999999".into()),
            Value::from(3.25),
            Value::from(-0.5e-10),
            Value::from(f64::NAN),
            Value::from(f64::INFINITY),
            Value::from(f64::NEG_INFINITY),
            Value::from(""),
            Value::from("x"),
            Value::from("hello world"),
            Value::Bytes(Bytes::from_static(b"\xff\x00\"")),
            Value::utc_datetime(dt),
            Value::local_datetime(dt),
            Value::Guid(uuid::Uuid::new_v4()),
            Value::list(vec![Value::from(1), Value::list(vec![])]),
            Value::map(vec![
                (Value::from(1), Value::from("one")),
                (Value::from("k"), Value::Null),
            ]),
            Value::object(Object::new("Point").with_field("x", 1).with_field("y", 2)),
        ];
        for value in &values {
            assert_eq!(&round_trip(value), value, "round trip of {value:?}");
        }
    }

    #[test]
    fn test_shared_instance_decodes_to_one_identity() {
        let shared = Value::list(vec![Value::from("a string")]);
        let outer = Value::list(vec![shared.clone(), shared]);
        let encoded = Formatter::serialize(&outer, false, false).unwrap();
        assert_eq!(&encoded[..], b"a2{a1{s8\"a string\"}r1;}");

        let decoded = Formatter::unserialize(&encoded, false, false, false).unwrap();
        assert_eq!(
            decoded.index(0).unwrap().container_id(),
            decoded.index(1).unwrap().container_id()
        );
    }

    #[test]
    fn test_cycle_round_trip() {
        let list = Value::list(vec![Value::from(1)]);
        if let Value::List(l) = &list {
            l.write().push(list.clone());
        }
        let decoded = round_trip(&list);
        let inner = decoded.index(1).unwrap();
        assert_eq!(inner.container_id(), decoded.container_id());
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_unregistered_class_becomes_structural_record() {
        let encoded = b"c7\"Unknown\"2{s1\"a\"s1\"b\"}o0{1u2}";
        let decoded = Formatter::unserialize(encoded, false, false, false).unwrap();
        match &decoded {
            Value::Object(o) => {
                let o = o.read();
                assert_eq!(o.class, "Unknown");
                assert_eq!(o.field_names(), vec!["a", "b"]);
            }
            other => panic!("expected object, got {other:?}"),
        }
        assert_eq!(decoded.get("b"), Some(Value::from("2")));
    }
}
