//! Tagged stream reader.
//!
//! [`Reader::unserialize`] consumes exactly one value. Ref-eligible values
//! are appended to the reference table in the order their tags appear, and
//! containers are appended before their children are decoded, so a child
//! `r<index>;` pointing at its parent resolves to the parent's handle.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::{Reader, Value};
//!
//! let mut reader = Reader::new(b"a2{s5\"hello\"r1;}", false, false, false);
//! let value = reader.unserialize().unwrap();
//! assert_eq!(value.index(1), Some(Value::from("hello")));
//! ```

use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::RwLock;

use super::raw;
use super::stream::{parse_ascii, ByteStream};
use super::tags::*;
use super::value::{DateTimeValue, Object, Value};
use super::writer::MAX_DEPTH;
use crate::error::{Error, Result};

/// A class declared earlier in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDescriptor {
    /// Class alias.
    pub name: String,
    /// Field names in declaration order.
    pub fields: Vec<String>,
}

/// Deserializes values from the tagged wire format.
pub struct Reader<'a> {
    stream: ByteStream<'a>,
    simple: bool,
    use_harmony_map: bool,
    binary: bool,
    refs: Vec<Value>,
    classref: Vec<ClassDescriptor>,
    depth: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader over `data`.
    ///
    /// `simple` rejects back-references; `use_harmony_map` keeps map keys as
    /// values instead of turning maps into string-keyed records; `binary`
    /// allows blob values.
    pub fn new(data: &'a [u8], simple: bool, use_harmony_map: bool, binary: bool) -> Self {
        Self {
            stream: ByteStream::new(data),
            simple,
            use_harmony_map,
            binary,
            refs: Vec::new(),
            classref: Vec::new(),
            depth: 0,
        }
    }

    /// Change how maps are decoded from here on.
    pub fn set_use_harmony_map(&mut self, on: bool) {
        self.use_harmony_map = on;
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.stream.position()
    }

    /// Whether the whole input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.stream.remaining() == 0
    }

    /// Classes declared so far.
    pub fn classes(&self) -> &[ClassDescriptor] {
        &self.classref
    }

    /// Clear the reference and class tables.
    pub fn reset(&mut self) {
        self.refs.clear();
        self.classref.clear();
    }

    /// Consume one tag byte, `None` at end of input.
    pub fn next_tag(&mut self) -> Option<u8> {
        self.stream.next()
    }

    /// Consume one tag byte.
    pub fn read_tag(&mut self) -> Result<u8> {
        self.stream
            .next()
            .ok_or_else(|| Error::unexpected_tag(None, None))
    }

    /// Consume one tag byte and check it is `expected`.
    pub fn check_tag(&mut self, expected: u8) -> Result<()> {
        let tag = self.stream.next();
        if tag != Some(expected) {
            return Err(Error::unexpected_tag(tag, Some(&[expected])));
        }
        Ok(())
    }

    /// Consume one tag byte and check it is one of `expected`.
    pub fn check_tags(&mut self, expected: &[u8]) -> Result<u8> {
        match self.stream.next() {
            Some(tag) if expected.contains(&tag) => Ok(tag),
            tag => Err(Error::unexpected_tag(tag, Some(expected))),
        }
    }

    /// Copy the next complete value verbatim without decoding it.
    pub fn read_raw(&mut self) -> Result<Bytes> {
        raw::read_raw(&mut self.stream)
    }

    /// Decode one value.
    pub fn unserialize(&mut self) -> Result<Value> {
        let tag = self.stream.next();
        self.read_value(tag)
    }

    /// Decode a string (`e`, `u`, `s`, `n` or a reference to a string).
    pub fn read_string(&mut self) -> Result<String> {
        let tag = self.stream.next();
        match tag {
            Some(TAG_NULL) | Some(TAG_EMPTY) => Ok(String::new()),
            Some(TAG_UTF8_CHAR) => Ok(self.stream.read_utf16_units(1)?.to_string()),
            Some(TAG_STRING) => self.read_string_without_tag(),
            Some(TAG_REF) => match self.read_ref()? {
                Value::String(s) => Ok(s),
                other => Err(Error::Protocol(format!(
                    "reference to {} where a string was expected",
                    other.kind()
                ))),
            },
            _ => Err(Error::unexpected_tag(tag, Some(b"neus"))),
        }
    }

    /// Decode a list (`a`, `n` or a reference to a list).
    pub fn read_list(&mut self) -> Result<Value> {
        let tag = self.stream.next();
        match tag {
            Some(TAG_NULL) => Ok(Value::Null),
            Some(TAG_LIST) => self.read_list_without_tag(),
            Some(TAG_REF) => match self.read_ref()? {
                v @ Value::List(_) => Ok(v),
                other => Err(Error::Protocol(format!(
                    "reference to {} where a list was expected",
                    other.kind()
                ))),
            },
            _ => Err(Error::unexpected_tag(tag, Some(b"na"))),
        }
    }

    fn read_value(&mut self, tag: Option<u8>) -> Result<Value> {
        let tag = match tag {
            Some(tag) => tag,
            None => return Err(Error::unexpected_tag(None, None)),
        };
        match tag {
            b'0'..=b'9' => Ok(Value::Integer((tag - b'0') as i64)),
            TAG_INTEGER => Ok(Value::Integer(self.stream.read_int(TAG_SEMICOLON)?)),
            TAG_LONG => self.read_long_without_tag(),
            TAG_DOUBLE => {
                let digits = self.stream.read_until(TAG_SEMICOLON)?;
                Ok(Value::Double(parse_ascii(digits)?))
            }
            TAG_NULL => Ok(Value::Null),
            TAG_EMPTY => Ok(Value::String(String::new())),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_NAN => Ok(Value::Double(f64::NAN)),
            TAG_INFINITY => {
                let sign = self.check_tags(&[TAG_POS, TAG_NEG])?;
                Ok(Value::Double(if sign == TAG_NEG {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                }))
            }
            TAG_DATE => self.read_date_without_tag(),
            TAG_TIME => self.read_time_without_tag(),
            TAG_BYTES => self.read_bytes_without_tag(),
            TAG_UTF8_CHAR => Ok(Value::String(
                self.stream.read_utf16_units(1)?.to_string(),
            )),
            TAG_STRING => self.read_string_without_tag().map(Value::String),
            TAG_GUID => self.read_guid_without_tag(),
            TAG_LIST => self.read_list_without_tag(),
            TAG_MAP => self.read_map_without_tag(),
            TAG_CLASS => {
                self.read_class()?;
                self.unserialize()
            }
            TAG_OBJECT => self.read_object_without_tag(),
            TAG_REF => self.read_ref(),
            other => Err(Error::unexpected_tag(Some(other), None)),
        }
    }

    fn register(&mut self, value: &Value) {
        if !self.simple {
            self.refs.push(value.clone());
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Protocol(format!(
                "value nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn read_ref(&mut self) -> Result<Value> {
        if self.simple {
            return Err(Error::unexpected_tag(Some(TAG_REF), None));
        }
        let index = self.stream.read_count(TAG_SEMICOLON)?;
        self.refs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("reference index {index} out of range")))
    }

    fn read_long_without_tag(&mut self) -> Result<Value> {
        let digits = self.stream.read_until(TAG_SEMICOLON)?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::Protocol("invalid long in stream".to_string()))?;
        match text.parse::<i64>() {
            Ok(n) if n.to_string() == text => Ok(Value::Integer(n)),
            _ if !text.is_empty()
                && text
                    .trim_start_matches(['-', '+'])
                    .bytes()
                    .all(|b| b.is_ascii_digit()) =>
            {
                Ok(Value::BigInt(text.to_string()))
            }
            _ if text.is_empty() => Ok(Value::Integer(0)),
            _ => Err(Error::Protocol(format!("invalid long \"{text}\" in stream"))),
        }
    }

    fn read_string_without_tag(&mut self) -> Result<String> {
        let s = self.read_string_body()?;
        if !self.simple {
            self.refs.push(Value::String(s.clone()));
        }
        Ok(s)
    }

    /// `<count>"<text>"` without registering the result.
    fn read_string_body(&mut self) -> Result<String> {
        let count = self.stream.read_count(TAG_QUOTE)?;
        let s = self.stream.read_utf16_units(count)?.to_string();
        self.stream.expect(TAG_QUOTE)?;
        Ok(s)
    }

    fn read_bytes_without_tag(&mut self) -> Result<Value> {
        if !self.binary {
            return Err(Error::Protocol(
                "The binary string does not support to unserialize in text mode.".to_string(),
            ));
        }
        let count = self.stream.read_count(TAG_QUOTE)?;
        let bytes = Bytes::copy_from_slice(self.stream.read_exact(count)?);
        self.stream.expect(TAG_QUOTE)?;
        let value = Value::Bytes(bytes);
        self.register(&value);
        Ok(value)
    }

    fn read_guid_without_tag(&mut self) -> Result<Value> {
        self.stream.expect(TAG_OPENBRACE)?;
        let text = self.stream.read_exact(36)?;
        self.stream.expect(TAG_CLOSEBRACE)?;
        let guid = std::str::from_utf8(text)
            .ok()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "invalid guid \"{}\" in stream",
                    String::from_utf8_lossy(text)
                ))
            })?;
        let value = Value::Guid(guid);
        self.register(&value);
        Ok(value)
    }

    fn read_digits(&mut self, n: usize) -> Result<u32> {
        parse_ascii(self.stream.read_exact(n)?)
    }

    /// `hhmmss[.fff[fff[fff]]]`, returning the time and the terminating tag.
    fn read_time_part(&mut self) -> Result<(NaiveTime, u8)> {
        let hour = self.read_digits(2)?;
        let minute = self.read_digits(2)?;
        let second = self.read_digits(2)?;
        let mut nanos = 0;
        let mut tag = self.stream.read_byte()?;
        if tag == TAG_POINT {
            nanos = self.read_digits(3)? * 1_000_000;
            tag = self.stream.read_byte()?;
            if tag.is_ascii_digit() {
                let rest = self.read_digits(2)?;
                nanos += ((tag - b'0') as u32 * 100 + rest) * 1_000;
                tag = self.stream.read_byte()?;
                if tag.is_ascii_digit() {
                    let rest = self.read_digits(2)?;
                    nanos += (tag - b'0') as u32 * 100 + rest;
                    tag = self.stream.read_byte()?;
                }
            }
        }
        let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).ok_or_else(|| {
            Error::Protocol(format!("invalid time {hour:02}:{minute:02}:{second:02}"))
        })?;
        Ok((time, tag))
    }

    fn finish_datetime(&mut self, value: NaiveDateTime, tag: u8) -> Result<Value> {
        let utc = match tag {
            TAG_UTC => true,
            TAG_SEMICOLON => false,
            other => return Err(Error::unexpected_tag(Some(other), Some(b";Z"))),
        };
        let value = Value::DateTime(DateTimeValue { value, utc });
        self.register(&value);
        Ok(value)
    }

    fn read_date_without_tag(&mut self) -> Result<Value> {
        let year = self.read_digits(4)? as i32;
        let month = self.read_digits(2)?;
        let day = self.read_digits(2)?;
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
            Error::Protocol(format!("invalid date {year:04}-{month:02}-{day:02}"))
        })?;
        let tag = self.stream.read_byte()?;
        if tag == TAG_TIME {
            let (time, tag) = self.read_time_part()?;
            self.finish_datetime(date.and_time(time), tag)
        } else {
            self.finish_datetime(date.and_time(NaiveTime::MIN), tag)
        }
    }

    fn read_time_without_tag(&mut self) -> Result<Value> {
        let (time, tag) = self.read_time_part()?;
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .ok_or_else(|| Error::Protocol("invalid epoch date".to_string()))?;
        self.finish_datetime(epoch.and_time(time), tag)
    }

    fn read_list_without_tag(&mut self) -> Result<Value> {
        let handle = Arc::new(RwLock::new(Vec::new()));
        let value = Value::List(handle.clone());
        self.register(&value);
        let count = self.stream.read_count(TAG_OPENBRACE)?;
        self.enter()?;
        for _ in 0..count {
            let item = self.unserialize()?;
            handle.write().push(item);
        }
        self.depth -= 1;
        self.stream.expect(TAG_CLOSEBRACE)?;
        Ok(value)
    }

    fn read_map_without_tag(&mut self) -> Result<Value> {
        let handle = Arc::new(RwLock::new(Vec::new()));
        let value = Value::Map(handle.clone());
        self.register(&value);
        let count = self.stream.read_count(TAG_OPENBRACE)?;
        self.enter()?;
        for _ in 0..count {
            let key = self.unserialize()?;
            let item = self.unserialize()?;
            if self.use_harmony_map {
                handle.write().push((key, item));
            } else {
                let key = Value::String(record_key(&key));
                let mut entries = handle.write();
                match entries.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = item,
                    None => entries.push((key, item)),
                }
            }
        }
        self.depth -= 1;
        self.stream.expect(TAG_CLOSEBRACE)?;
        Ok(value)
    }

    fn read_class(&mut self) -> Result<()> {
        let name = self.read_string_body()?;
        let count = self.stream.read_count(TAG_OPENBRACE)?;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(self.read_string()?);
        }
        self.stream.expect(TAG_CLOSEBRACE)?;
        tracing::trace!(class = %name, index = self.classref.len(), "class declared");
        self.classref.push(ClassDescriptor { name, fields });
        Ok(())
    }

    fn read_object_without_tag(&mut self) -> Result<Value> {
        let index = self.stream.read_count(TAG_OPENBRACE)?;
        let class = self
            .classref
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("Unknown class index {index}")))?;

        let handle = Arc::new(RwLock::new(Object {
            class: class.name,
            fields: Vec::with_capacity(class.fields.len()),
        }));
        let value = Value::Object(handle.clone());
        self.register(&value);
        self.enter()?;
        for name in class.fields {
            let item = self.unserialize()?;
            handle.write().fields.push((name, item));
        }
        self.depth -= 1;
        self.stream.expect(TAG_CLOSEBRACE)?;
        Ok(value)
    }
}

/// String form of a map key when maps decode as plain records.
fn record_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Integer(n) => n.to_string(),
        Value::BigInt(s) => s.clone(),
        Value::Double(d) => d.to_string(),
        Value::Guid(g) => g.to_string(),
        Value::DateTime(d) => d.value.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Writer;

    fn decode(data: &[u8]) -> Result<Value> {
        Reader::new(data, false, false, true).unserialize()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode(b"7").unwrap(), Value::Integer(7));
        assert_eq!(decode(b"i-12;").unwrap(), Value::Integer(-12));
        assert_eq!(decode(b"l2147483648;").unwrap(), Value::Integer(1 << 31));
        assert_eq!(
            decode(b"l123456789012345678901234567890;").unwrap(),
            Value::BigInt("123456789012345678901234567890".into())
        );
        assert_eq!(decode(b"d1.5;").unwrap(), Value::Double(1.5));
        assert_eq!(decode(b"N").unwrap(), Value::Double(f64::NAN));
        assert_eq!(decode(b"I-").unwrap(), Value::Double(f64::NEG_INFINITY));
        assert_eq!(decode(b"I+").unwrap(), Value::Double(f64::INFINITY));
        assert_eq!(decode(b"n").unwrap(), Value::Null);
        assert_eq!(decode(b"e").unwrap(), Value::from(""));
        assert_eq!(decode(b"t").unwrap(), Value::Bool(true));
        assert_eq!(decode("u中".as_bytes()).unwrap(), Value::from("中"));
    }

    #[test]
    fn test_string_with_surrogate_pair() {
        assert_eq!(
            decode("s3\"a😀\"".as_bytes()).unwrap(),
            Value::from("a😀")
        );
    }

    #[test]
    fn test_reference_resolves_to_same_instance() {
        let v = decode(b"a2{a1{1}r1;}").unwrap();
        let (a, b) = (v.index(0).unwrap(), v.index(1).unwrap());
        assert_eq!(a.container_id(), b.container_id());
    }

    #[test]
    fn test_self_reference() {
        let v = decode(b"a1{r0;}").unwrap();
        assert_eq!(v.index(0).unwrap().container_id(), v.container_id());
    }

    #[test]
    fn test_class_and_object() {
        let v = decode(b"a2{c4\"User\"2{s4\"name\"s3\"age\"}o0{s3\"Tom\"i30;}o0{r2;i31;}}").unwrap();
        let tom = v.index(0).unwrap();
        assert_eq!(tom.get("name"), Some(Value::from("Tom")));
        assert_eq!(tom.get("age"), Some(Value::from(30)));
        let second = v.index(1).unwrap();
        // r2 is the field name "age": field names occupy reference slots.
        assert_eq!(second.get("name"), Some(Value::from("age")));
    }

    #[test]
    fn test_unknown_class_index_is_protocol_error() {
        let err = decode(b"o0{}").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_redeclared_class_gets_new_slot() {
        let data = b"a2{c1\"P\"1{s1\"x\"}o0{1}c1\"P\"1{s1\"y\"}o1{2}}";
        let v = decode(data).unwrap();
        assert_eq!(v.index(0).unwrap().get("x"), Some(Value::from(1)));
        assert_eq!(v.index(1).unwrap().get("y"), Some(Value::from(2)));
    }

    #[test]
    fn test_map_as_record_and_harmony() {
        // Integer key 1 and string key "1" collide once stringified.
        let record = decode(b"m2{1u2u1u3}").unwrap();
        assert_eq!(record.len(), Some(1));
        assert_eq!(record.get("1"), Some(Value::from("3")));

        let harmony = Reader::new(b"m2{1u2u1u3}", false, true, false)
            .unserialize()
            .unwrap();
        assert_eq!(harmony.len(), Some(2));
    }

    #[test]
    fn test_dates() {
        let v = decode(b"D20240305T130405.120Z").unwrap();
        match v {
            Value::DateTime(d) => {
                assert!(d.utc);
                assert_eq!(d.value.to_string(), "2024-03-05 13:04:05.120");
            }
            other => panic!("unexpected {other:?}"),
        }

        let v = decode(b"T083000.123456789;").unwrap();
        match v {
            Value::DateTime(d) => {
                assert!(!d.utc);
                assert_eq!(d.value.to_string(), "1970-01-01 08:30:00.123456789");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_simple_mode_rejects_references() {
        let err = Reader::new(b"a2{s5\"hello\"r1;}", true, false, false)
            .unserialize()
            .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected serialize tag \"r\" in stream");
    }

    #[test]
    fn test_bytes_rejected_in_text_mode() {
        assert!(Reader::new(b"b2\"ab\"", false, false, false)
            .unserialize()
            .is_err());
        assert_eq!(
            decode(b"b2\"ab\"").unwrap(),
            Value::Bytes(Bytes::from_static(b"ab"))
        );
    }

    #[test]
    fn test_truncated_and_unexpected() {
        assert_eq!(
            decode(b"").unwrap_err().to_string(),
            "No byte found in stream"
        );
        assert!(decode(b"s5\"hel").is_err());
        assert_eq!(
            decode(b"x").unwrap_err().to_string(),
            "Unexpected serialize tag \"x\" in stream"
        );
    }

    #[test]
    fn test_infinity_requires_sign() {
        assert!(matches!(decode(b"Ix"), Err(Error::Protocol(_))));
        assert!(matches!(decode(b"I"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_round_trip_through_writer() {
        let shared = Value::from("shared string");
        let inner = Value::list(vec![shared.clone(), Value::from(1.25)]);
        let value = Value::list(vec![
            inner.clone(),
            inner,
            shared,
            Value::Guid(uuid::Uuid::new_v4()),
            Value::from(i64::MAX),
            Value::Bytes(Bytes::from_static(b"\x00\x01")),
        ]);
        let mut writer = Writer::new(false, true);
        writer.serialize(&value).unwrap();
        let bytes = writer.take();

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(
            decoded.index(0).unwrap().container_id(),
            decoded.index(1).unwrap().container_id()
        );
    }
}
