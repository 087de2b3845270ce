//! Tagged stream writer.
//!
//! [`Writer::serialize`] appends one complete encoding per call, so several
//! values (or several call envelopes) can be concatenated into one buffer.
//! Strings, blobs, date/times, GUIDs and containers are tracked in a
//! reference table: the second time one is seen, only `r<index>;` is
//! written. Containers are registered before their children, which is what
//! lets a list contain itself.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::{Value, Writer};
//!
//! let mut writer = Writer::new(false, false);
//! writer.serialize(&Value::from(12)).unwrap();
//! writer.serialize(&Value::from("hello")).unwrap();
//! assert_eq!(&writer.take()[..], b"i12;s5\"hello\"");
//! ```

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, Timelike};

use super::registry::GENERIC_ALIAS;
use super::tags::*;
use super::value::{DateTimeValue, Value};
use crate::error::{Error, Result};

/// Nesting depth past which serialization fails instead of recursing.
pub const MAX_DEPTH: usize = 512;

/// Identity of a ref-eligible value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RefKey {
    Str(String),
    Bytes(usize, usize),
    DateTime(DateTimeValue),
    Guid(uuid::Uuid),
    Container(usize),
}

/// Write-side reference table.
#[derive(Default)]
struct WriterRefer {
    refs: HashMap<RefKey, usize>,
    count: usize,
    /// Keeps tracked values alive so their addresses cannot be reused.
    pinned: Vec<Value>,
}

impl WriterRefer {
    fn get(&self, key: &RefKey) -> Option<usize> {
        self.refs.get(key).copied()
    }

    fn set(&mut self, key: RefKey) {
        self.refs.insert(key, self.count);
        self.count += 1;
    }

    /// Consume a slot for a value that can never be referenced again.
    fn skip(&mut self) {
        self.count += 1;
    }

    fn reset(&mut self) {
        self.refs.clear();
        self.pinned.clear();
        self.count = 0;
    }
}

/// Serializes values into the tagged wire format.
pub struct Writer {
    buf: BytesMut,
    binary: bool,
    refer: Option<WriterRefer>,
    classref: HashMap<String, usize>,
    fieldsref: Vec<Vec<String>>,
    depth: usize,
}

impl Writer {
    /// Create a writer.
    ///
    /// `simple` disables reference tracking; `binary` allows blob values.
    pub fn new(simple: bool, binary: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            binary,
            refer: if simple { None } else { Some(WriterRefer::default()) },
            classref: HashMap::new(),
            fieldsref: Vec::new(),
            depth: 0,
        }
    }

    /// Whether blob values may be written.
    pub fn binary(&self) -> bool {
        self.binary
    }

    /// Whether reference tracking is off.
    pub fn simple(&self) -> bool {
        self.refer.is_none()
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the written bytes, leaving the buffer empty.
    ///
    /// Reference and class tables are kept; call [`reset`](Self::reset) to
    /// clear them.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Clear the reference and class tables.
    pub fn reset(&mut self) {
        if let Some(refer) = &mut self.refer {
            refer.reset();
        }
        self.classref.clear();
        self.fieldsref.clear();
    }

    /// Append a bare tag byte.
    pub fn write_tag(&mut self, tag: u8) {
        self.buf.put_u8(tag);
    }

    /// Append one tagged value.
    pub fn serialize(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.buf.put_u8(TAG_NULL),
            Value::Bool(b) => self.buf.put_u8(if *b { TAG_TRUE } else { TAG_FALSE }),
            Value::Integer(n) => self.write_integer(*n),
            Value::BigInt(digits) => self.write_long_digits(digits),
            Value::Double(d) => self.write_double(*d),
            Value::String(s) => {
                let mut units = s.encode_utf16();
                match (units.next(), units.next()) {
                    (None, _) => self.buf.put_u8(TAG_EMPTY),
                    (Some(_), None) => {
                        self.buf.put_u8(TAG_UTF8_CHAR);
                        self.buf.extend_from_slice(s.as_bytes());
                    }
                    _ => self.write_string_with_ref(s),
                }
            }
            Value::Bytes(b) => {
                if !self.binary {
                    return Err(Error::Serialize(
                        "The binary string does not support serialization in text mode."
                            .to_string(),
                    ));
                }
                let key = RefKey::Bytes(b.as_ptr() as usize, b.len());
                if !self.write_ref(&key) {
                    self.set_ref(key, Some(value));
                    self.write_bytes(b);
                }
            }
            Value::DateTime(dt) => {
                let key = RefKey::DateTime(*dt);
                if !self.write_ref(&key) {
                    self.set_ref(key, None);
                    self.write_datetime(dt)?;
                }
            }
            Value::Guid(g) => {
                let key = RefKey::Guid(*g);
                if !self.write_ref(&key) {
                    self.set_ref(key, None);
                    self.buf.put_u8(TAG_GUID);
                    self.buf.put_u8(TAG_OPENBRACE);
                    self.buf
                        .extend_from_slice(g.hyphenated().to_string().as_bytes());
                    self.buf.put_u8(TAG_CLOSEBRACE);
                }
            }
            Value::List(_) | Value::Map(_) | Value::Object(_) => {
                let Some(id) = value.container_id() else {
                    return Ok(());
                };
                let key = RefKey::Container(id);
                if self.write_ref(&key) {
                    return Ok(());
                }
                self.enter()?;
                let result = self.write_container(value, key);
                self.depth -= 1;
                result?;
            }
        }
        Ok(())
    }

    /// Write a list without reference lookup.
    ///
    /// The list occupies a reference slot but, having no identity, can never
    /// be referenced. Used for call and reply argument lists.
    pub fn write_list(&mut self, items: &[Value]) -> Result<()> {
        if let Some(refer) = &mut self.refer {
            refer.skip();
        }
        self.write_list_body(items)
    }

    /// Write a string with the full `s` encoding and register it, without
    /// checking for an earlier occurrence.
    pub fn write_string(&mut self, s: &str) {
        if let Some(refer) = &mut self.refer {
            refer.set(RefKey::Str(s.to_string()));
        }
        self.buf.put_u8(TAG_STRING);
        let n = s.encode_utf16().count();
        if n > 0 {
            self.put_number(n);
        }
        self.buf.put_u8(TAG_QUOTE);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.put_u8(TAG_QUOTE);
    }

    /// Write a string as a reference when it was written before.
    pub fn write_string_with_ref(&mut self, s: &str) {
        if !self.write_ref(&RefKey::Str(s.to_string())) {
            self.write_string(s);
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Serialize(format!(
                "value nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn write_ref(&mut self, key: &RefKey) -> bool {
        let index = match self.refer.as_ref().and_then(|r| r.get(key)) {
            Some(index) => index,
            None => return false,
        };
        self.buf.put_u8(TAG_REF);
        self.put_number(index);
        self.buf.put_u8(TAG_SEMICOLON);
        true
    }

    fn set_ref(&mut self, key: RefKey, pin: Option<&Value>) {
        if let Some(refer) = &mut self.refer {
            refer.set(key);
            if let Some(value) = pin {
                refer.pinned.push(value.clone());
            }
        }
    }

    fn put_number(&mut self, n: impl ToString) {
        self.buf.extend_from_slice(n.to_string().as_bytes());
    }

    fn write_integer(&mut self, n: i64) {
        if (0..=9).contains(&n) {
            self.buf.put_u8(b'0' + n as u8);
        } else if i32::try_from(n).is_ok() {
            self.buf.put_u8(TAG_INTEGER);
            self.put_number(n);
            self.buf.put_u8(TAG_SEMICOLON);
        } else {
            self.buf.put_u8(TAG_LONG);
            self.put_number(n);
            self.buf.put_u8(TAG_SEMICOLON);
        }
    }

    fn write_long_digits(&mut self, digits: &str) {
        self.buf.put_u8(TAG_LONG);
        self.buf.extend_from_slice(digits.as_bytes());
        self.buf.put_u8(TAG_SEMICOLON);
    }

    fn write_double(&mut self, d: f64) {
        if d.is_nan() {
            self.buf.put_u8(TAG_NAN);
        } else if d.is_infinite() {
            self.buf.put_u8(TAG_INFINITY);
            self.buf
                .put_u8(if d > 0.0 { TAG_POS } else { TAG_NEG });
        } else {
            self.buf.put_u8(TAG_DOUBLE);
            self.buf.extend_from_slice(format_double(d).as_bytes());
            self.buf.put_u8(TAG_SEMICOLON);
        }
    }

    fn write_bytes(&mut self, b: &[u8]) {
        self.buf.put_u8(TAG_BYTES);
        if !b.is_empty() {
            self.put_number(b.len());
        }
        self.buf.put_u8(TAG_QUOTE);
        self.buf.extend_from_slice(b);
        self.buf.put_u8(TAG_QUOTE);
    }

    fn write_datetime(&mut self, dt: &DateTimeValue) -> Result<()> {
        let v = dt.value;
        if !(0..=9999).contains(&v.year()) {
            return Err(Error::Serialize(format!(
                "year {} cannot be represented on the wire",
                v.year()
            )));
        }
        let nanos = v.nanosecond().min(999_999_999);
        let midnight = v.hour() == 0 && v.minute() == 0 && v.second() == 0 && nanos == 0;
        let epoch_day = v.year() == 1970 && v.month() == 1 && v.day() == 1;

        if midnight {
            self.put_date(v.year(), v.month(), v.day());
        } else if epoch_day {
            self.put_time(v.hour(), v.minute(), v.second(), nanos);
        } else {
            self.put_date(v.year(), v.month(), v.day());
            self.put_time(v.hour(), v.minute(), v.second(), nanos);
        }
        self.buf
            .put_u8(if dt.utc { TAG_UTC } else { TAG_SEMICOLON });
        Ok(())
    }

    fn put_date(&mut self, year: i32, month: u32, day: u32) {
        self.buf.put_u8(TAG_DATE);
        self.buf
            .extend_from_slice(format!("{year:04}{month:02}{day:02}").as_bytes());
    }

    fn put_time(&mut self, hour: u32, minute: u32, second: u32, nanos: u32) {
        self.buf.put_u8(TAG_TIME);
        self.buf
            .extend_from_slice(format!("{hour:02}{minute:02}{second:02}").as_bytes());
        if nanos == 0 {
            return;
        }
        self.buf.put_u8(TAG_POINT);
        let digits = if nanos % 1_000_000 == 0 {
            format!("{:03}", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{:06}", nanos / 1_000)
        } else {
            format!("{nanos:09}")
        };
        self.buf.extend_from_slice(digits.as_bytes());
    }

    fn write_container(&mut self, value: &Value, key: RefKey) -> Result<()> {
        match value {
            Value::List(list) => {
                self.set_ref(key, Some(value));
                let items = list.read_recursive();
                self.write_list_body(&items)
            }
            Value::Map(map) => {
                self.set_ref(key, Some(value));
                let entries = map.read_recursive();
                self.buf.put_u8(TAG_MAP);
                if !entries.is_empty() {
                    self.put_number(entries.len());
                }
                self.buf.put_u8(TAG_OPENBRACE);
                for (k, v) in entries.iter() {
                    self.serialize(k)?;
                    self.serialize(v)?;
                }
                self.buf.put_u8(TAG_CLOSEBRACE);
                Ok(())
            }
            Value::Object(object) => {
                let object = object.read_recursive();
                if object.class == GENERIC_ALIAS {
                    self.set_ref(key, Some(value));
                    self.buf.put_u8(TAG_MAP);
                    if !object.fields.is_empty() {
                        self.put_number(object.fields.len());
                    }
                    self.buf.put_u8(TAG_OPENBRACE);
                    for (name, v) in &object.fields {
                        self.serialize(&Value::from(name.as_str()))?;
                        self.serialize(v)?;
                    }
                    self.buf.put_u8(TAG_CLOSEBRACE);
                    return Ok(());
                }

                let index = match self.classref.get(&object.class) {
                    Some(&index) => index,
                    None => self.write_class(&object.class, object.field_names()),
                };
                self.buf.put_u8(TAG_OBJECT);
                self.put_number(index);
                self.buf.put_u8(TAG_OPENBRACE);
                self.set_ref(key, Some(value));
                let fields = self.fieldsref[index].clone();
                for name in &fields {
                    match object.get(name) {
                        Some(v) => self.serialize(v)?,
                        None => self.buf.put_u8(TAG_NULL),
                    }
                }
                self.buf.put_u8(TAG_CLOSEBRACE);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn write_list_body(&mut self, items: &[Value]) -> Result<()> {
        self.buf.put_u8(TAG_LIST);
        if !items.is_empty() {
            self.put_number(items.len());
        }
        self.buf.put_u8(TAG_OPENBRACE);
        for item in items {
            self.serialize(item)?;
        }
        self.buf.put_u8(TAG_CLOSEBRACE);
        Ok(())
    }

    fn write_class(&mut self, class: &str, fields: Vec<String>) -> usize {
        self.buf.put_u8(TAG_CLASS);
        self.put_number(class.encode_utf16().count());
        self.buf.put_u8(TAG_QUOTE);
        self.buf.extend_from_slice(class.as_bytes());
        self.buf.put_u8(TAG_QUOTE);
        if !fields.is_empty() {
            self.put_number(fields.len());
        }
        self.buf.put_u8(TAG_OPENBRACE);
        for field in &fields {
            self.write_string(field);
        }
        self.buf.put_u8(TAG_CLOSEBRACE);

        let index = self.fieldsref.len();
        self.classref.insert(class.to_string(), index);
        self.fieldsref.push(fields);
        index
    }
}

/// Shortest decimal form, switching to exponent notation for very large or
/// very small magnitudes.
fn format_double(d: f64) -> String {
    let abs = d.abs();
    if abs != 0.0 && !(1e-6..1e21).contains(&abs) {
        format!("{d:e}")
    } else {
        format!("{d}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::Object;
    use chrono::NaiveDate;

    fn encode(value: &Value) -> String {
        let mut writer = Writer::new(false, true);
        writer.serialize(value).unwrap();
        String::from_utf8(writer.take().to_vec()).unwrap()
    }

    #[test]
    fn test_integers() {
        for n in 0..=9 {
            assert_eq!(encode(&Value::from(n)), n.to_string());
        }
        assert_eq!(encode(&Value::from(10)), "i10;");
        assert_eq!(encode(&Value::from(-1)), "i-1;");
        assert_eq!(encode(&Value::from(i32::MAX)), "i2147483647;");
        assert_eq!(encode(&Value::from(1i64 << 31)), "l2147483648;");
        assert_eq!(encode(&Value::from(i32::MIN as i64 - 1)), "l-2147483649;");
        assert_eq!(
            encode(&Value::BigInt("123456789012345678901234567890".into())),
            "l123456789012345678901234567890;"
        );
    }

    #[test]
    fn test_doubles() {
        assert_eq!(encode(&Value::from(1.5)), "d1.5;");
        assert_eq!(encode(&Value::from(f64::NAN)), "N");
        assert_eq!(encode(&Value::from(f64::INFINITY)), "I+");
        assert_eq!(encode(&Value::from(f64::NEG_INFINITY)), "I-");
        assert_eq!(encode(&Value::from(1e300)), "d1e300;");
    }

    #[test]
    fn test_simple_scalars() {
        assert_eq!(encode(&Value::Null), "n");
        assert_eq!(encode(&Value::from(true)), "t");
        assert_eq!(encode(&Value::from(false)), "f");
        assert_eq!(encode(&Value::from("")), "e");
        assert_eq!(encode(&Value::from("x")), "ux");
        assert_eq!(encode(&Value::from("é")), "ué");
    }

    #[test]
    fn test_string_length_counts_utf16_units() {
        assert_eq!(encode(&Value::from("héllo")), "s5\"héllo\"");
        // U+1F600 is two UTF-16 units.
        assert_eq!(encode(&Value::from("😀")), "s2\"😀\"");
    }

    #[test]
    fn test_repeated_string_is_a_reference() {
        let s = Value::from("hello");
        let list = Value::list(vec![s.clone(), s]);
        assert_eq!(encode(&list), "a2{s5\"hello\"r1;}");
    }

    #[test]
    fn test_single_char_is_not_tracked() {
        let list = Value::list(vec![Value::from("a"), Value::from("a"), Value::from("bc")]);
        assert_eq!(encode(&list), "a3{uaua s2\"bc\"}".replace(' ', ""));
    }

    #[test]
    fn test_shared_list_is_a_reference() {
        let inner = Value::list(vec![Value::from(1)]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert_eq!(encode(&outer), "a2{a1{1}r1;}");
    }

    #[test]
    fn test_self_referential_list() {
        let list = Value::list(vec![]);
        if let Value::List(l) = &list {
            l.write().push(list.clone());
        }
        assert_eq!(encode(&list), "a1{r0;}");
    }

    #[test]
    fn test_simple_mode_writes_no_references() {
        let inner = Value::from("hello");
        let outer = Value::list(vec![inner.clone(), inner]);
        let mut writer = Writer::new(true, false);
        writer.serialize(&outer).unwrap();
        assert_eq!(&writer.take()[..], b"a2{s5\"hello\"s5\"hello\"}");
    }

    #[test]
    fn test_simple_mode_cycle_is_an_error() {
        let list = Value::list(vec![]);
        if let Value::List(l) = &list {
            l.write().push(list.clone());
        }
        let mut writer = Writer::new(true, false);
        assert!(matches!(writer.serialize(&list), Err(Error::Serialize(_))));
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(encode(&Value::list(vec![])), "a{}");
        assert_eq!(encode(&Value::map(vec![])), "m{}");
        assert_eq!(encode(&Value::Bytes(Bytes::new())), "b\"\"");
    }

    #[test]
    fn test_map() {
        let map = Value::map(vec![
            (Value::from("name"), Value::from("Tom")),
            (Value::from(1), Value::from(true)),
        ]);
        assert_eq!(encode(&map), "m2{s4\"name\"s3\"Tom\"1t}");
    }

    #[test]
    fn test_bytes_require_binary_mode() {
        let mut writer = Writer::new(false, false);
        let err = writer
            .serialize(&Value::Bytes(Bytes::from_static(b"ab")))
            .unwrap_err();
        assert!(err.to_string().contains("text mode"));

        assert_eq!(encode(&Value::Bytes(Bytes::from_static(b"ab"))), "b2\"ab\"");
    }

    #[test]
    fn test_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(encode(&Value::from(date)), "D20240305;");

        let dt = date.and_hms_milli_opt(13, 4, 5, 120).unwrap();
        assert_eq!(encode(&Value::utc_datetime(dt)), "D20240305T130405.120Z");

        let time = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(encode(&Value::local_datetime(time)), "T083000;");

        let micros = date.and_hms_micro_opt(1, 2, 3, 4).unwrap();
        assert_eq!(encode(&Value::local_datetime(micros)), "D20240305T010203.000004;");
    }

    #[test]
    fn test_guid() {
        let g = uuid::Uuid::nil();
        assert_eq!(
            encode(&Value::from(g)),
            "g{00000000-0000-0000-0000-000000000000}"
        );
    }

    #[test]
    fn test_object_declares_class_once() {
        let a = Value::object(Object::new("User").with_field("name", "Tom").with_field("age", 30));
        let b = Value::object(Object::new("User").with_field("name", "Bob").with_field("age", 31));
        let list = Value::list(vec![a, b]);
        assert_eq!(
            encode(&list),
            "a2{c4\"User\"2{s4\"name\"s3\"age\"}o0{s3\"Tom\"i30;}o0{s3\"Bob\"i31;}}"
        );
    }

    #[test]
    fn test_generic_object_encodes_as_map() {
        let o = Value::object(Object::new(GENERIC_ALIAS).with_field("id", 1));
        assert_eq!(encode(&o), "m1{s2\"id\"1}");
    }

    #[test]
    fn test_reset_clears_tables() {
        let mut writer = Writer::new(false, false);
        let s = Value::from("hello");
        writer.serialize(&s).unwrap();
        writer.reset();
        writer.serialize(&s).unwrap();
        assert_eq!(&writer.take()[..], b"s5\"hello\"s5\"hello\"");
    }

    #[test]
    fn test_write_list_consumes_a_slot() {
        let mut writer = Writer::new(false, false);
        let s = Value::from("hello");
        writer.write_list(&[s.clone(), s]).unwrap();
        assert_eq!(&writer.take()[..], b"a2{s5\"hello\"r1;}");
    }
}
