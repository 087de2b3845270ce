//! Dynamic value model.
//!
//! [`Value`] is what the writer encodes and what the reader reconstructs.
//! Lists, maps and objects are shared handles: cloning a `Value::List` clones
//! the handle, not the elements, so identity (and therefore reference sharing
//! and self-reference) survives a round trip.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::Value;
//!
//! let list = Value::list(vec![Value::from(1), Value::from("hello")]);
//! let twice = Value::list(vec![list.clone(), list.clone()]);
//! assert_eq!(twice.len(), Some(2));
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

/// Depth at which `Debug` output is cut short.
const DEBUG_DEPTH: usize = 8;

/// Shared, mutable list storage.
pub type ListHandle = Arc<RwLock<Vec<Value>>>;

/// Shared, mutable map storage. Entries keep insertion order.
pub type MapHandle = Arc<RwLock<Vec<(Value, Value)>>>;

/// Shared, mutable object storage.
pub type ObjectHandle = Arc<RwLock<Object>>;

/// A date/time as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTimeValue {
    /// Calendar date and wall-clock time, nanosecond precision.
    pub value: NaiveDateTime,
    /// Whether the value is in UTC (`Z` terminator) or local time (`;`).
    pub utc: bool,
}

impl DateTimeValue {
    /// A UTC date/time.
    pub fn utc(value: NaiveDateTime) -> Self {
        Self { value, utc: true }
    }

    /// A local date/time.
    pub fn local(value: NaiveDateTime) -> Self {
        Self { value, utc: false }
    }
}

/// An instance of a named class: ordered field names with their values.
///
/// Objects decoded from a class nobody registered keep their class name and
/// fields; they behave as an opaque structural record.
#[derive(Clone, PartialEq)]
pub struct Object {
    /// Class alias used on the wire.
    pub class: String,
    /// Fields in declaration order.
    pub fields: Vec<(String, Value)>,
}

impl Object {
    /// Create an empty object of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(k, _)| k.clone()).collect()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.class);
        for (k, v) in &self.fields {
            s.field(k, v);
        }
        s.finish()
    }
}

/// A value in the hprose data model.
#[derive(Clone)]
pub enum Value {
    /// `n`
    Null,
    /// `t` / `f`
    Bool(bool),
    /// Digits, `i` or `l` depending on range.
    Integer(i64),
    /// `l` with more digits than fit an `i64`, kept literally.
    BigInt(String),
    /// `d`, `N` or `I`.
    Double(f64),
    /// `e`, `u` or `s`.
    String(String),
    /// `b` (binary mode only).
    Bytes(Bytes),
    /// `D` / `T`.
    DateTime(DateTimeValue),
    /// `g`
    Guid(Uuid),
    /// `a`
    List(ListHandle),
    /// `m`
    Map(MapHandle),
    /// `c` + `o`
    Object(ObjectHandle),
}

impl Value {
    /// Create a list value.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(RwLock::new(items)))
    }

    /// Create a map value from ordered entries.
    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    /// Create an object value.
    pub fn object(object: Object) -> Self {
        Value::Object(Arc::new(RwLock::new(object)))
    }

    /// Create a UTC date/time value.
    pub fn utc_datetime(value: NaiveDateTime) -> Self {
        Value::DateTime(DateTimeValue::utc(value))
    }

    /// Create a local date/time value.
    pub fn local_datetime(value: NaiveDateTime) -> Self {
        Value::DateTime(DateTimeValue::local(value))
    }

    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean content.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric content as a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            Value::BigInt(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Binary content.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Snapshot of list elements.
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(l) => Some(l.read_recursive().clone()),
            _ => None,
        }
    }

    /// Number of elements in a list, entries in a map or fields in an object.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(l) => Some(l.read_recursive().len()),
            Value::Map(m) => Some(m.read_recursive().len()),
            Value::Object(o) => Some(o.read_recursive().fields.len()),
            _ => None,
        }
    }

    /// Look up a map entry by string key, or an object field by name.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(m) => m
                .read_recursive()
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone()),
            Value::Object(o) => o.read_recursive().get(key).cloned(),
            _ => None,
        }
    }

    /// List element by position.
    pub fn index(&self, i: usize) -> Option<Value> {
        match self {
            Value::List(l) => l.read_recursive().get(i).cloned(),
            _ => None,
        }
    }

    /// Identity of a shared container, used for reference tracking.
    pub(crate) fn container_id(&self) -> Option<usize> {
        match self {
            Value::List(l) => Some(Arc::as_ptr(l) as *const () as usize),
            Value::Map(m) => Some(Arc::as_ptr(m) as *const () as usize),
            Value::Object(o) => Some(Arc::as_ptr(o) as *const () as usize),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::BigInt(_) => "bigint",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
            Value::Guid(_) => "guid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    fn eq_inner(&self, other: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Guid(a), Value::Guid(b)) => a == b,
            (Value::List(_), Value::List(_))
            | (Value::Map(_), Value::Map(_))
            | (Value::Object(_), Value::Object(_)) => {
                let pair = match (self.container_id(), other.container_id()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return false,
                };
                if pair.0 == pair.1 || seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let equal = match (self, other) {
                    (Value::List(a), Value::List(b)) => {
                        let (a, b) = (a.read_recursive(), b.read_recursive());
                        a.len() == b.len()
                            && a.iter().zip(b.iter()).all(|(x, y)| x.eq_inner(y, seen))
                    }
                    (Value::Map(a), Value::Map(b)) => {
                        let (a, b) = (a.read_recursive(), b.read_recursive());
                        a.len() == b.len()
                            && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                                ka.eq_inner(kb, seen) && va.eq_inner(vb, seen)
                            })
                    }
                    (Value::Object(a), Value::Object(b)) => {
                        let (a, b) = (a.read_recursive(), b.read_recursive());
                        a.class == b.class
                            && a.fields.len() == b.fields.len()
                            && a.fields.iter().zip(b.fields.iter()).all(|((ka, va), (kb, vb))| {
                                ka == kb && va.eq_inner(vb, seen)
                            })
                    }
                    _ => false,
                };
                seen.pop();
                equal
            }
            _ => false,
        }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth >= DEBUG_DEPTH && self.container_id().is_some() {
            return f.write_str("...");
        }
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::BigInt(s) => write!(f, "{s}n"),
            Value::Double(d) => write!(f, "{d:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{b:?}"),
            Value::DateTime(d) => write!(f, "{}{}", d.value, if d.utc { "Z" } else { "" }),
            Value::Guid(g) => write!(f, "{g}"),
            Value::List(l) => {
                f.write_str("[")?;
                for (i, v) in l.read_recursive().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("]")
            }
            Value::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.read_recursive().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    k.fmt_depth(f, depth + 1)?;
                    f.write_str(": ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("}")
            }
            Value::Object(o) => {
                let o = o.read_recursive();
                write!(f, "{} {{", o.class)?;
                for (i, (k, v)) in o.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_inner(other, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Integer(n as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => Value::Integer(n),
            Err(_) => Value::BigInt(n.to_string()),
        }
    }
}

impl From<i128> for Value {
    fn from(n: i128) -> Self {
        match i64::try_from(n) {
            Ok(n) => Value::Integer(n),
            Err(_) => Value::BigInt(n.to_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<f32> for Value {
    fn from(d: f32) -> Self {
        Value::Double(d as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::String(c.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Uuid> for Value {
    fn from(g: Uuid) -> Self {
        Value::Guid(g)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::utc_datetime(d.naive_utc())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Self {
        Value::local_datetime(d)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::local_datetime(d.and_time(chrono::NaiveTime::MIN))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::object(o)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_clone_shares_identity() {
        let a = Value::list(vec![Value::from(1)]);
        let b = a.clone();
        assert_eq!(a.container_id(), b.container_id());

        if let Value::List(l) = &a {
            l.write().push(Value::from(2));
        }
        assert_eq!(b.len(), Some(2));
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(1.0), Value::Integer(1));
    }

    #[test]
    fn test_self_referential_eq_and_debug() {
        let a = Value::list(vec![]);
        if let Value::List(l) = &a {
            l.write().push(a.clone());
        }
        let b = Value::list(vec![]);
        if let Value::List(l) = &b {
            l.write().push(b.clone());
        }

        assert_eq!(a, b);
        let printed = format!("{a:?}");
        assert!(printed.contains("..."));
    }

    #[test]
    fn test_get_and_index() {
        let m = Value::map(vec![(Value::from("k"), Value::from(5))]);
        assert_eq!(m.get("k"), Some(Value::from(5)));
        assert_eq!(m.get("missing"), None);

        let o = Value::object(Object::new("User").with_field("name", "ann"));
        assert_eq!(o.get("name"), Some(Value::from("ann")));

        let l = Value::list(vec![Value::Null, Value::from(true)]);
        assert_eq!(l.index(1), Some(Value::Bool(true)));
    }

    #[test]
    fn test_big_unsigned_becomes_bigint() {
        assert_eq!(Value::from(u64::MAX), Value::BigInt("18446744073709551615".into()));
        assert_eq!(Value::from(7u64), Value::Integer(7));
    }
}
