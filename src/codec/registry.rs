//! Process-wide class registry.
//!
//! Maps Rust types to the class alias used on the wire and back. The
//! registry lives for the whole process; registration is expected to happen
//! during start-up, lookups may happen from any thread.
//!
//! A type that was never registered encodes under the generic `"Object"`
//! alias, which the writer turns into a plain map instead of a class/object
//! pair.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::{registry, HproseClass, Value};
//!
//! struct User {
//!     name: String,
//!     age: i64,
//! }
//!
//! impl HproseClass for User {
//!     fn field_names() -> &'static [&'static str] {
//!         &["name", "age"]
//!     }
//!
//!     fn field_values(&self) -> Vec<Value> {
//!         vec![Value::from(self.name.as_str()), Value::from(self.age)]
//!     }
//!
//!     fn from_value(value: &Value) -> hprose_client::Result<Self> {
//!         Ok(User {
//!             name: value.get("name").and_then(|v| v.as_str().map(String::from)).unwrap_or_default(),
//!             age: value.get("age").and_then(|v| v.as_i64()).unwrap_or_default(),
//!         })
//!     }
//! }
//!
//! registry::register::<User>("User");
//! assert_eq!(registry::alias_of::<User>(), "User");
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use super::value::{Object, Value};
use crate::error::Result;

/// Alias used for types that were never registered.
pub const GENERIC_ALIAS: &str = "Object";

/// A Rust type that can travel as a class instance.
pub trait HproseClass: Any + Sized {
    /// Field names in wire order.
    fn field_names() -> &'static [&'static str];

    /// Field values in the order of [`field_names`](Self::field_names).
    fn field_values(&self) -> Vec<Value>;

    /// Rebuild from a decoded object or map.
    fn from_value(value: &Value) -> Result<Self>;
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<TypeId, String>,
    by_alias: HashMap<String, (TypeId, &'static str)>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Register `T` under `alias`.
///
/// Registering the same pair again is a no-op. Re-registering a type under
/// a new alias, or an alias for a new type, replaces the old mapping.
pub fn register<T: Any>(alias: &str) {
    let id = TypeId::of::<T>();
    let mut reg = registry().write();

    if reg.by_type.get(&id).map(String::as_str) == Some(alias) {
        return;
    }
    if let Some(old) = reg.by_type.insert(id, alias.to_string()) {
        reg.by_alias.remove(&old);
    }
    if let Some((old_id, _)) = reg.by_alias.insert(alias.to_string(), (id, type_name::<T>())) {
        if old_id != id {
            reg.by_type.remove(&old_id);
        }
    }
    tracing::debug!(alias, rust_type = type_name::<T>(), "class registered");
}

/// Wire alias of `T`, or `"Object"` when unregistered.
pub fn alias_of<T: Any>() -> String {
    registry()
        .read()
        .by_type
        .get(&TypeId::of::<T>())
        .cloned()
        .unwrap_or_else(|| GENERIC_ALIAS.to_string())
}

/// Rust type name registered under `alias`.
pub fn type_name_of(alias: &str) -> Option<&'static str> {
    registry().read().by_alias.get(alias).map(|(_, name)| *name)
}

/// Whether `alias` is registered to some type.
pub fn is_registered(alias: &str) -> bool {
    registry().read().by_alias.contains_key(alias)
}

/// Whether `alias` is registered to `T`.
pub fn is_registered_as<T: Any>(alias: &str) -> bool {
    registry()
        .read()
        .by_alias
        .get(alias)
        .is_some_and(|(id, _)| *id == TypeId::of::<T>())
}

/// Convert a class instance into a value.
///
/// Registered types become objects carrying their alias; unregistered ones
/// become plain maps keyed by field name.
pub fn to_value<T: HproseClass>(instance: &T) -> Value {
    let alias = alias_of::<T>();
    let pairs = T::field_names().iter().zip(instance.field_values());

    if alias == GENERIC_ALIAS {
        Value::map(
            pairs
                .map(|(name, value)| (Value::from(*name), value))
                .collect(),
        )
    } else {
        Value::object(Object {
            class: alias,
            fields: pairs.map(|(name, value)| (name.to_string(), value)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Point {
        x: i64,
        y: i64,
    }

    impl HproseClass for Point {
        fn field_names() -> &'static [&'static str] {
            &["x", "y"]
        }

        fn field_values(&self) -> Vec<Value> {
            vec![Value::from(self.x), Value::from(self.y)]
        }

        fn from_value(value: &Value) -> Result<Self> {
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Error::Protocol(format!("missing field {name}")))
            };
            Ok(Point {
                x: field("x")?,
                y: field("y")?,
            })
        }
    }

    struct Unregistered;

    #[test]
    fn test_register_is_idempotent() {
        register::<Point>("RegistryTestPoint");
        register::<Point>("RegistryTestPoint");

        assert_eq!(alias_of::<Point>(), "RegistryTestPoint");
        assert!(is_registered("RegistryTestPoint"));
        assert!(is_registered_as::<Point>("RegistryTestPoint"));
        assert!(type_name_of("RegistryTestPoint").is_some_and(|n| n.ends_with("Point")));
    }

    #[test]
    fn test_unregistered_defaults_to_object() {
        assert_eq!(alias_of::<Unregistered>(), GENERIC_ALIAS);
        assert!(!is_registered("NoSuchAlias"));
    }

    #[test]
    fn test_to_value_and_back() {
        register::<Point>("RegistryTestPoint");
        let v = to_value(&Point { x: 1, y: 2 });
        assert!(matches!(v, Value::Object(_)));

        let p = Point::from_value(&v).unwrap();
        assert_eq!((p.x, p.y), (1, 2));
    }
}
