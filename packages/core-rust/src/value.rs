//! Dynamically typed values carried in message bodies, headers, and properties.
//!
//! A [`Value`] is an immutable, reference-counted box around any `Send + Sync`
//! type. Cloning a value is cheap and shares the payload, which is what gives
//! `Exchange::copy` its "body by reference" semantics.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;

// ---------------------------------------------------------------------------
// TypeKey
// ---------------------------------------------------------------------------

/// Identity of a runtime type, used as a vertex in the converter graph.
///
/// Equality and hashing use only the `TypeId`; the name is kept for logs and
/// error messages.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Returns the key for type `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Shared, immutable, dynamically typed value.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    type_key: TypeKey,
}

impl Value {
    /// Wraps `value`. String slices should go through `Value::from(&str)`,
    /// which stores an owned `String`.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_key: TypeKey::of::<T>(),
        }
    }

    /// Runtime type of the wrapped value.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Returns `true` if the wrapped value is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.type_key.id == TypeId::of::<T>()
    }

    /// Borrows the wrapped value as a `T`, if it is one.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Borrows the value as a string slice when it holds a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>().map(String::as_str)
    }

    /// Returns `true` if both values share the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            return write!(f, "{s:?}");
        }
        if let Some(n) = self.downcast_ref::<i64>() {
            return write!(f, "{n}");
        }
        if let Some(b) = self.downcast_ref::<bool>() {
            return write!(f, "{b}");
        }
        if let Some(x) = self.downcast_ref::<f64>() {
            return write!(f, "{x}");
        }
        write!(f, "<{}>", self.type_key.name)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::new(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::new(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::new(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::new(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::new(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::new(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::new(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_is_stored_as_owned_string() {
        let v = Value::from("hello");
        assert!(v.is::<String>());
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn clone_shares_allocation() {
        let v = Value::new(vec![1_u8, 2, 3]);
        let w = v.clone();
        assert!(v.ptr_eq(&w));
        assert_eq!(w.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn type_key_equality_ignores_name() {
        assert_eq!(TypeKey::of::<i64>(), Value::from(5_i64).type_key());
        assert_ne!(TypeKey::of::<i64>(), TypeKey::of::<String>());
    }

    #[test]
    fn debug_renders_common_scalars() {
        assert_eq!(format!("{:?}", Value::from("x")), "\"x\"");
        assert_eq!(format!("{:?}", Value::from(7_i64)), "7");
        assert!(format!("{:?}", Value::new(3_u8)).contains("u8"));
    }
}
