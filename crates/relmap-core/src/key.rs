//! Identity keys.
//!
//! An [`IdentityKey`] names one persisted row of one entity type: either a
//! single column value or an ordered [`CompositeKey`] for multi-column
//! primary keys. Equality and hashing are structural and agree with each
//! other, so keys can index the identity map directly.

use crate::value::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primary key of a persisted row.
#[derive(Debug, Clone)]
pub enum IdentityKey {
    Scalar(Value),
    Composite(CompositeKey),
}

/// Ordered multi-column key value.
#[derive(Debug, Clone)]
pub struct CompositeKey(Vec<Value>);

impl CompositeKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IdentityKey {
    /// Build a key from column values in key order.
    ///
    /// Returns `None` for an empty set or when any component is NULL, which
    /// is how an unsaved entity with a generated key reports itself.
    pub fn from_values(mut values: Vec<Value>) -> Option<Self> {
        if values.is_empty() || values.iter().any(Value::is_null) {
            return None;
        }
        if values.len() == 1 {
            return values.pop().map(IdentityKey::Scalar);
        }
        Some(IdentityKey::Composite(CompositeKey(values)))
    }

    /// The key's components in order.
    pub fn values(&self) -> &[Value] {
        match self {
            IdentityKey::Scalar(v) => std::slice::from_ref(v),
            IdentityKey::Composite(c) => c.values(),
        }
    }

    pub fn arity(&self) -> usize {
        self.values().len()
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.values(), other.values());
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let values = self.values();
        values.len().hash(state);
        for v in values {
            hash_value(v, state);
        }
    }
}

/// Hash a key component consistently with [`Value::key_eq`].
fn hash_value<H: Hasher>(v: &Value, state: &mut H) {
    if let Some(i) = v.as_integer() {
        1u8.hash(state);
        i.hash(state);
        return;
    }
    match v {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            2u8.hash(state);
            b.hash(state);
        }
        Value::Double(f) => {
            3u8.hash(state);
            f.to_bits().hash(state);
        }
        Value::Text(s) => {
            4u8.hash(state);
            s.hash(state);
        }
        Value::Bytes(b) => {
            5u8.hash(state);
            b.hash(state);
        }
        Value::Uuid(u) => {
            6u8.hash(state);
            u.hash(state);
        }
        Value::Json(j) => {
            7u8.hash(state);
            j.to_string().hash(state);
        }
        Value::Int(_) | Value::BigInt(_) => {}
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Scalar(v) => write!(f, "{v}"),
            IdentityKey::Composite(c) => {
                write!(f, "(")?;
                for (i, v) in c.values().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for IdentityKey {
    fn from(v: i64) -> Self {
        IdentityKey::Scalar(Value::BigInt(v))
    }
}

impl From<i32> for IdentityKey {
    fn from(v: i32) -> Self {
        IdentityKey::Scalar(Value::Int(v))
    }
}

impl From<&str> for IdentityKey {
    fn from(v: &str) -> Self {
        IdentityKey::Scalar(Value::from(v))
    }
}

impl From<String> for IdentityKey {
    fn from(v: String) -> Self {
        IdentityKey::Scalar(Value::Text(v))
    }
}

impl From<CompositeKey> for IdentityKey {
    fn from(v: CompositeKey) -> Self {
        IdentityKey::Composite(v)
    }
}
