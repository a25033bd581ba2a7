//! # Values and Types
//!
//! The dynamic value model carried in call arguments and results, and the type
//! descriptors methods declare for their parameters.
//!
//! `ValueType::Any` is the polymorphic slot: a sender may narrow it per call with
//! an `@argType$<index>` header, and the receiver then decodes strictly against
//! the narrower type. Narrowing is only legal when the declared type
//! [`is_assignable_from`](ValueType::is_assignable_from) the announced one.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A dynamically typed argument or result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Option(Option<Box<Value>>),
}

impl Value {
    /// The most specific type describing this value.
    ///
    /// Empty lists and `None` have no element evidence and report `Any` inside.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Bool(_) => ValueType::Bool,
            Value::U64(_) => ValueType::U64,
            Value::I64(_) => ValueType::I64,
            Value::F64(_) => ValueType::F64,
            Value::Str(_) => ValueType::Str,
            Value::Bytes(_) => ValueType::Bytes,
            Value::List(items) => {
                let mut inner = items.first().map_or(ValueType::Any, Value::value_type);
                if items.iter().any(|item| !inner.accepts(item)) {
                    inner = ValueType::Any;
                }
                ValueType::List(Box::new(inner))
            }
            Value::Option(v) => {
                ValueType::Option(Box::new(v.as_ref().map_or(ValueType::Any, |v| v.value_type())))
            }
        }
    }

    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::U64(_) => "u64",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Option(_) => "option",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::I64(v) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::U64(v) }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}

/// A declared parameter or result type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Any,
    Unit,
    Bool,
    U64,
    I64,
    F64,
    Str,
    Bytes,
    List(Box<ValueType>),
    Option(Box<ValueType>),
}

impl ValueType {
    /// Whether a slot of type `self` may hold values of type `other`.
    pub fn is_assignable_from(&self, other: &ValueType) -> bool {
        match (self, other) {
            (ValueType::Any, _) => true,
            (ValueType::List(a), ValueType::List(b)) => a.is_assignable_from(b),
            (ValueType::Option(a), ValueType::Option(b)) => a.is_assignable_from(b),
            (a, b) => a == b,
        }
    }

    /// Whether `value` is an instance of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::Unit, Value::Unit) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::U64, Value::U64(_)) => true,
            (ValueType::I64, Value::I64(_)) => true,
            (ValueType::F64, Value::F64(_)) => true,
            (ValueType::Str, Value::Str(_)) => true,
            (ValueType::Bytes, Value::Bytes(_)) => true,
            (ValueType::List(inner), Value::List(items)) => items.iter().all(|v| inner.accepts(v)),
            (ValueType::Option(_), Value::Option(None)) => true,
            (ValueType::Option(inner), Value::Option(Some(v))) => inner.accepts(v),
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Any => write!(f, "any"),
            ValueType::Unit => write!(f, "unit"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::U64 => write!(f, "u64"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::F64 => write!(f, "f64"),
            ValueType::Str => write!(f, "str"),
            ValueType::Bytes => write!(f, "bytes"),
            ValueType::List(inner) => write!(f, "list<{}>", inner),
            ValueType::Option(inner) => write!(f, "option<{}>", inner),
        }
    }
}

impl FromStr for ValueType {
    type Err = Error;

    /// Parses the names produced by `Display`, e.g. `list<option<str>>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let generic = |prefix: &str| {
            s.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('<'))
                .and_then(|rest| rest.strip_suffix('>'))
        };

        if let Some(inner) = generic("list") {
            return Ok(ValueType::List(Box::new(inner.parse()?)));
        }
        if let Some(inner) = generic("option") {
            return Ok(ValueType::Option(Box::new(inner.parse()?)));
        }

        match s {
            "any" => Ok(ValueType::Any),
            "unit" => Ok(ValueType::Unit),
            "bool" => Ok(ValueType::Bool),
            "u64" => Ok(ValueType::U64),
            "i64" => Ok(ValueType::I64),
            "f64" => Ok(ValueType::F64),
            "str" => Ok(ValueType::Str),
            "bytes" => Ok(ValueType::Bytes),
            _ => Err(Error::UnknownType(s.to_string())),
        }
    }
}
