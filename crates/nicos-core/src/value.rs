//! Dynamically typed device values.
//!
//! Devices in a setup read back floats (motors), strings (switch names),
//! integers (digital I/O) or tuples of those (multi-axis composites). [`Value`]
//! covers all of them so that composite devices can be stacked on top of each
//! other without knowing the concrete type of their attached devices.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A device value as read from or written to hardware.
///
/// Deserializes untagged, so TOML `1.5`, `3`, `"open"` and `[1.0, 2.0]` map
/// onto `Float`, `Int`, `Str` and `Tuple`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Whether `self` (a readback) matches `expected` (a table value).
    ///
    /// With a positive tolerance, two numeric values match if they differ by
    /// at most `tolerance`. In every other case exact equality is required;
    /// integers and floats compare through `f64`.
    pub fn matches(&self, expected: &Value, tolerance: Option<f64>) -> bool {
        match (self.as_f64(), expected.as_f64()) {
            (Some(actual), Some(target)) => match tolerance {
                Some(tol) if tol > 0.0 => (actual - target).abs() <= tol,
                _ => actual == target,
            },
            _ => match (self, expected) {
                (Value::Tuple(a), Value::Tuple(b)) => {
                    a.len() == b.len()
                        && a.iter().zip(b).all(|(x, y)| x.matches(y, tolerance))
                }
                _ => self == expected,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Tuple(v)
    }
}
