//! Values and value classes.
//!
//! The kernel is polymorphic over what it computes. [`ValueClass`] is the
//! type hierarchy operators dispatch on; [`Value`] is the payload nodes carry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The class of a result, used for operator overload resolution.
///
/// Abstract classes (`Any`, `Numeric`, `Integer`) never describe a concrete
/// value; they appear in operator signatures to accept whole families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueClass {
    Any,
    Numeric,
    Integer,
    Bool,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

impl ValueClass {
    /// The direct base class, `None` for `Any`.
    pub fn base(self) -> Option<ValueClass> {
        use ValueClass::*;
        match self {
            Any => None,
            Numeric | Bool | String => Some(Any),
            Integer | Float32 | Float64 => Some(Numeric),
            Int32 | UInt32 | Int64 | UInt64 => Some(Integer),
        }
    }

    /// Whether `self` is `base` or one of its descendants.
    pub fn is_derived_from(self, base: ValueClass) -> bool {
        let mut class = Some(self);
        while let Some(c) = class {
            if c == base {
                return true;
            }
            class = c.base();
        }
        false
    }

    pub fn is_abstract(self) -> bool {
        matches!(self, ValueClass::Any | ValueClass::Numeric | ValueClass::Integer)
    }

    pub fn name(self) -> &'static str {
        use ValueClass::*;
        match self {
            Any => "Any",
            Numeric => "Numeric",
            Integer => "Integer",
            Bool => "Bool",
            Int32 => "Int32",
            UInt32 => "UInt32",
            Int64 => "Int64",
            UInt64 => "UInt64",
            Float32 => "Float32",
            Float64 => "Float64",
            String => "String",
        }
    }

    pub fn from_name(name: &str) -> Option<ValueClass> {
        use ValueClass::*;
        const ALL: [ValueClass; 11] = [
            Any, Numeric, Integer, Bool, Int32, UInt32, Int64, UInt64, Float32, Float64, String,
        ];
        ALL.into_iter().find(|class| class.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A computed or stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
}

impl Value {
    pub fn class(&self) -> ValueClass {
        match self {
            Value::Bool(_) => ValueClass::Bool,
            Value::Int32(_) => ValueClass::Int32,
            Value::UInt32(_) => ValueClass::UInt32,
            Value::Int64(_) => ValueClass::Int64,
            Value::UInt64(_) => ValueClass::UInt64,
            Value::Float32(_) => ValueClass::Float32,
            Value::Float64(_) => ValueClass::Float64,
            Value::String(_) => ValueClass::String,
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Result<f64> {
        match *self {
            Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            Value::Int32(v) => Ok(v as f64),
            Value::UInt32(v) => Ok(v as f64),
            Value::Int64(v) => Ok(v as f64),
            Value::UInt64(v) => Ok(v as f64),
            Value::Float32(v) => Ok(v as f64),
            Value::Float64(v) => Ok(v),
            Value::String(_) => Err(EngineError::TypeMismatch {
                expected: ValueClass::Numeric.to_string(),
                found: self.class().to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}
