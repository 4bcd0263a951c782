//! Runtime values produced by expression evaluation and bound into decode frames.

use std::fmt;

/// A value visible to expressions: decoded scalars, literals and scalar-array lists.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<RuntimeValue>),
}

impl RuntimeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RuntimeValue::Int(x) => Some(*x),
            RuntimeValue::Bool(b) => Some(*b as i64),
            RuntimeValue::Float(x) if x.fract() == 0.0 => Some(*x as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RuntimeValue::Int(x) => Some(*x as f64),
            RuntimeValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RuntimeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RuntimeValue]> {
        match self {
            RuntimeValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// Truthiness for conditions: bools as-is, numbers are true when non-zero,
    /// strings and lists when non-empty.
    pub fn truthy(&self) -> bool {
        match self {
            RuntimeValue::Bool(b) => *b,
            RuntimeValue::Int(x) => *x != 0,
            RuntimeValue::Float(x) => *x != 0.0,
            RuntimeValue::Str(s) => !s.is_empty(),
            RuntimeValue::List(v) => !v.is_empty(),
        }
    }

    /// Short kind name used in type-mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeValue::Int(_) => "int",
            RuntimeValue::Float(_) => "float",
            RuntimeValue::Str(_) => "string",
            RuntimeValue::Bool(_) => "bool",
            RuntimeValue::List(_) => "list",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, RuntimeValue::Int(_) | RuntimeValue::Float(_))
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Int(x) => write!(f, "{}", x),
            RuntimeValue::Float(x) => write!(f, "{}", x),
            RuntimeValue::Str(s) => write!(f, "'{}'", s),
            RuntimeValue::Bool(b) => write!(f, "{}", b),
            RuntimeValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for RuntimeValue {
    fn from(v: i64) -> Self {
        RuntimeValue::Int(v)
    }
}

impl From<bool> for RuntimeValue {
    fn from(v: bool) -> Self {
        RuntimeValue::Bool(v)
    }
}

impl From<&str> for RuntimeValue {
    fn from(v: &str) -> Self {
        RuntimeValue::Str(v.to_string())
    }
}

impl From<String> for RuntimeValue {
    fn from(v: String) -> Self {
        RuntimeValue::Str(v)
    }
}
