use std::fmt;

use serde::Serialize;

/// Current value of a datapoint.
///
/// `Unknown` is the state of every datapoint until the first successful read
/// (or write) and is never conflated with zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer or fixed-point reading, already scaled to engineering units.
    Numeric(f64),
    Boolean(bool),
    /// Index into the datapoint's enum labels.
    EnumIndex(u16),
    Text(String),
    #[default]
    Unknown,
}

/// The kind of a known [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    Numeric,
    Boolean,
    EnumIndex,
    Text,
}

impl Value {
    /// Kind of the value, `None` for `Unknown`.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Numeric(_) => Some(ValueKind::Numeric),
            Self::Boolean(_) => Some(ValueKind::Boolean),
            Self::EnumIndex(_) => Some(ValueKind::EnumIndex),
            Self::Text(_) => Some(ValueKind::Text),
            Self::Unknown => None,
        }
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<u16> {
        match self {
            Self::EnumIndex(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Numeric(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Numeric(f64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::EnumIndex(v) => write!(f, "#{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Numeric => "numeric",
            Self::Boolean => "boolean",
            Self::EnumIndex => "enum index",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}
