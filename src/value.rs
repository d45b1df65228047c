/// LivePivot Scalar Values
///
/// A `PivotValue` is the scalar stored in every aggregation row and every
/// assembled pivot cell. Besides the usual JSON scalars it carries
/// sentinels for arithmetic that has no numeric answer (a comparison against
/// a zero prior value, a share of a zero total), so the renderer can show a
/// marker instead of `Infinity`/`NaN`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Markers emitted in place of a number when a ratio is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    /// Comparison value exists but is zero.
    PriorValueZero,
    /// No comparison value was returned for the cell.
    PriorValueMissing,
    /// Percent-of-total denominator is zero.
    TotalZero,
    /// Percent-of-total denominator is missing.
    TotalMissing,
}

impl Sentinel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::PriorValueZero => "prior_value_zero",
            Sentinel::PriorValueMissing => "prior_value_missing",
            Sentinel::TotalZero => "total_zero",
            Sentinel::TotalMissing => "total_missing",
        }
    }
}

/// Scalar value for dimensions, measures and assembled cells.
///
/// `Null` doubles as the "no data" value for cell combinations the
/// aggregation service did not return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum PivotValue {
    #[default]
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Sentinel(Sentinel),
}

impl PivotValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PivotValue::Null)
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, PivotValue::Sentinel(_))
    }

    /// Numeric view of the value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PivotValue::Int64(v) => Some(*v as f64),
            PivotValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PivotValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PivotValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PivotValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_sentinel(&self) -> Option<Sentinel> {
        match self {
            PivotValue::Sentinel(s) => Some(*s),
            _ => None,
        }
    }

    /// String key used for composite lookups and row paths.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Total order between two values, for sorting.
    ///
    /// Numbers compare numerically across integer/float, strings
    /// lexicographically. Nulls sort after everything else; mixed types fall
    /// back to comparing their debug representation so the order is
    /// deterministic.
    pub fn compare(&self, other: &PivotValue) -> Ordering {
        match (self, other) {
            (PivotValue::Null, PivotValue::Null) => Ordering::Equal,
            (PivotValue::Null, _) => Ordering::Greater,
            (_, PivotValue::Null) => Ordering::Less,
            (PivotValue::String(a), PivotValue::String(b)) => a.cmp(b),
            (PivotValue::Bool(a), PivotValue::Bool(b)) => a.cmp(b),
            (PivotValue::Int64(a), PivotValue::Int64(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => format!("{:?}", a).cmp(&format!("{:?}", b)),
            },
        }
    }

    /// Equality used by filters: numbers compare by value across types.
    pub fn loosely_equals(&self, other: &PivotValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for PivotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PivotValue::Null => write!(f, "null"),
            PivotValue::Bool(v) => write!(f, "{}", v),
            PivotValue::Int64(v) => write!(f, "{}", v),
            PivotValue::Float64(v) => write!(f, "{}", v),
            PivotValue::String(v) => write!(f, "{}", v),
            PivotValue::Sentinel(s) => write!(f, "{}", s.as_str()),
        }
    }
}

impl From<&str> for PivotValue {
    fn from(v: &str) -> Self {
        PivotValue::String(v.to_string())
    }
}

impl From<String> for PivotValue {
    fn from(v: String) -> Self {
        PivotValue::String(v)
    }
}

impl From<i64> for PivotValue {
    fn from(v: i64) -> Self {
        PivotValue::Int64(v)
    }
}

impl From<f64> for PivotValue {
    fn from(v: f64) -> Self {
        PivotValue::Float64(v)
    }
}

impl From<bool> for PivotValue {
    fn from(v: bool) -> Self {
        PivotValue::Bool(v)
    }
}

impl From<Sentinel> for PivotValue {
    fn from(v: Sentinel) -> Self {
        PivotValue::Sentinel(v)
    }
}
