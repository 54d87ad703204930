//! Hashable cell values.

use std::fmt;

/// Hashable, totally comparable cell value, used for seen-sets and group
/// keys. Floats compare by bit pattern after folding `-0.0` into `0.0` and
/// every NaN into one canonical NaN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Null,
    Int64(i64),
    Float64(u64),
    Utf8(String),
    Bool(bool),
}

impl KeyValue {
    pub fn from_f64(v: f64) -> Self {
        let normalized = if v.is_nan() {
            f64::NAN
        } else if v == 0.0 {
            0.0
        } else {
            v
        };
        Self::Float64(normalized.to_bits())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value; `None` for nulls, strings and booleans.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Utf8(v) => f.write_str(v),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_keys_fold_signed_zero_and_nan() {
        assert_eq!(KeyValue::from_f64(-0.0), KeyValue::from_f64(0.0));
        assert_eq!(KeyValue::from_f64(f64::NAN), KeyValue::from_f64(-f64::NAN));
        assert_ne!(KeyValue::from_f64(1.0), KeyValue::from_f64(1.5));
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(KeyValue::Int64(3).as_f64(), Some(3.0));
        assert_eq!(KeyValue::from_f64(2.5).as_f64(), Some(2.5));
        assert_eq!(KeyValue::Utf8("3".to_owned()).as_f64(), None);
        assert_eq!(KeyValue::Null.to_string(), "null");
    }
}
