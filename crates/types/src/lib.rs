//! Value model for the column store: scalar and vector kinds, type
//! descriptors, and the fixed-width binary codec used by column files.
//!
//! Every column declares a [`Type`]. Scalars cover the usual numeric ladder
//! plus dates (epoch milliseconds), strings, and complex numbers; vectors
//! exist for every numeric kind and carry a fixed logical length. Strings
//! are the only kind without a fixed physical size and therefore the only
//! kind stored in variable-layout column files.

pub mod codec;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Type descriptor for a column. Vector variants carry the logical element
/// count, which is fixed for the lifetime of the column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Date,
    String,
    Complex32,
    Complex64,
    BooleanVector(usize),
    IntVector(usize),
    LongVector(usize),
    FloatVector(usize),
    DoubleVector(usize),
    Complex32Vector(usize),
    Complex64Vector(usize),
}

impl Type {
    /// Stable ordinal persisted in column file headers.
    pub fn ordinal(&self) -> i32 {
        match self {
            Type::Boolean => 0,
            Type::Byte => 1,
            Type::Short => 2,
            Type::Int => 3,
            Type::Long => 4,
            Type::Float => 5,
            Type::Double => 6,
            Type::Date => 7,
            Type::String => 8,
            Type::Complex32 => 9,
            Type::Complex64 => 10,
            Type::BooleanVector(_) => 11,
            Type::IntVector(_) => 12,
            Type::LongVector(_) => 13,
            Type::FloatVector(_) => 14,
            Type::DoubleVector(_) => 15,
            Type::Complex32Vector(_) => 16,
            Type::Complex64Vector(_) => 17,
        }
    }

    /// Reconstruct a type from its persisted ordinal and logical size.
    pub fn from_ordinal(ordinal: i32, logical_size: usize) -> Option<Type> {
        Some(match ordinal {
            0 => Type::Boolean,
            1 => Type::Byte,
            2 => Type::Short,
            3 => Type::Int,
            4 => Type::Long,
            5 => Type::Float,
            6 => Type::Double,
            7 => Type::Date,
            8 => Type::String,
            9 => Type::Complex32,
            10 => Type::Complex64,
            11 => Type::BooleanVector(logical_size),
            12 => Type::IntVector(logical_size),
            13 => Type::LongVector(logical_size),
            14 => Type::FloatVector(logical_size),
            15 => Type::DoubleVector(logical_size),
            16 => Type::Complex32Vector(logical_size),
            17 => Type::Complex64Vector(logical_size),
            _ => return None,
        })
    }

    /// Element count: 1 for scalars, the declared length for vectors.
    pub fn logical_size(&self) -> usize {
        match self {
            Type::BooleanVector(n)
            | Type::IntVector(n)
            | Type::LongVector(n)
            | Type::FloatVector(n)
            | Type::DoubleVector(n)
            | Type::Complex32Vector(n)
            | Type::Complex64Vector(n) => *n,
            _ => 1,
        }
    }

    /// Size in bytes of one encoded value, or `None` for variable-width
    /// kinds (strings).
    pub fn physical_size(&self) -> Option<usize> {
        Some(match self {
            Type::Boolean | Type::Byte => 1,
            Type::Short => 2,
            Type::Int | Type::Float => 4,
            Type::Long | Type::Double | Type::Date | Type::Complex32 => 8,
            Type::Complex64 => 16,
            Type::String => return None,
            Type::BooleanVector(n) => *n,
            Type::IntVector(n) | Type::FloatVector(n) => 4 * n,
            Type::LongVector(n) | Type::DoubleVector(n) | Type::Complex32Vector(n) => 8 * n,
            Type::Complex64Vector(n) => 16 * n,
        })
    }

    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Type::BooleanVector(_)
                | Type::IntVector(_)
                | Type::LongVector(_)
                | Type::FloatVector(_)
                | Type::DoubleVector(_)
                | Type::Complex32Vector(_)
                | Type::Complex64Vector(_)
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::Byte | Type::Short | Type::Int | Type::Long | Type::Float | Type::Double
        )
    }

    /// True if `value` can be stored in a column of this type. `Null` is
    /// compatible with every type; nullability is enforced by the column.
    pub fn accepts(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            other => other.type_of().as_ref() == Some(self),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::BooleanVector(n) => write!(f, "boolean_vec[{n}]"),
            Type::IntVector(n) => write!(f, "int_vec[{n}]"),
            Type::LongVector(n) => write!(f, "long_vec[{n}]"),
            Type::FloatVector(n) => write!(f, "float_vec[{n}]"),
            Type::DoubleVector(n) => write!(f, "double_vec[{n}]"),
            Type::Complex32Vector(n) => write!(f, "complex32_vec[{n}]"),
            Type::Complex64Vector(n) => write!(f, "complex64_vec[{n}]"),
            scalar => write!(f, "{}", format!("{scalar:?}").to_lowercase()),
        }
    }
}

/// A single typed value. `Date` carries epoch milliseconds; complex values
/// carry `(re, im)` pairs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    String(String),
    Complex32(f32, f32),
    Complex64(f64, f64),
    BooleanVector(Vec<bool>),
    IntVector(Vec<i32>),
    LongVector(Vec<i64>),
    FloatVector(Vec<f32>),
    DoubleVector(Vec<f64>),
    Complex32Vector(Vec<(f32, f32)>),
    Complex64Vector(Vec<(f64, f64)>),
    Null,
}

impl Value {
    /// The type of this value, or `None` for `Null`.
    pub fn type_of(&self) -> Option<Type> {
        Some(match self {
            Value::Boolean(_) => Type::Boolean,
            Value::Byte(_) => Type::Byte,
            Value::Short(_) => Type::Short,
            Value::Int(_) => Type::Int,
            Value::Long(_) => Type::Long,
            Value::Float(_) => Type::Float,
            Value::Double(_) => Type::Double,
            Value::Date(_) => Type::Date,
            Value::String(_) => Type::String,
            Value::Complex32(_, _) => Type::Complex32,
            Value::Complex64(_, _) => Type::Complex64,
            Value::BooleanVector(v) => Type::BooleanVector(v.len()),
            Value::IntVector(v) => Type::IntVector(v.len()),
            Value::LongVector(v) => Type::LongVector(v.len()),
            Value::FloatVector(v) => Type::FloatVector(v.len()),
            Value::DoubleVector(v) => Type::DoubleVector(v.len()),
            Value::Complex32Vector(v) => Type::Complex32Vector(v.len()),
            Value::Complex64Vector(v) => Type::Complex64Vector(v.len()),
            Value::Null => return None,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of a scalar, used by aggregates and the cost model.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(v) => Some(*v as f64),
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Flatten a numeric vector to `f64` components, used by the distance
    /// kernels and the VA-file quantizer.
    pub fn as_f64_vector(&self) -> Option<Vec<f64>> {
        match self {
            Value::IntVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::LongVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::FloatVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::DoubleVector(v) => Some(v.clone()),
            Value::BooleanVector(v) => {
                Some(v.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect())
            }
            _ => None,
        }
    }

    /// Compare two values of the same scalar type. Cross-type comparisons
    /// and vector comparisons return `None`.
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Byte(a), Value::Byte(b)) => Some(a.cmp(b)),
            (Value::Short(a), Value::Short(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn eq_same_type(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Complex32(ar, ai), Value::Complex32(br, bi)) => Some(ar == br && ai == bi),
            (Value::Complex64(ar, ai), Value::Complex64(br, bi)) => Some(ar == br && ai == bi),
            (a, b) if a.type_of().is_some() && a.type_of() == b.type_of() => Some(a == b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Null => write!(f, "null"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cmp::Ordering::{Equal, Greater, Less};

    #[test]
    fn ordinal_round_trip() {
        let all = [
            Type::Boolean,
            Type::Byte,
            Type::Short,
            Type::Int,
            Type::Long,
            Type::Float,
            Type::Double,
            Type::Date,
            Type::String,
            Type::Complex32,
            Type::Complex64,
            Type::BooleanVector(8),
            Type::IntVector(3),
            Type::LongVector(3),
            Type::FloatVector(128),
            Type::DoubleVector(64),
            Type::Complex32Vector(2),
            Type::Complex64Vector(2),
        ];
        for ty in all {
            let back = Type::from_ordinal(ty.ordinal(), ty.logical_size()).unwrap();
            assert_eq!(ty, back);
        }
        assert!(Type::from_ordinal(99, 1).is_none());
    }

    #[test]
    fn physical_sizes() {
        assert_eq!(Type::Boolean.physical_size(), Some(1));
        assert_eq!(Type::Long.physical_size(), Some(8));
        assert_eq!(Type::Complex64.physical_size(), Some(16));
        assert_eq!(Type::FloatVector(128).physical_size(), Some(512));
        assert_eq!(Type::String.physical_size(), None);
    }

    #[test]
    fn type_accepts_value() {
        assert!(Type::Int.accepts(&Value::Int(1)));
        assert!(!Type::Int.accepts(&Value::Long(1)));
        assert!(Type::FloatVector(2).accepts(&Value::FloatVector(vec![1.0, 0.0])));
        assert!(!Type::FloatVector(2).accepts(&Value::FloatVector(vec![1.0])));
        // Null is type-compatible everywhere; nullability is a column concern.
        assert!(Type::String.accepts(&Value::Null));
    }

    #[test]
    fn comparisons_require_same_type() {
        assert_eq!(Value::Int(1).cmp_same_type(&Value::Int(2)), Some(Less));
        assert_eq!(
            Value::String("b".into()).cmp_same_type(&Value::String("a".into())),
            Some(Greater)
        );
        assert_eq!(Value::Int(1).cmp_same_type(&Value::Long(1)), None);
        assert_eq!(Value::Null.cmp_same_type(&Value::Int(1)), None);
    }

    #[test]
    fn vector_flattening() {
        assert_eq!(
            Value::FloatVector(vec![1.0, 0.5]).as_f64_vector(),
            Some(vec![1.0, 0.5])
        );
        assert_eq!(Value::String("x".into()).as_f64_vector(), None);
    }

    #[test]
    fn serde_round_trip_stability() {
        let values = vec![
            Value::Long(-42),
            Value::String("Ada".into()),
            Value::Boolean(true),
            Value::FloatVector(vec![1.0, -0.5]),
            Value::Complex64(0.5, -0.5),
            Value::Null,
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn complex_equality() {
        assert_eq!(
            Value::Complex32(1.0, -1.0).eq_same_type(&Value::Complex32(1.0, -1.0)),
            Some(true)
        );
        assert_eq!(Value::Int(1).eq_same_type(&Value::String("1".into())), None);
        assert_eq!(Equal, Value::Int(3).cmp_same_type(&Value::Int(3)).unwrap());
    }

    proptest! {
        #[test]
        fn order_is_antisymmetric(a in any::<i64>(), b in any::<i64>()) {
            let va = Value::Long(a);
            let vb = Value::Long(b);
            let fwd = va.cmp_same_type(&vb).unwrap();
            let rev = vb.cmp_same_type(&va).unwrap();
            prop_assert_eq!(fwd, rev.reverse());
        }

        #[test]
        fn double_cmp_matches_partial_cmp(a in any::<f64>(), b in any::<f64>()) {
            let got = Value::Double(a).cmp_same_type(&Value::Double(b));
            prop_assert_eq!(got, a.partial_cmp(&b));
        }

        #[test]
        fn eq_is_reflexive_for_ints(v in any::<i32>()) {
            prop_assert_eq!(Value::Int(v).eq_same_type(&Value::Int(v)), Some(true));
        }
    }
}
