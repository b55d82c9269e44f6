//! Binary codec for values: little-endian, fixed-width for every kind with
//! a known physical size, raw UTF-8 for strings in variable-layout files.
//!
//! Null handling lives in the column entry flags, not here: encoding a
//! `Null` is a caller error.

use crate::{Type, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("buffer holds {actual} bytes, value needs {needed}")]
    Truncated { needed: usize, actual: usize },
    #[error("value of type {value} cannot be encoded as {column}")]
    TypeMismatch { column: String, value: String },
    #[error("null values are encoded via entry flags, not the codec")]
    Null,
    #[error("stored string is not valid utf-8")]
    Utf8,
}

type Result<T> = std::result::Result<T, CodecError>;

/// Encode a value into an exactly-sized buffer. The buffer length must
/// equal `value.type_of().physical_size()`.
pub fn encode_fixed(value: &Value, buf: &mut [u8]) -> Result<()> {
    let ty = value.type_of().ok_or(CodecError::Null)?;
    let needed = ty.physical_size().ok_or_else(|| mismatch(&ty, value))?;
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    match value {
        Value::Boolean(b) => buf[0] = *b as u8,
        Value::Byte(v) => buf[0] = *v as u8,
        Value::Short(v) => buf[..2].copy_from_slice(&v.to_le_bytes()),
        Value::Int(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
        Value::Long(v) | Value::Date(v) => buf[..8].copy_from_slice(&v.to_le_bytes()),
        Value::Float(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf[..8].copy_from_slice(&v.to_le_bytes()),
        Value::Complex32(re, im) => {
            buf[..4].copy_from_slice(&re.to_le_bytes());
            buf[4..8].copy_from_slice(&im.to_le_bytes());
        }
        Value::Complex64(re, im) => {
            buf[..8].copy_from_slice(&re.to_le_bytes());
            buf[8..16].copy_from_slice(&im.to_le_bytes());
        }
        Value::BooleanVector(v) => {
            for (i, b) in v.iter().enumerate() {
                buf[i] = *b as u8;
            }
        }
        Value::IntVector(v) => write_elems(buf, v, 4, |x, b| b.copy_from_slice(&x.to_le_bytes())),
        Value::LongVector(v) => write_elems(buf, v, 8, |x, b| b.copy_from_slice(&x.to_le_bytes())),
        Value::FloatVector(v) => write_elems(buf, v, 4, |x, b| b.copy_from_slice(&x.to_le_bytes())),
        Value::DoubleVector(v) => write_elems(buf, v, 8, |x, b| b.copy_from_slice(&x.to_le_bytes())),
        Value::Complex32Vector(v) => write_elems(buf, v, 8, |(re, im), b| {
            b[..4].copy_from_slice(&re.to_le_bytes());
            b[4..].copy_from_slice(&im.to_le_bytes());
        }),
        Value::Complex64Vector(v) => write_elems(buf, v, 16, |(re, im), b| {
            b[..8].copy_from_slice(&re.to_le_bytes());
            b[8..].copy_from_slice(&im.to_le_bytes());
        }),
        Value::String(_) | Value::Null => return Err(mismatch(&ty, value)),
    }
    Ok(())
}

/// Decode a fixed-width value of the given type.
pub fn decode_fixed(ty: &Type, buf: &[u8]) -> Result<Value> {
    let needed = ty.physical_size().ok_or(CodecError::TypeMismatch {
        column: ty.to_string(),
        value: "variable-width".into(),
    })?;
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(match ty {
        Type::Boolean => Value::Boolean(buf[0] != 0),
        Type::Byte => Value::Byte(buf[0] as i8),
        Type::Short => Value::Short(i16::from_le_bytes([buf[0], buf[1]])),
        Type::Int => Value::Int(i32::from_le_bytes(buf[..4].try_into().unwrap())),
        Type::Long => Value::Long(i64::from_le_bytes(buf[..8].try_into().unwrap())),
        Type::Date => Value::Date(i64::from_le_bytes(buf[..8].try_into().unwrap())),
        Type::Float => Value::Float(f32::from_le_bytes(buf[..4].try_into().unwrap())),
        Type::Double => Value::Double(f64::from_le_bytes(buf[..8].try_into().unwrap())),
        Type::Complex32 => Value::Complex32(
            f32::from_le_bytes(buf[..4].try_into().unwrap()),
            f32::from_le_bytes(buf[4..8].try_into().unwrap()),
        ),
        Type::Complex64 => Value::Complex64(
            f64::from_le_bytes(buf[..8].try_into().unwrap()),
            f64::from_le_bytes(buf[8..16].try_into().unwrap()),
        ),
        Type::BooleanVector(n) => Value::BooleanVector((0..*n).map(|i| buf[i] != 0).collect()),
        Type::IntVector(n) => Value::IntVector(read_elems(buf, *n, 4, |b| {
            i32::from_le_bytes(b.try_into().unwrap())
        })),
        Type::LongVector(n) => Value::LongVector(read_elems(buf, *n, 8, |b| {
            i64::from_le_bytes(b.try_into().unwrap())
        })),
        Type::FloatVector(n) => Value::FloatVector(read_elems(buf, *n, 4, |b| {
            f32::from_le_bytes(b.try_into().unwrap())
        })),
        Type::DoubleVector(n) => Value::DoubleVector(read_elems(buf, *n, 8, |b| {
            f64::from_le_bytes(b.try_into().unwrap())
        })),
        Type::Complex32Vector(n) => Value::Complex32Vector(read_elems(buf, *n, 8, |b| {
            (
                f32::from_le_bytes(b[..4].try_into().unwrap()),
                f32::from_le_bytes(b[4..].try_into().unwrap()),
            )
        })),
        Type::Complex64Vector(n) => Value::Complex64Vector(read_elems(buf, *n, 16, |b| {
            (
                f64::from_le_bytes(b[..8].try_into().unwrap()),
                f64::from_le_bytes(b[8..].try_into().unwrap()),
            )
        })),
        Type::String => unreachable!("string has no physical size"),
    })
}

/// Encode a value for a variable-layout column. Strings become raw UTF-8;
/// fixed-width kinds reuse their fixed encoding.
pub fn encode_variable(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Null => Err(CodecError::Null),
        other => {
            let ty = other.type_of().ok_or(CodecError::Null)?;
            let size = ty.physical_size().ok_or_else(|| mismatch(&ty, other))?;
            let mut buf = vec![0u8; size];
            encode_fixed(other, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode a variable-width payload of the given type.
pub fn decode_variable(ty: &Type, bytes: &[u8]) -> Result<Value> {
    match ty {
        Type::String => Ok(Value::String(
            std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?.to_string(),
        )),
        other => decode_fixed(other, bytes),
    }
}

fn mismatch(ty: &Type, value: &Value) -> CodecError {
    CodecError::TypeMismatch {
        column: ty.to_string(),
        value: format!("{value:?}"),
    }
}

fn write_elems<T: Copy>(buf: &mut [u8], elems: &[T], width: usize, mut write: impl FnMut(T, &mut [u8])) {
    for (i, e) in elems.iter().enumerate() {
        write(*e, &mut buf[i * width..(i + 1) * width]);
    }
}

fn read_elems<T>(buf: &[u8], n: usize, width: usize, mut read: impl FnMut(&[u8]) -> T) -> Vec<T> {
    (0..n).map(|i| read(&buf[i * width..(i + 1) * width])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: Value) {
        let ty = value.type_of().unwrap();
        let size = ty.physical_size().unwrap();
        let mut buf = vec![0u8; size];
        encode_fixed(&value, &mut buf).unwrap();
        assert_eq!(decode_fixed(&ty, &buf).unwrap(), value);
    }

    #[test]
    fn fixed_round_trips() {
        round_trip(Value::Boolean(true));
        round_trip(Value::Byte(-3));
        round_trip(Value::Short(1024));
        round_trip(Value::Int(-7));
        round_trip(Value::Long(i64::MAX));
        round_trip(Value::Float(0.5));
        round_trip(Value::Double(-1.25));
        round_trip(Value::Date(1_700_000_000_000));
        round_trip(Value::Complex64(1.5, -2.5));
        round_trip(Value::FloatVector(vec![1.0, 0.0, -0.5]));
        round_trip(Value::LongVector(vec![1, 2, 3]));
        round_trip(Value::BooleanVector(vec![true, false, true]));
        round_trip(Value::Complex32Vector(vec![(1.0, 2.0), (3.0, 4.0)]));
    }

    #[test]
    fn string_round_trips_variable() {
        let bytes = encode_variable(&Value::String("warren".into())).unwrap();
        assert_eq!(bytes, b"warren");
        assert_eq!(
            decode_variable(&Type::String, &bytes).unwrap(),
            Value::String("warren".into())
        );
    }

    #[test]
    fn null_is_rejected() {
        let mut buf = [0u8; 8];
        assert!(matches!(
            encode_fixed(&Value::Null, &mut buf),
            Err(CodecError::Null)
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut buf = [0u8; 2];
        assert!(matches!(
            encode_fixed(&Value::Long(1), &mut buf),
            Err(CodecError::Truncated { needed: 8, .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            decode_variable(&Type::String, &[0xFF, 0xFE]),
            Err(CodecError::Utf8)
        ));
    }

    proptest! {
        #[test]
        fn float_vectors_round_trip(v in proptest::collection::vec(any::<f32>(), 0..64)) {
            // NaN payloads survive the byte-level round trip but fail
            // PartialEq, so compare bit patterns.
            let value = Value::FloatVector(v.clone());
            let ty = value.type_of().unwrap();
            let mut buf = vec![0u8; ty.physical_size().unwrap()];
            encode_fixed(&value, &mut buf).unwrap();
            match decode_fixed(&ty, &buf).unwrap() {
                Value::FloatVector(back) => {
                    prop_assert_eq!(back.len(), v.len());
                    for (a, b) in back.iter().zip(v.iter()) {
                        prop_assert_eq!(a.to_bits(), b.to_bits());
                    }
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn strings_round_trip(s in ".*") {
            let bytes = encode_variable(&Value::String(s.clone())).unwrap();
            prop_assert_eq!(decode_variable(&Type::String, &bytes).unwrap(), Value::String(s));
        }
    }
}
