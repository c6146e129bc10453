use std::collections::HashMap;

use ethnum::{I256, U256};
use thiserror::Error;

use crate::algebraic_type::AlgebraicType;
use crate::algebraic_value::AlgebraicValue;
use crate::bsatn::de::{OPTION_NONE_TAG, OPTION_SOME_TAG};
use crate::buffer::BufWriter;

/// An error that occurred while encoding a host value against a type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("missing field `{0}`")]
    MissingField(Box<str>),
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: Box<str> },
    #[error("sum tag {tag} has no variant")]
    InvalidSumTag { tag: u8 },
    #[error("cannot encode against unresolved type ref {0}")]
    UnresolvedRef(u32),
}

fn mismatch(ty: &AlgebraicType, value: &AlgebraicValue) -> EncodeError {
    EncodeError::TypeMismatch {
        expected: ty.kind_name(),
        found: value.kind_name().into(),
    }
}

/// Encodes `value` against `ty`, appending the BSATN bytes to `w`.
///
/// The encoder is deliberately a little forgiving about host-value shape:
/// any integer variant is accepted for any integer type as long as the value
/// is in range, integers are accepted where floats are expected, and a bare
/// value is auto-wrapped as `some` where an option is expected. Everything
/// else is a [`EncodeError::TypeMismatch`].
pub fn encode_value(value: &AlgebraicValue, ty: &AlgebraicType, w: &mut impl BufWriter) -> Result<(), EncodeError> {
    match ty {
        AlgebraicType::Bool => match value {
            AlgebraicValue::Bool(b) => w.put_u8(*b as u8),
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::I8 => w.put_i8(signed_in_range(value, ty, 8)?.into_words().1 as i8),
        AlgebraicType::U8 => w.put_u8(unsigned_in_range(value, ty, 8)?.into_words().1 as u8),
        AlgebraicType::I16 => w.put_i16(signed_in_range(value, ty, 16)?.into_words().1 as i16),
        AlgebraicType::U16 => w.put_u16(unsigned_in_range(value, ty, 16)?.into_words().1 as u16),
        AlgebraicType::I32 => w.put_i32(signed_in_range(value, ty, 32)?.into_words().1 as i32),
        AlgebraicType::U32 => w.put_u32(unsigned_in_range(value, ty, 32)?.into_words().1 as u32),
        AlgebraicType::I64 => w.put_i64(signed_in_range(value, ty, 64)?.into_words().1 as i64),
        AlgebraicType::U64 => w.put_u64(unsigned_in_range(value, ty, 64)?.into_words().1 as u64),
        AlgebraicType::I128 => w.put_i128(signed_in_range(value, ty, 128)?.into_words().1),
        AlgebraicType::U128 => w.put_u128(unsigned_in_range(value, ty, 128)?.into_words().1),
        AlgebraicType::I256 => w.put_slice(&signed_in_range(value, ty, 256)?.to_le_bytes()),
        AlgebraicType::U256 => w.put_slice(&unsigned_in_range(value, ty, 256)?.to_le_bytes()),
        AlgebraicType::F32 => w.put_slice(&float_of(value, ty)?.0.to_le_bytes()),
        AlgebraicType::F64 => w.put_slice(&float_of(value, ty)?.1.to_le_bytes()),
        AlgebraicType::String => match value {
            AlgebraicValue::String(s) => {
                w.put_u32(s.len() as u32);
                w.put_slice(s.as_bytes());
            }
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::Bytes => match value {
            AlgebraicValue::Bytes(b) => {
                w.put_u32(b.len() as u32);
                w.put_slice(b);
            }
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::Array(elem) => match value {
            AlgebraicValue::Array(elements) => {
                w.put_u32(elements.len() as u32);
                for element in elements.iter() {
                    encode_value(element, elem, w)?;
                }
            }
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::Option(inner) => match value {
            AlgebraicValue::Some(v) => {
                w.put_u8(OPTION_SOME_TAG);
                encode_value(v, inner, w)?;
            }
            AlgebraicValue::None => w.put_u8(OPTION_NONE_TAG),
            // A bare value auto-wraps as `some`.
            v => {
                w.put_u8(OPTION_SOME_TAG);
                encode_value(v, inner, w)?;
            }
        },
        AlgebraicType::Product(p) => match value {
            AlgebraicValue::Product(pv) if pv.elements.len() == p.elements.len() => {
                for (element, elem_ty) in pv.elements.iter().zip(p.elements.iter()) {
                    encode_value(element, &elem_ty.algebraic_type, w)?;
                }
            }
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::Sum(s) => match value {
            AlgebraicValue::Sum(sv) => {
                let variant = s
                    .variants
                    .get(sv.tag as usize)
                    .ok_or(EncodeError::InvalidSumTag { tag: sv.tag })?;
                w.put_u8(sv.tag);
                match (&variant.algebraic_type, &sv.value) {
                    (Some(payload_ty), Some(payload)) => encode_value(payload, payload_ty, w)?,
                    (None, None) => {}
                    _ => return Err(mismatch(ty, value)),
                }
            }
            _ => return Err(mismatch(ty, value)),
        },
        AlgebraicType::Ref(idx) => return Err(EncodeError::UnresolvedRef(*idx)),
    }
    Ok(())
}

/// Encodes `value` against `ty` into a fresh buffer.
pub fn to_vec(value: &AlgebraicValue, ty: &AlgebraicType) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_value(value, ty, &mut out)?;
    Ok(out)
}

/// Encodes a name-keyed argument mapping as a product over the named,
/// typed `params`.
///
/// Each parameter is looked up in `args` by name; a parameter absent from
/// the mapping is [`EncodeError::MissingField`]. Extra keys in `args` are
/// ignored.
pub fn encode_product_from_map<'a>(
    args: &HashMap<String, AlgebraicValue>,
    params: impl IntoIterator<Item = (&'a str, &'a AlgebraicType)>,
    w: &mut impl BufWriter,
) -> Result<(), EncodeError> {
    for (name, ty) in params {
        let value = args
            .get(name)
            .ok_or_else(|| EncodeError::MissingField(name.into()))?;
        encode_value(value, ty, w)?;
    }
    Ok(())
}

/// The numeric payload of `value` as a signed/unsigned 256-bit pair, or
/// `None` if `value` is not an integer.
fn int_of(value: &AlgebraicValue) -> Option<Result<I256, U256>> {
    Some(match value {
        AlgebraicValue::I8(x) => Ok(I256::from(*x)),
        AlgebraicValue::I16(x) => Ok(I256::from(*x)),
        AlgebraicValue::I32(x) => Ok(I256::from(*x)),
        AlgebraicValue::I64(x) => Ok(I256::from(*x)),
        AlgebraicValue::I128(x) => Ok(I256::from(*x)),
        AlgebraicValue::I256(x) => Ok(**x),
        AlgebraicValue::U8(x) => Err(U256::from(*x)),
        AlgebraicValue::U16(x) => Err(U256::from(*x)),
        AlgebraicValue::U32(x) => Err(U256::from(*x)),
        AlgebraicValue::U64(x) => Err(U256::from(*x)),
        AlgebraicValue::U128(x) => Err(U256::from(*x)),
        AlgebraicValue::U256(x) => Err(**x),
        _ => return None,
    })
}

/// Reinterprets a non-negative signed value's bits as unsigned.
fn unsigned_bits(signed: I256) -> U256 {
    let (hi, lo) = signed.into_words();
    U256::from_words(hi as u128, lo as u128)
}

/// Reinterprets an unsigned value's bits as signed; only meaningful when the
/// value fits `i256`.
fn signed_bits(unsigned: U256) -> I256 {
    let (hi, lo) = unsigned.into_words();
    I256::from_words(hi as i128, lo as i128)
}

fn unsigned_in_range(value: &AlgebraicValue, ty: &AlgebraicType, bits: u32) -> Result<U256, EncodeError> {
    let max = if bits == 256 {
        U256::MAX
    } else {
        (U256::new(1) << bits) - U256::new(1)
    };
    let magnitude = match int_of(value).ok_or_else(|| mismatch(ty, value))? {
        Ok(signed) if signed >= I256::new(0) => unsigned_bits(signed),
        Ok(_) => return Err(mismatch(ty, value)),
        Err(unsigned) => unsigned,
    };
    if magnitude > max {
        return Err(mismatch(ty, value));
    }
    Ok(magnitude)
}

fn signed_in_range(value: &AlgebraicValue, ty: &AlgebraicType, bits: u32) -> Result<I256, EncodeError> {
    let (min, max) = if bits == 256 {
        (I256::MIN, I256::MAX)
    } else {
        let half = I256::new(1) << (bits - 1);
        (-half, half - I256::new(1))
    };
    let val = match int_of(value).ok_or_else(|| mismatch(ty, value))? {
        Ok(signed) => signed,
        Err(unsigned) => {
            // Anything past i256::MAX cannot be signed-representable.
            if unsigned > U256::MAX >> 1u32 {
                return Err(mismatch(ty, value));
            }
            signed_bits(unsigned)
        }
    };
    if val < min || val > max {
        return Err(mismatch(ty, value));
    }
    Ok(val)
}

/// `value` as both float widths. Integer variants up to 64 bits widen; other
/// shapes are mismatches.
fn float_of(value: &AlgebraicValue, ty: &AlgebraicType) -> Result<(f32, f64), EncodeError> {
    Ok(match value {
        AlgebraicValue::F32(x) => {
            let x = x.into_inner();
            (x, x as f64)
        }
        AlgebraicValue::F64(x) => {
            let x = x.into_inner();
            (x as f32, x)
        }
        AlgebraicValue::I8(x) => (*x as f32, *x as f64),
        AlgebraicValue::I16(x) => (*x as f32, *x as f64),
        AlgebraicValue::I32(x) => (*x as f32, *x as f64),
        AlgebraicValue::I64(x) => (*x as f32, *x as f64),
        AlgebraicValue::U8(x) => (*x as f32, *x as f64),
        AlgebraicValue::U16(x) => (*x as f32, *x as f64),
        AlgebraicValue::U32(x) => (*x as f32, *x as f64),
        AlgebraicValue::U64(x) => (*x as f32, *x as f64),
        _ => return Err(mismatch(ty, value)),
    })
}
