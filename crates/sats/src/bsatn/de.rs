use ethnum::{I256, U256};

use crate::algebraic_type::AlgebraicType;
use crate::algebraic_value::{AlgebraicValue, SumValue};
use crate::buffer::{BufReader, DecodeError};

/// Tag values for the option sum.
pub(crate) const OPTION_SOME_TAG: u8 = 0;
pub(crate) const OPTION_NONE_TAG: u8 = 1;

/// Decodes one value of type `ty` from the front of `r`.
///
/// On success the reader is left at the first unconsumed byte, so callers can
/// decode a product by calling this once per field.
pub fn decode_value<'de>(ty: &AlgebraicType, r: &mut impl BufReader<'de>) -> Result<AlgebraicValue, DecodeError> {
    Ok(match ty {
        AlgebraicType::Bool => match r.get_u8()? {
            0 => AlgebraicValue::Bool(false),
            1 => AlgebraicValue::Bool(true),
            b => return Err(DecodeError::InvalidBool(b)),
        },
        AlgebraicType::I8 => AlgebraicValue::I8(r.get_i8()?),
        AlgebraicType::U8 => AlgebraicValue::U8(r.get_u8()?),
        AlgebraicType::I16 => AlgebraicValue::I16(r.get_i16()?),
        AlgebraicType::U16 => AlgebraicValue::U16(r.get_u16()?),
        AlgebraicType::I32 => AlgebraicValue::I32(r.get_i32()?),
        AlgebraicType::U32 => AlgebraicValue::U32(r.get_u32()?),
        AlgebraicType::I64 => AlgebraicValue::I64(r.get_i64()?),
        AlgebraicType::U64 => AlgebraicValue::U64(r.get_u64()?),
        AlgebraicType::I128 => AlgebraicValue::I128(r.get_i128()?),
        AlgebraicType::U128 => AlgebraicValue::U128(r.get_u128()?),
        AlgebraicType::I256 => I256::from_le_bytes(r.get_array()?).into(),
        AlgebraicType::U256 => U256::from_le_bytes(r.get_array()?).into(),
        AlgebraicType::F32 => AlgebraicValue::F32(f32::from_le_bytes(r.get_array()?).into()),
        AlgebraicType::F64 => AlgebraicValue::F64(f64::from_le_bytes(r.get_array()?).into()),
        AlgebraicType::String => {
            let len = r.get_u32()?;
            let bytes = r.get_slice(len as usize)?;
            match core::str::from_utf8(bytes) {
                Ok(s) => AlgebraicValue::string(s),
                Err(_) => return Err(DecodeError::InvalidUtf8(len)),
            }
        }
        AlgebraicType::Bytes => {
            let len = r.get_u32()?;
            AlgebraicValue::bytes(r.get_slice(len as usize)?)
        }
        AlgebraicType::Array(elem) => {
            let count = r.get_u32()?;
            let mut elements = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                elements.push(decode_value(elem, r)?);
            }
            AlgebraicValue::array(elements)
        }
        AlgebraicType::Option(inner) => match r.get_u8()? {
            OPTION_SOME_TAG => AlgebraicValue::some(decode_value(inner, r)?),
            OPTION_NONE_TAG => AlgebraicValue::None,
            tag => return Err(DecodeError::InvalidOptionTag(tag)),
        },
        AlgebraicType::Product(p) => {
            let mut elements = Vec::with_capacity(p.elements.len());
            for elem in &p.elements {
                elements.push(decode_value(&elem.algebraic_type, r)?);
            }
            AlgebraicValue::product(elements)
        }
        AlgebraicType::Sum(s) => {
            let tag = r.get_u8()?;
            let variant = s
                .variants
                .get(tag as usize)
                .ok_or_else(|| DecodeError::unknown_tag(tag, "anonymous sum"))?;
            let value = match &variant.algebraic_type {
                Some(payload_ty) => Some(Box::new(decode_value(payload_ty, r)?)),
                None => None,
            };
            AlgebraicValue::Sum(SumValue { tag, value })
        }
        AlgebraicType::Ref(idx) => return Err(DecodeError::UnresolvedRef(*idx)),
    })
}
