use ethnum::{I256, U256};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::proptest;
use stdb_dyn_sats::bsatn::{decode_value, to_vec};
use stdb_dyn_sats::{
    AlgebraicType, AlgebraicValue, ProductTypeElement, SumTypeVariant, F32, F64,
};

/// A strategy over leaf (non-compound) types.
fn leaf_type() -> impl Strategy<Value = AlgebraicType> {
    proptest::sample::select(vec![
        AlgebraicType::Bool,
        AlgebraicType::I8,
        AlgebraicType::U8,
        AlgebraicType::I16,
        AlgebraicType::U16,
        AlgebraicType::I32,
        AlgebraicType::U32,
        AlgebraicType::I64,
        AlgebraicType::U64,
        AlgebraicType::I128,
        AlgebraicType::U128,
        AlgebraicType::I256,
        AlgebraicType::U256,
        AlgebraicType::F32,
        AlgebraicType::F64,
        AlgebraicType::String,
        AlgebraicType::Bytes,
    ])
}

/// A strategy over types up to `depth` levels of nesting.
fn algebraic_type(depth: u32) -> BoxedStrategy<AlgebraicType> {
    if depth == 0 {
        return leaf_type().boxed();
    }
    let inner = algebraic_type(depth - 1);
    prop_oneof![
        leaf_type().boxed(),
        inner.clone().prop_map(AlgebraicType::array),
        inner.clone().prop_map(AlgebraicType::option),
        vec(inner.clone(), 0..4)
            .prop_map(|tys| AlgebraicType::product(
                tys.into_iter()
                    .enumerate()
                    .map(|(i, ty)| ProductTypeElement::named(&format!("f{i}"), ty))
                    .collect::<Vec<_>>()
            )),
        vec(prop_oneof![inner.prop_map(Option::Some), Just(Option::None)], 1..4)
            .prop_map(|payloads| AlgebraicType::sum(
                payloads
                    .into_iter()
                    .enumerate()
                    .map(|(i, ty)| SumTypeVariant::new(Some(&format!("v{i}")), ty))
                    .collect::<Vec<_>>()
            )),
    ]
    .boxed()
}

fn i256_strategy() -> impl Strategy<Value = I256> {
    (any::<i128>(), any::<i128>()).prop_map(|(hi, lo)| I256::from_words(hi, lo))
}

fn u256_strategy() -> impl Strategy<Value = U256> {
    (any::<u128>(), any::<u128>()).prop_map(|(hi, lo)| U256::from_words(hi, lo))
}

/// A strategy over values inhabiting `ty`.
fn value_of(ty: &AlgebraicType) -> BoxedStrategy<AlgebraicValue> {
    match ty {
        AlgebraicType::Bool => any::<bool>().prop_map(Into::into).boxed(),
        AlgebraicType::I8 => any::<i8>().prop_map(Into::into).boxed(),
        AlgebraicType::U8 => any::<u8>().prop_map(Into::into).boxed(),
        AlgebraicType::I16 => any::<i16>().prop_map(Into::into).boxed(),
        AlgebraicType::U16 => any::<u16>().prop_map(Into::into).boxed(),
        AlgebraicType::I32 => any::<i32>().prop_map(Into::into).boxed(),
        AlgebraicType::U32 => any::<u32>().prop_map(Into::into).boxed(),
        AlgebraicType::I64 => any::<i64>().prop_map(Into::into).boxed(),
        AlgebraicType::U64 => any::<u64>().prop_map(Into::into).boxed(),
        AlgebraicType::I128 => any::<i128>().prop_map(Into::into).boxed(),
        AlgebraicType::U128 => any::<u128>().prop_map(Into::into).boxed(),
        AlgebraicType::I256 => i256_strategy().prop_map(Into::into).boxed(),
        AlgebraicType::U256 => u256_strategy().prop_map(Into::into).boxed(),
        AlgebraicType::F32 => any::<f32>().prop_map(|x| AlgebraicValue::F32(F32::from_inner(x))).boxed(),
        AlgebraicType::F64 => any::<f64>().prop_map(|x| AlgebraicValue::F64(F64::from_inner(x))).boxed(),
        AlgebraicType::String => ".*".prop_map(AlgebraicValue::from).boxed(),
        AlgebraicType::Bytes => vec(any::<u8>(), 0..32).prop_map(AlgebraicValue::bytes).boxed(),
        AlgebraicType::Array(elem) => vec(value_of(elem), 0..8).prop_map(AlgebraicValue::array).boxed(),
        AlgebraicType::Option(inner) => prop_oneof![
            value_of(inner).prop_map(AlgebraicValue::some),
            Just(AlgebraicValue::None),
        ]
        .boxed(),
        AlgebraicType::Product(p) => {
            let mut fields: BoxedStrategy<Vec<AlgebraicValue>> = Just(Vec::new()).boxed();
            for element in p.elements.iter() {
                let field = value_of(&element.algebraic_type);
                fields = (fields, field)
                    .prop_map(|(mut acc, v)| {
                        acc.push(v);
                        acc
                    })
                    .boxed();
            }
            fields.prop_map(AlgebraicValue::product).boxed()
        }
        AlgebraicType::Sum(s) => {
            let variants: Vec<_> = s
                .variants
                .iter()
                .enumerate()
                .map(|(tag, variant)| match &variant.algebraic_type {
                    Some(payload_ty) => value_of(payload_ty)
                        .prop_map(move |v| AlgebraicValue::sum(tag as u8, Some(v)))
                        .boxed(),
                    None => Just(AlgebraicValue::sum(tag as u8, None)).boxed(),
                })
                .collect();
            proptest::strategy::Union::new(variants).boxed()
        }
        AlgebraicType::Ref(_) => unreachable!("generated types contain no refs"),
    }
}

fn typed_values() -> impl Strategy<Value = (AlgebraicType, AlgebraicValue)> {
    algebraic_type(3).prop_flat_map(|ty| {
        let values = value_of(&ty);
        (Just(ty), values)
    })
}

fn round_trip(ty: &AlgebraicType, value: &AlgebraicValue) -> AlgebraicValue {
    let bytes = to_vec(value, ty).expect("value should encode against its own type");
    let mut r: &[u8] = &bytes;
    let decoded = decode_value(ty, &mut r).expect("encoded bytes should decode");
    assert_eq!(r.len(), 0, "decoder left unconsumed bytes");
    decoded
}

proptest! {
    #[test]
    fn round_trips_leaf_values((ty, value) in leaf_type().prop_flat_map(|ty| {
        let values = value_of(&ty);
        (Just(ty), values)
    })) {
        prop_assert_eq!(round_trip(&ty, &value), value);
    }

    #[test]
    fn round_trips_all_values((ty, value) in typed_values()) {
        prop_assert_eq!(round_trip(&ty, &value), value);
    }
}

#[test]
fn zero_sign_is_preserved() {
    let neg = AlgebraicValue::F64(F64::from_inner(-0.0));
    let bytes = to_vec(&neg, &AlgebraicType::F64).unwrap();
    assert_eq!(bytes, (-0.0f64).to_le_bytes());
    let mut r: &[u8] = &bytes;
    let decoded = decode_value(&AlgebraicType::F64, &mut r).unwrap();
    match decoded {
        AlgebraicValue::F64(x) => assert!(x.into_inner().is_sign_negative()),
        other => panic!("expected f64, got {other:?}"),
    }
}
