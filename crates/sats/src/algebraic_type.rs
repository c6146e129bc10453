//! The type half of the algebraic type system.
//!
//! A schema describes every table column and reducer parameter as a tree of
//! [`AlgebraicType`]s. Types referencing the typespace ([`AlgebraicType::Ref`])
//! only occur while a schema document is being parsed; resolution inlines them,
//! so the codec never sees one.

/// A type in the algebraic type system.
///
/// The value counterpart is
/// [`AlgebraicValue`](crate::algebraic_value::AlgebraicValue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgebraicType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    I128,
    U128,
    I256,
    U256,
    F32,
    F64,
    /// UTF-8 string, length-prefixed on the wire.
    String,
    /// Opaque byte blob, length-prefixed on the wire.
    Bytes,
    /// Homogeneous array of the element type.
    Array(Box<AlgebraicType>),
    /// Optional value, encoded as a sum with tag 0 = some, tag 1 = none.
    Option(Box<AlgebraicType>),
    /// Ordered record of (optionally named) fields.
    Product(ProductType),
    /// Tagged union.
    Sum(SumType),
    /// Reference into a schema typespace. Never survives schema resolution.
    Ref(u32),
}

/// A product type: an ordered list of elements.
///
/// The wire form of a product value is the concatenation of its field
/// encodings, with no framing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProductType {
    pub elements: Box<[ProductTypeElement]>,
}

/// A single element of a [`ProductType`].
///
/// Element names are optional at the wire level but present for products used
/// as table rows or reducer parameter lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductTypeElement {
    pub name: Option<Box<str>>,
    pub algebraic_type: AlgebraicType,
}

/// A sum type: a tagged union of variants.
///
/// The wire form is a `u8` tag followed by the chosen variant's payload
/// encoding; payloadless variants contribute no payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumType {
    pub variants: Box<[SumTypeVariant]>,
}

/// A single variant of a [`SumType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumTypeVariant {
    pub name: Option<Box<str>>,
    /// `None` for payloadless variants.
    pub algebraic_type: Option<AlgebraicType>,
}

impl AlgebraicType {
    pub fn array(elem: AlgebraicType) -> Self {
        AlgebraicType::Array(Box::new(elem))
    }

    pub fn option(inner: AlgebraicType) -> Self {
        AlgebraicType::Option(Box::new(inner))
    }

    pub fn product<E: Into<Box<[ProductTypeElement]>>>(elements: E) -> Self {
        AlgebraicType::Product(ProductType {
            elements: elements.into(),
        })
    }

    pub fn sum<V: Into<Box<[SumTypeVariant]>>>(variants: V) -> Self {
        AlgebraicType::Sum(SumType {
            variants: variants.into(),
        })
    }

    /// Does any `Ref` occur anywhere in this type tree?
    ///
    /// After schema resolution this must answer `false` for every type
    /// reachable from a table column or reducer parameter.
    pub fn contains_ref(&self) -> bool {
        match self {
            AlgebraicType::Ref(_) => true,
            AlgebraicType::Array(elem) | AlgebraicType::Option(elem) => elem.contains_ref(),
            AlgebraicType::Product(p) => p.elements.iter().any(|e| e.algebraic_type.contains_ref()),
            AlgebraicType::Sum(s) => s
                .variants
                .iter()
                .any(|v| v.algebraic_type.as_ref().is_some_and(|t| t.contains_ref())),
            _ => false,
        }
    }

    /// A short name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AlgebraicType::Bool => "bool",
            AlgebraicType::I8 => "i8",
            AlgebraicType::U8 => "u8",
            AlgebraicType::I16 => "i16",
            AlgebraicType::U16 => "u16",
            AlgebraicType::I32 => "i32",
            AlgebraicType::U32 => "u32",
            AlgebraicType::I64 => "i64",
            AlgebraicType::U64 => "u64",
            AlgebraicType::I128 => "i128",
            AlgebraicType::U128 => "u128",
            AlgebraicType::I256 => "i256",
            AlgebraicType::U256 => "u256",
            AlgebraicType::F32 => "f32",
            AlgebraicType::F64 => "f64",
            AlgebraicType::String => "string",
            AlgebraicType::Bytes => "bytes",
            AlgebraicType::Array(_) => "array",
            AlgebraicType::Option(_) => "option",
            AlgebraicType::Product(_) => "product",
            AlgebraicType::Sum(_) => "sum",
            AlgebraicType::Ref(_) => "ref",
        }
    }
}

impl ProductTypeElement {
    pub fn new(name: Option<&str>, algebraic_type: AlgebraicType) -> Self {
        ProductTypeElement {
            name: name.map(Into::into),
            algebraic_type,
        }
    }

    pub fn named(name: &str, algebraic_type: AlgebraicType) -> Self {
        Self::new(Some(name), algebraic_type)
    }
}

impl SumTypeVariant {
    pub fn new(name: Option<&str>, algebraic_type: Option<AlgebraicType>) -> Self {
        SumTypeVariant {
            name: name.map(Into::into),
            algebraic_type,
        }
    }

    pub fn named(name: &str, algebraic_type: AlgebraicType) -> Self {
        Self::new(Some(name), Some(algebraic_type))
    }

    pub fn unit(name: &str) -> Self {
        Self::new(Some(name), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_detection_reaches_through_compounds() {
        let ty = AlgebraicType::product(vec![ProductTypeElement::named(
            "xs",
            AlgebraicType::array(AlgebraicType::option(AlgebraicType::Ref(3))),
        )]);
        assert!(ty.contains_ref());

        let ty = AlgebraicType::sum(vec![
            SumTypeVariant::unit("none_like"),
            SumTypeVariant::named("payload", AlgebraicType::U32),
        ]);
        assert!(!ty.contains_ref());
    }
}
