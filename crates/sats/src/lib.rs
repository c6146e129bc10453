//! Dynamic algebraic types and values, and the BSATN binary codec.
//!
//! Unlike a codegen-based SDK, nothing here is typed at compile time: rows and
//! reducer arguments are [`AlgebraicValue`]s, and every encode or decode is
//! directed by an [`AlgebraicType`] obtained from the database schema at
//! runtime.

pub mod algebraic_type;
pub mod algebraic_value;
pub mod bsatn;
pub mod buffer;

pub use algebraic_type::{AlgebraicType, ProductType, ProductTypeElement, SumType, SumTypeVariant};
pub use algebraic_value::{AlgebraicValue, ProductValue, SumValue, F32, F64};
pub use buffer::{BufReader, BufWriter, DecodeError};
