//! BSATN, the binary encoding for algebraic values.
//!
//! All integers are little-endian; all lengths and counts are `u32`. Products
//! are unframed field concatenations, sums are a `u8` tag followed by the
//! chosen variant's payload, and options are the sum with tag 0 = some and
//! tag 1 = none.

mod de;
mod ser;

pub use de::decode_value;
pub use ser::{encode_product_from_map, encode_value, to_vec, EncodeError};
