//! Row lists: the packed batches of row bytes carried by snapshots, deltas
//! and query results.

use bytes::Bytes;
use stdb_dyn_sats::{BufReader, DecodeError};
use thiserror::Error;

/// How the rows inside a [`BsatnRowList`] are delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSizeHint {
    /// Each row is exactly this many bytes.
    ///
    /// A stride of zero means the list is empty, whatever `rows_data` holds.
    FixedSize(u16),
    /// The start of each row in `rows_data`; the final row extends to the end
    /// of the buffer.
    RowOffsets(Box<[u64]>),
}

/// A batch of BSATN-encoded rows, each decodable against the owning table's
/// column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BsatnRowList {
    pub size_hint: RowSizeHint,
    pub rows_data: Bytes,
}

/// A structural fault in a row list.
///
/// These are the only hard errors at this layer; a row whose *contents* fail
/// to decode is still produced, with sentinel fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowListError {
    #[error("row offset {offset} out of range for row data of {len} bytes")]
    OffsetOutOfRange { offset: u64, len: usize },
    #[error("row offsets are not nondecreasing at index {0}")]
    UnsortedOffsets(usize),
}

impl BsatnRowList {
    pub fn fixed(stride: u16, rows_data: impl Into<Bytes>) -> Self {
        BsatnRowList {
            size_hint: RowSizeHint::FixedSize(stride),
            rows_data: rows_data.into(),
        }
    }

    pub fn with_offsets(offsets: impl Into<Box<[u64]>>, rows_data: impl Into<Bytes>) -> Self {
        BsatnRowList {
            size_hint: RowSizeHint::RowOffsets(offsets.into()),
            rows_data: rows_data.into(),
        }
    }

    pub fn empty() -> Self {
        Self::fixed(0, Bytes::new())
    }

    /// Splits the list into per-row buffers.
    ///
    /// In the fixed-size form a trailing partial record is produced as-is;
    /// its field decode will fail and sentinel out, which is preferable to
    /// silently discarding server bytes.
    pub fn rows(&self) -> Result<Vec<Bytes>, RowListError> {
        let data = &self.rows_data;
        match &self.size_hint {
            RowSizeHint::FixedSize(0) => Ok(Vec::new()),
            RowSizeHint::FixedSize(stride) => {
                let stride = *stride as usize;
                let mut out = Vec::with_capacity(data.len().div_ceil(stride));
                let mut start = 0;
                while start < data.len() {
                    let end = (start + stride).min(data.len());
                    out.push(data.slice(start..end));
                    start = end;
                }
                Ok(out)
            }
            RowSizeHint::RowOffsets(offsets) => {
                let len = data.len();
                let mut out = Vec::with_capacity(offsets.len());
                for (idx, window) in offsets.windows(2).enumerate() {
                    let (start, next) = (window[0], window[1]);
                    if next < start {
                        return Err(RowListError::UnsortedOffsets(idx + 1));
                    }
                    if next as usize > len {
                        return Err(RowListError::OffsetOutOfRange { offset: next, len });
                    }
                    if start as usize > len {
                        return Err(RowListError::OffsetOutOfRange { offset: start, len });
                    }
                    out.push(data.slice(start as usize..next as usize));
                }
                if let Some(&last) = offsets.last() {
                    if last as usize > len {
                        return Err(RowListError::OffsetOutOfRange { offset: last, len });
                    }
                    out.push(data.slice(last as usize..));
                }
                Ok(out)
            }
        }
    }

    pub(crate) fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let size_hint = match r.get_u8()? {
            0 => RowSizeHint::FixedSize(r.get_u16()?),
            1 => {
                let count = r.get_u32()?;
                let mut offsets = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    offsets.push(r.get_u64()?);
                }
                RowSizeHint::RowOffsets(offsets.into())
            }
            tag => return Err(DecodeError::unknown_tag(tag, "RowSizeHint")),
        };
        let len = r.get_u32()?;
        let rows_data = Bytes::copy_from_slice(r.get_slice(len as usize)?);
        Ok(BsatnRowList { size_hint, rows_data })
    }
}
