//! Rows as the cache and callbacks see them: column names mapped to decoded
//! values.

use stdb_dyn_client_messages::{BsatnRowList, RowListError};
use stdb_dyn_sats::bsatn::decode_value;
use stdb_dyn_sats::AlgebraicValue;

use crate::schema::Column;

/// One decoded table row: an ordered mapping from column name to value.
///
/// A field that failed to decode holds [`AlgebraicValue::DecodeError`]
/// instead of a value; the row itself is still usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    fields: Box<[(Box<str>, AlgebraicValue)]>,
}

impl Row {
    pub fn new(fields: impl Into<Box<[(Box<str>, AlgebraicValue)]>>) -> Self {
        Row { fields: fields.into() }
    }

    /// The value of the column called `name`.
    pub fn get(&self, name: &str) -> Option<&AlgebraicValue> {
        self.fields.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AlgebraicValue)> {
        self.fields.iter().map(|(n, v)| (&**n, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Did any field of this row fail to decode?
    pub fn has_decode_errors(&self) -> bool {
        self.fields.iter().any(|(_, v)| v.is_decode_error())
    }

    pub(crate) fn value_at(&self, idx: usize) -> Option<&AlgebraicValue> {
        self.fields.get(idx).map(|(_, v)| v)
    }
}

/// Decodes one record slice against `columns`.
///
/// A field-level decode failure never fails the row: the offending field and
/// every later field are filled with [`AlgebraicValue::DecodeError`] carrying
/// the original reason.
pub(crate) fn decode_row(bytes: &[u8], columns: &[Column]) -> Row {
    let r = &mut &bytes[..];
    let mut fields = Vec::with_capacity(columns.len());
    let mut failure: Option<Box<str>> = None;
    for column in columns {
        let value = match &failure {
            Some(reason) => AlgebraicValue::DecodeError(reason.clone()),
            None => match decode_value(&column.ty, r) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("failed to decode column `{}`: {e}", column.name);
                    let reason: Box<str> = e.to_string().into();
                    failure = Some(reason.clone());
                    AlgebraicValue::DecodeError(reason)
                }
            },
        };
        fields.push((column.name.clone(), value));
    }
    Row { fields: fields.into() }
}

/// Splits `list` into records and decodes each against `columns`.
///
/// The only error here is structural (bad offsets); content failures turn
/// into sentinel fields per [`decode_row`].
pub(crate) fn decode_row_list(list: &BsatnRowList, columns: &[Column]) -> Result<Vec<Row>, RowListError> {
    Ok(list.rows()?.iter().map(|record| decode_row(record, columns)).collect())
}

/// The cache key of `row` under `key_columns`: the single key column's value,
/// or an anonymous product of the key columns' values in definition order.
///
/// `None` if any key column is missing or failed to decode; such rows cannot
/// be cached.
pub(crate) fn primary_key_of(row: &Row, key_columns: &[usize]) -> Option<AlgebraicValue> {
    match key_columns {
        [] => None,
        [single] => row
            .value_at(*single)
            .filter(|v| !v.is_decode_error())
            .cloned(),
        composite => {
            let mut parts = Vec::with_capacity(composite.len());
            for &idx in composite {
                let value = row.value_at(idx).filter(|v| !v.is_decode_error())?;
                parts.push(value.clone());
            }
            Some(AlgebraicValue::product(parts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stdb_dyn_client_messages::BsatnRowList;
    use stdb_dyn_sats::AlgebraicType;

    fn person_columns() -> Vec<Column> {
        vec![
            Column {
                name: "id".into(),
                ty: AlgebraicType::U64,
            },
            Column {
                name: "name".into(),
                ty: AlgebraicType::String,
            },
            Column {
                name: "age".into(),
                ty: AlgebraicType::U32,
            },
        ]
    }

    fn person_bytes(id: u64, name: &str, age: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&age.to_le_bytes());
        out
    }

    #[test]
    fn decodes_a_row_by_column_order() {
        let row = decode_row(&person_bytes(1, "A", 30), &person_columns());
        assert_eq!(row.get("id"), Some(&1u64.into()));
        assert_eq!(row.get("name"), Some(&"A".into()));
        assert_eq!(row.get("age"), Some(&30u32.into()));
        assert!(!row.has_decode_errors());
    }

    #[test]
    fn field_failure_sentinels_the_rest_of_the_row() {
        // Valid id, then a string whose length runs past the buffer.
        let mut bytes = 7u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[255, 0, 0, 0]);
        let row = decode_row(&bytes, &person_columns());

        assert_eq!(row.get("id"), Some(&7u64.into()));
        assert!(row.get("name").unwrap().is_decode_error());
        assert!(row.get("age").unwrap().is_decode_error());
        assert!(row.has_decode_errors());
    }

    #[test]
    fn row_list_decode_is_structural_only() {
        let columns = person_columns();
        let mut data = person_bytes(1, "A", 30);
        let stride = data.len() as u16;
        data.extend_from_slice(&person_bytes(2, "B", 25));
        let list = BsatnRowList::fixed(stride, data);

        let rows = decode_row_list(&list, &columns).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("id"), Some(&2u64.into()));

        let bad = BsatnRowList::with_offsets(vec![0u64, 100], &[0u8; 8][..]);
        assert!(decode_row_list(&bad, &columns).is_err());
    }

    #[test]
    fn primary_keys_single_and_composite() {
        let row = decode_row(&person_bytes(1, "A", 30), &person_columns());
        assert_eq!(primary_key_of(&row, &[0]), Some(1u64.into()));
        assert_eq!(
            primary_key_of(&row, &[0, 2]),
            Some(AlgebraicValue::product(vec![1u64.into(), 30u32.into()]))
        );
        assert_eq!(primary_key_of(&row, &[]), None);
        assert_eq!(primary_key_of(&row, &[9]), None);
    }

    #[test]
    fn undecodable_key_column_yields_no_key() {
        let mut bytes = 7u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[255, 0, 0, 0]);
        let row = decode_row(&bytes, &person_columns());
        assert_eq!(primary_key_of(&row, &[1]), None);
        // The intact id column still keys fine.
        assert_eq!(primary_key_of(&row, &[0]), Some(7u64.into()));
    }
}
