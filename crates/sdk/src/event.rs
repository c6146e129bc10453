//! Structured events delivered to the observer, and the delete/insert
//! reconciliation that turns raw deltas into logical row events.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use stdb_dyn_sats::AlgebraicValue;

use crate::row::{primary_key_of, Row};

/// The decoded changes to one table within a transaction, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChanges {
    pub table: Box<str>,
    pub deletes: Vec<Row>,
    pub inserts: Vec<Row>,
}

/// Returned by [`ClientObserver::on_transaction`](crate::ClientObserver::on_transaction)
/// to control whether per-row callbacks fire for that transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowEventDispatch {
    #[default]
    Dispatch,
    Suppress,
}

/// The caller-facing outcome of a reducer run. The transaction update
/// attached to a successful run is applied to the cache separately and is
/// not repeated here.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerOutcomeEvent {
    /// The reducer committed and returned a BSATN-encoded value.
    Ok { ret: Bytes },
    /// The reducer committed with nothing to report.
    OkEmpty,
    /// The reducer rejected the call with a BSATN-encoded error value.
    Err(Bytes),
    /// The call failed in the host.
    InternalError(Box<str>),
}

/// Rows returned by a one-off query, per table.
pub type QueryResultRows = Vec<(Box<str>, Vec<Row>)>;

/// A table delta reconciled into logical row events.
///
/// Dispatch order is `deletes`, then `updates`, then `inserts`.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Reconciled {
    pub deletes: Vec<Row>,
    pub updates: Vec<(Row, Row)>,
    pub inserts: Vec<Row>,
}

/// Pairs deletes with inserts sharing a primary key into updates.
///
/// Pairing is 1-1 by order of occurrence: the k-th delete with key K matches
/// the k-th still-unmatched insert with key K. Several deletes and inserts
/// sharing one key within a transaction is not expected, but pairing them by
/// order keeps the outcome deterministic. Rows without a usable key never
/// pair.
pub(crate) fn reconcile(deletes: &[Row], inserts: &[Row], key_columns: &[usize]) -> Reconciled {
    let mut inserts_by_key: HashMap<AlgebraicValue, VecDeque<usize>> = HashMap::new();
    for (idx, row) in inserts.iter().enumerate() {
        if let Some(key) = primary_key_of(row, key_columns) {
            inserts_by_key.entry(key).or_default().push_back(idx);
        }
    }

    let mut matched = vec![false; inserts.len()];
    let mut out = Reconciled::default();

    for row in deletes {
        let paired = primary_key_of(row, key_columns)
            .and_then(|key| inserts_by_key.get_mut(&key))
            .and_then(VecDeque::pop_front);
        match paired {
            Some(insert_idx) => {
                matched[insert_idx] = true;
                out.updates.push((row.clone(), inserts[insert_idx].clone()));
            }
            None => out.deletes.push(row.clone()),
        }
    }

    out.inserts = inserts
        .iter()
        .zip(&matched)
        .filter(|(_, matched)| !**matched)
        .map(|(row, _)| row.clone())
        .collect();

    out
}
