//! The observer interface through which all server-driven activity reaches
//! the application.

use stdb_dyn_client_messages::websocket::{ProcedureStatus, Timestamp};
use stdb_dyn_client_messages::{ConnectionId, Identity};

use crate::event::{QueryResultRows, ReducerOutcomeEvent, RowEventDispatch, TableChanges};
use crate::row::Row;

/// Callbacks for everything the server pushes at the client.
///
/// Every method has a no-op default, so implementations override only what
/// they care about. Callbacks run on the SDK's dispatch task, after the cache
/// reflects the triggering message: reads from inside a callback observe the
/// post-transaction state.
#[allow(unused_variables)]
pub trait ClientObserver: Send + Sync + 'static {
    /// The connection negotiated; identity, connection id and token are
    /// known. Configured subscriptions are sent right after this fires.
    fn on_connect(&self, identity: &Identity, connection_id: &ConnectionId, token: &str) {}

    /// The connection dropped. `attempt` counts disconnects since the last
    /// healthy connection; a reconnect follows unless attempts are exhausted.
    fn on_disconnect(&self, reason: &str, attempt: u32) {}

    /// Reconnection attempts are exhausted; the client stays disconnected.
    fn on_connection_failed(&self) {}

    /// A subscription's initial rows arrived and were applied to the cache.
    /// Fires once per table in the snapshot.
    fn on_subscribe_applied(&self, table: &str, rows: &[Row]) {}

    /// An unsubscription completed; any dropped rows are already out of the
    /// cache.
    fn on_unsubscribe_applied(&self, query_set_id: u32) {}

    /// The server reported an error for a query set. With a `request_id`,
    /// this answers (and clears) a pending subscribe or unsubscribe.
    fn on_subscription_error(&self, request_id: Option<u32>, query_set_id: u32, error: &str) {}

    /// A transaction's changes were applied to the cache. Return
    /// [`RowEventDispatch::Suppress`] to skip the per-row callbacks for this
    /// transaction.
    fn on_transaction(&self, changes: &[TableChanges]) -> RowEventDispatch {
        RowEventDispatch::Dispatch
    }

    /// A row appeared that matches no deleted primary key.
    fn on_insert(&self, table: &str, row: &Row) {}

    /// A row vanished that matches no inserted primary key.
    fn on_delete(&self, table: &str, row: &Row) {}

    /// A delete and an insert shared a primary key: the row changed in
    /// place.
    fn on_update(&self, table: &str, old: &Row, new: &Row) {}

    /// A reducer call completed. Any attached transaction update has already
    /// been applied (and dispatched) as usual.
    fn on_reducer_result(&self, request_id: u32, timestamp: Timestamp, outcome: &ReducerOutcomeEvent) {}

    /// A procedure call completed.
    fn on_procedure_result(&self, request_id: u32, timestamp: Timestamp, status: &ProcedureStatus) {}

    /// A one-off query completed.
    fn on_query_result(&self, request_id: u32, result: &Result<QueryResultRows, Box<str>>) {}
}

/// An observer that ignores everything. Useful for write-only clients and
/// tests.
pub struct NoopObserver;

impl ClientObserver for NoopObserver {}
