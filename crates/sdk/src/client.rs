//! The client façade: configuration, startup, the dispatch of server events
//! into the cache and observer callbacks, and every caller-facing operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use futures_channel::mpsc;
use tokio::runtime::{self, Builder, Runtime};
use tokio::sync::watch;

use stdb_dyn_client_messages::websocket::{
    CallProcedure, CallReducer, OneOffQuery, QueryRows, ReducerOutcome, Subscribe, TableUpdateRows,
    TransactionUpdate, Unsubscribe, UNSUBSCRIBE_FLAG_SEND_DROPPED_ROWS,
};
use stdb_dyn_client_messages::{ClientMessage, Compression, ConnectionId, Identity, ServerMessage};
use stdb_dyn_sats::{bsatn, AlgebraicValue};

use crate::cache::ClientCache;
use crate::callbacks::ClientObserver;
use crate::connection::{
    ConnEvent, ConnectionState, EventReceiver, EventSender, ReconnectPolicy, RequestDescriptor,
    OUTGOING_QUEUE_DEPTH,
};
use crate::error::ClientError;
use crate::event::{reconcile, QueryResultRows, ReducerOutcomeEvent, RowEventDispatch, TableChanges};
use crate::row::{decode_row_list, Row};
use crate::schema::{fetch_schema, Schema, SchemaError};
use crate::websocket::{LoopExit, WsConnection};

/// Everything needed to reach one database.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host authority, e.g. `localhost:3000`.
    pub host: String,
    /// The database name or identity to connect to.
    pub database: String,
    /// A token from a previous session. Without one the server mints fresh
    /// credentials, delivered through `on_connect`.
    pub token: Option<String>,
    pub tls: bool,
    /// The compression the server is asked to apply to its frames.
    pub compression: Compression,
    /// Queries subscribed automatically once the connection is negotiated.
    pub subscriptions: Vec<String>,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn builder(host: impl Into<String>, database: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: ClientConfig {
                host: host.into(),
                database: database.into(),
                token: None,
                tls: false,
                compression: Compression::default(),
                subscriptions: Vec::new(),
                reconnect: ReconnectPolicy::default(),
            },
        }
    }

    pub(crate) fn http_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }
}

pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn with_subscriptions<S: Into<String>>(mut self, queries: impl IntoIterator<Item = S>) -> Self {
        self.config.subscriptions = queries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// A handle to a running client. Share it behind an `Arc` if multiple owners
/// need it; all operations take `&self`.
pub struct DbClient {
    inner: Arc<Inner>,
    // `Some` if not within the context of an outer runtime. The `Runtime`
    // must then live as long as `Self`.
    #[allow(unused)]
    runtime: Option<Runtime>,
}

pub(crate) struct Inner {
    config: ClientConfig,
    schema: Schema,
    cache: Mutex<ClientCache>,
    state: Mutex<ConnectionState>,
    /// The live connection's outgoing queue; `None` while disconnected.
    sender: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    observer: Arc<dyn ClientObserver>,
    shutdown: watch::Sender<bool>,
}

// When called from within an async context, return a handle to it (and no
// `Runtime`), otherwise create a fresh `Runtime` and return it along with a
// handle to it.
fn enter_or_create_runtime() -> Result<(Option<Runtime>, runtime::Handle), ClientError> {
    match runtime::Handle::try_current() {
        Err(e) if e.is_missing_context() => {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("stdb-dyn-connection")
                .build()
                .map_err(|e| ClientError::BadConfig(format!("failed to build a runtime: {e}")))?;
            let handle = rt.handle().clone();
            Ok((Some(rt), handle))
        }
        Ok(handle) => Ok((None, handle)),
        Err(e) => Err(ClientError::BadConfig(format!("broken runtime context: {e}"))),
    }
}

impl DbClient {
    /// Fetches the schema, starts the connection, and returns a handle.
    ///
    /// Subscriptions named in the config are sent as soon as the server
    /// acknowledges the connection; reconnects re-send them the same way.
    pub fn start(config: ClientConfig, observer: Arc<dyn ClientObserver>) -> Result<DbClient, ClientError> {
        let (runtime, handle) = enter_or_create_runtime()?;
        let schema = tokio::task::block_in_place(|| {
            handle.block_on(fetch_schema(&config.http_base(), &config.database))
        })?;

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            schema,
            cache: Mutex::new(ClientCache::new()),
            state: Mutex::new(ConnectionState::default()),
            sender: Mutex::new(None),
            observer,
            shutdown,
        });

        let (events_tx, events_rx) = mpsc::unbounded();
        handle.spawn(run_connection(inner.clone(), events_tx));
        handle.spawn(receiver_loop(inner.clone(), events_rx));

        Ok(DbClient { inner, runtime })
    }

    /// The parsed schema this client is speaking against.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Encodes `args` against the reducer's parameter schema and requests a
    /// run. Fails without touching the socket if the reducer is unknown or
    /// the arguments don't encode.
    pub fn call_reducer(&self, name: &str, args: &HashMap<String, AlgebraicValue>) -> Result<u32, ClientError> {
        self.inner.call_reducer(name, args)
    }

    /// Requests a reducer run with already-encoded BSATN arguments.
    pub fn call_reducer_raw(&self, name: &str, args: impl Into<Bytes>) -> Result<u32, ClientError> {
        self.inner.call_reducer_raw(name, args.into())
    }

    /// Requests a procedure run with already-encoded BSATN arguments.
    pub fn call_procedure_raw(&self, name: &str, args: impl Into<Bytes>) -> Result<u32, ClientError> {
        self.inner.call_procedure_raw(name, args.into())
    }

    /// Subscribes to `queries` as a new query set and returns its id.
    pub fn subscribe(&self, queries: &[&str]) -> Result<u32, ClientError> {
        self.inner.subscribe(queries)
    }

    /// Tears down a query set. With `send_dropped_rows`, the server's
    /// acknowledgement carries the rows this client thereby loses, which are
    /// removed from the cache and surfaced as deletes.
    pub fn unsubscribe(&self, query_set_id: u32, send_dropped_rows: bool) -> Result<u32, ClientError> {
        self.inner.unsubscribe(query_set_id, send_dropped_rows)
    }

    /// Runs a one-off SQL query; the result arrives via `on_query_result`.
    pub fn one_off_query(&self, query: &str) -> Result<u32, ClientError> {
        self.inner.one_off_query(query)
    }

    /// All cached rows of `table`, as of now.
    pub fn get_all(&self, table: &str) -> Vec<Row> {
        self.inner.cache.lock().expect("ClientCache Mutex is poisoned").get_all(table)
    }

    /// The cached row of `table` under the primary-key value `key`.
    pub fn find(&self, table: &str, key: &AlgebraicValue) -> Option<Row> {
        self.inner.cache.lock().expect("ClientCache Mutex is poisoned").find(table, key)
    }

    /// The number of cached rows of `table`.
    pub fn count(&self, table: &str) -> u64 {
        self.inner.cache.lock().expect("ClientCache Mutex is poisoned").count(table)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().expect("ConnectionState Mutex is poisoned").identity
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.state.lock().expect("ConnectionState Mutex is poisoned").connection_id
    }

    /// The most recently negotiated token, for the caller to persist.
    pub fn token(&self) -> Option<String> {
        self.inner.state.lock().expect("ConnectionState Mutex is poisoned").token.clone()
    }

    pub fn connected(&self) -> bool {
        self.inner.state.lock().expect("ConnectionState Mutex is poisoned").connected
    }

    /// Shuts the client down: the socket closes, pending requests abort, and
    /// no reconnect is attempted.
    pub fn disconnect(self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl Inner {
    fn send_message(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let mut sender = self
            .sender
            .lock()
            .expect("Sender Mutex is poisoned")
            .clone()
            .ok_or(ClientError::NotConnected)?;
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(e) if e.is_full() => {
                // The queue is full: block the caller until the socket
                // drains rather than buffer without bound.
                let msg = e.into_inner();
                futures::executor::block_on(sender.send(msg)).map_err(|_| ClientError::Disconnected)
            }
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    fn send_request(&self, msg: ClientMessage, request_id: u32) -> Result<(), ClientError> {
        self.send_message(msg).inspect_err(|_| {
            self.state.lock().expect("ConnectionState Mutex is poisoned").pending.remove(&request_id);
        })
    }

    fn subscribe(&self, queries: &[&str]) -> Result<u32, ClientError> {
        let query_strings: Box<[Box<str>]> = queries.iter().map(|&q| q.into()).collect();
        let (request_id, query_set_id) = {
            let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
            let request_id = state.next_request_id();
            let query_set_id = state.next_query_set_id();
            state.pending.insert(
                request_id,
                RequestDescriptor::Subscribe {
                    query_set_id,
                    queries: query_strings.clone(),
                },
            );
            (request_id, query_set_id)
        };
        self.send_request(
            ClientMessage::Subscribe(Subscribe {
                request_id,
                query_set_id,
                query_strings,
            }),
            request_id,
        )?;
        Ok(query_set_id)
    }

    fn unsubscribe(&self, query_set_id: u32, send_dropped_rows: bool) -> Result<u32, ClientError> {
        let request_id = {
            let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
            let request_id = state.next_request_id();
            state
                .pending
                .insert(request_id, RequestDescriptor::Unsubscribe { query_set_id });
            request_id
        };
        self.send_request(
            ClientMessage::Unsubscribe(Unsubscribe {
                request_id,
                query_set_id,
                flags: if send_dropped_rows {
                    UNSUBSCRIBE_FLAG_SEND_DROPPED_ROWS
                } else {
                    0
                },
            }),
            request_id,
        )?;
        Ok(request_id)
    }

    fn one_off_query(&self, query: &str) -> Result<u32, ClientError> {
        let request_id = {
            let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
            let request_id = state.next_request_id();
            state
                .pending
                .insert(request_id, RequestDescriptor::OneOffQuery { query: query.into() });
            request_id
        };
        self.send_request(
            ClientMessage::OneOffQuery(OneOffQuery {
                request_id,
                query_string: query.into(),
            }),
            request_id,
        )?;
        Ok(request_id)
    }

    fn call_reducer(&self, name: &str, args: &HashMap<String, AlgebraicValue>) -> Result<u32, ClientError> {
        let reducer = self
            .schema
            .reducer(name)
            .ok_or_else(|| SchemaError::UnknownReducer(name.into()))?;
        let mut bytes = Vec::new();
        let params = reducer.params.iter().map(|p| (&*p.name, &p.ty));
        bsatn::encode_product_from_map(args, params, &mut bytes)?;
        self.call_reducer_raw(name, bytes.into())
    }

    fn call_reducer_raw(&self, name: &str, args: Bytes) -> Result<u32, ClientError> {
        let request_id = {
            let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
            let request_id = state.next_request_id();
            state
                .pending
                .insert(request_id, RequestDescriptor::CallReducer { reducer: name.into() });
            request_id
        };
        self.send_request(
            ClientMessage::CallReducer(CallReducer {
                request_id,
                flags: 0,
                reducer: name.into(),
                args,
            }),
            request_id,
        )?;
        Ok(request_id)
    }

    fn call_procedure_raw(&self, name: &str, args: Bytes) -> Result<u32, ClientError> {
        let request_id = {
            let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
            let request_id = state.next_request_id();
            state
                .pending
                .insert(request_id, RequestDescriptor::CallProcedure { procedure: name.into() });
            request_id
        };
        self.send_request(
            ClientMessage::CallProcedure(CallProcedure {
                request_id,
                flags: 0,
                procedure: name.into(),
                args,
            }),
            request_id,
        )?;
        Ok(request_id)
    }

    /// Applies one server message to local state and fans out callbacks.
    ///
    /// The cache is fully updated before any callback fires, so reads from
    /// inside a callback observe the post-message state.
    fn handle_server_message(&self, msg: ServerMessage) {
        if let Some(descriptor) = self.state.lock().expect("ConnectionState Mutex is poisoned").take_pending(&msg) {
            log::debug!("response for in-flight request: {descriptor:?}");
        }

        match msg {
            ServerMessage::InitialConnection(m) => {
                {
                    let mut state = self.state.lock().expect("ConnectionState Mutex is poisoned");
                    state.identity = Some(m.identity);
                    state.connection_id = Some(m.connection_id);
                    state.token = Some(m.token.to_string());
                    state.connected = true;
                }
                self.observer.on_connect(&m.identity, &m.connection_id, &m.token);
                if !self.config.subscriptions.is_empty() {
                    let queries: Vec<&str> = self.config.subscriptions.iter().map(|s| s.as_str()).collect();
                    if let Err(e) = self.subscribe(&queries) {
                        log::warn!("failed to send configured subscriptions: {e}");
                    }
                }
            }

            ServerMessage::SubscribeApplied(m) => self.apply_snapshot(m.rows),

            ServerMessage::UnsubscribeApplied(m) => {
                if let Some(rows) = m.rows {
                    self.remove_dropped_rows(rows);
                }
                self.observer.on_unsubscribe_applied(m.query_set_id);
            }

            ServerMessage::SubscriptionError(m) => {
                self.observer
                    .on_subscription_error(m.request_id, m.query_set_id, &m.error);
            }

            ServerMessage::TransactionUpdate(tx) => self.apply_transaction(&tx),

            ServerMessage::OneOffQueryResult(m) => {
                let result: Result<QueryResultRows, Box<str>> = match m.result {
                    Ok(rows) => {
                        let Some(decoded) = self.decode_query_rows(&rows) else {
                            log::warn!("dropping one-off query result {} with bad row list", m.request_id);
                            return;
                        };
                        Ok(decoded)
                    }
                    Err(error) => Err(error),
                };
                self.observer.on_query_result(m.request_id, &result);
            }

            ServerMessage::ReducerResult(m) => {
                let outcome = match m.outcome {
                    ReducerOutcome::Ok { ret, tx } => {
                        self.apply_transaction(&tx);
                        ReducerOutcomeEvent::Ok { ret }
                    }
                    ReducerOutcome::OkEmpty => ReducerOutcomeEvent::OkEmpty,
                    ReducerOutcome::Err(e) => ReducerOutcomeEvent::Err(e),
                    ReducerOutcome::InternalError(e) => ReducerOutcomeEvent::InternalError(e),
                };
                self.observer.on_reducer_result(m.request_id, m.timestamp, &outcome);
            }

            ServerMessage::ProcedureResult(m) => {
                self.observer.on_procedure_result(m.request_id, m.timestamp, &m.status);
            }
        }
    }

    /// Decodes every table of `rows` against the schema. `None` if any row
    /// list is structurally broken, in which case the whole message is
    /// dropped by the caller. Unknown tables are skipped with a log.
    fn decode_query_rows(&self, rows: &QueryRows) -> Option<QueryResultRows> {
        let mut decoded = Vec::with_capacity(rows.tables.len());
        for table_rows in rows.tables.iter() {
            let Some(def) = self.schema.table(&table_rows.table) else {
                log::warn!("skipping rows for unknown table `{}`", table_rows.table);
                continue;
            };
            match decode_row_list(&table_rows.rows, &def.columns) {
                Ok(rows) => decoded.push((table_rows.table.clone(), rows)),
                Err(e) => {
                    log::warn!("bad row list for table `{}`: {e}", table_rows.table);
                    return None;
                }
            }
        }
        Some(decoded)
    }

    fn apply_snapshot(&self, rows: QueryRows) {
        let Some(decoded) = self.decode_query_rows(&rows) else {
            log::warn!("dropping subscription snapshot with bad row list");
            return;
        };

        {
            let mut cache = self.cache.lock().expect("ClientCache Mutex is poisoned");
            for (table, rows) in &decoded {
                let def = self.schema.table(table).expect("decoded tables are known");
                cache.apply_inserts(table, def.key_columns(), rows);
            }
        }

        for (table, rows) in &decoded {
            self.observer.on_subscribe_applied(table, rows);
        }
    }

    fn remove_dropped_rows(&self, rows: QueryRows) {
        let Some(decoded) = self.decode_query_rows(&rows) else {
            log::warn!("dropping unsubscribe row set with bad row list");
            return;
        };

        {
            let mut cache = self.cache.lock().expect("ClientCache Mutex is poisoned");
            for (table, rows) in &decoded {
                let def = self.schema.table(table).expect("decoded tables are known");
                cache.remove_rows(table, def.key_columns(), rows);
            }
        }

        for (table, rows) in &decoded {
            for row in rows {
                self.observer.on_delete(table, row);
            }
        }
    }

    /// Applies a transaction to the cache, then dispatches the transaction
    /// event and (unless suppressed) the reconciled row events.
    fn apply_transaction(&self, tx: &TransactionUpdate) {
        let mut changes: Vec<TableChanges> = Vec::new();
        for query_set in tx.query_sets.iter() {
            for table_update in query_set.tables.iter() {
                let Some(def) = self.schema.table(&table_update.table_name) else {
                    log::warn!("skipping update for unknown table `{}`", table_update.table_name);
                    continue;
                };
                for rows in table_update.rows.iter() {
                    match rows {
                        TableUpdateRows::Persistent(persistent) => {
                            let deletes = decode_row_list(&persistent.deletes, &def.columns);
                            let inserts = decode_row_list(&persistent.inserts, &def.columns);
                            match (deletes, inserts) {
                                (Ok(deletes), Ok(inserts)) => changes.push(TableChanges {
                                    table: table_update.table_name.clone(),
                                    deletes,
                                    inserts,
                                }),
                                (Err(e), _) | (_, Err(e)) => {
                                    log::warn!("dropping transaction update with bad row list: {e}");
                                    return;
                                }
                            }
                        }
                        // Event-table rows are never resident in the mirror.
                        TableUpdateRows::Event(_) => {}
                    }
                }
            }
        }

        {
            let mut cache = self.cache.lock().expect("ClientCache Mutex is poisoned");
            for change in &changes {
                let def = self.schema.table(&change.table).expect("decoded tables are known");
                cache.apply_delta(&change.table, def.key_columns(), &change.deletes, &change.inserts);
            }
        }

        if matches!(self.observer.on_transaction(&changes), RowEventDispatch::Suppress) {
            return;
        }

        for change in &changes {
            let def = self.schema.table(&change.table).expect("decoded tables are known");
            let reconciled = reconcile(&change.deletes, &change.inserts, def.key_columns());
            for row in &reconciled.deletes {
                self.observer.on_delete(&change.table, row);
            }
            for (old, new) in &reconciled.updates {
                self.observer.on_update(&change.table, old, new);
            }
            for row in &reconciled.inserts {
                self.observer.on_insert(&change.table, row);
            }
        }
    }
}

/// The reconnect loop: owns the socket for each connection in turn.
async fn run_connection(inner: Arc<Inner>, events: EventSender) {
    let policy = inner.config.reconnect;
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let token = inner
            .state
            .lock()
            .expect("ConnectionState Mutex is poisoned")
            .token
            .clone()
            .or_else(|| inner.config.token.clone());

        match WsConnection::connect(&inner.config, token.as_deref()).await {
            Ok(conn) => {
                attempt = 0;
                let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
                inner.state.lock().expect("ConnectionState Mutex is poisoned").reset();
                *inner.sender.lock().expect("Sender Mutex is poisoned") = Some(out_tx);

                let exit = conn.message_loop(&events, out_rx, &mut shutdown).await;

                *inner.sender.lock().expect("Sender Mutex is poisoned") = None;
                let dropped = {
                    let mut state = inner.state.lock().expect("ConnectionState Mutex is poisoned");
                    state.connected = false;
                    state.drain_pending()
                };
                for (request_id, descriptor) in dropped {
                    log::warn!("request {request_id} aborted by disconnect: {descriptor:?}");
                }

                match exit {
                    LoopExit::Shutdown => {
                        let _ = events.unbounded_send(ConnEvent::Disconnected {
                            reason: "client disconnect".into(),
                            attempt: 0,
                        });
                        break;
                    }
                    LoopExit::Closed(reason) => {
                        attempt += 1;
                        let _ = events.unbounded_send(ConnEvent::Disconnected { reason, attempt });
                    }
                }
            }
            Err(e) => {
                attempt += 1;
                let _ = events.unbounded_send(ConnEvent::Disconnected {
                    reason: e.to_string().into(),
                    attempt,
                });
            }
        }

        if attempt >= policy.max_attempts {
            let _ = events.unbounded_send(ConnEvent::ConnectionFailed);
            break;
        }

        let backoff = policy.backoff_for(attempt);
        log::info!("reconnecting in {backoff:?} (attempt {attempt}/{})", policy.max_attempts);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Consumes connection events in order and hands them to the façade.
async fn receiver_loop(inner: Arc<Inner>, mut events: EventReceiver) {
    while let Some(event) = events.next().await {
        match event {
            ConnEvent::Message(msg) => inner.handle_server_message(*msg),
            ConnEvent::Disconnected { reason, attempt } => inner.observer.on_disconnect(&reason, attempt),
            ConnEvent::ConnectionFailed => inner.observer.on_connection_failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::ClientObserver;
    use crate::schema::{Column, ReducerDef, Schema, TableDef};
    use stdb_dyn_client_messages::row_list::BsatnRowList;
    use stdb_dyn_client_messages::websocket::{
        PersistentTableRows, QuerySetUpdate, ReducerResult, SingleTableRows, SubscribeApplied,
        SubscriptionError, TableUpdate, Timestamp,
    };
    use stdb_dyn_sats::AlgebraicType;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Connect(String),
        SubscribeApplied(String, usize),
        Transaction(Vec<String>),
        Insert(String, u64),
        Delete(String, u64),
        Update(String, u64, u64, u64),
        ReducerResult(u32),
        SubscriptionError(Option<u32>, u32, String),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Recorded>>,
        suppress_rows: bool,
    }

    impl Recorder {
        fn suppressing() -> Self {
            Recorder {
                suppress_rows: true,
                ..Default::default()
            }
        }

        fn take(&self) -> Vec<Recorded> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: Recorded) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn id_of(row: &Row) -> u64 {
        row.get("id").and_then(|v| v.as_u64()).unwrap()
    }

    fn age_of(row: &Row) -> u64 {
        match row.get("age") {
            Some(AlgebraicValue::U32(age)) => *age as u64,
            other => panic!("bad age {other:?}"),
        }
    }

    impl ClientObserver for Recorder {
        fn on_connect(&self, _identity: &Identity, _connection_id: &ConnectionId, token: &str) {
            self.push(Recorded::Connect(token.to_string()));
        }

        fn on_subscribe_applied(&self, table: &str, rows: &[Row]) {
            self.push(Recorded::SubscribeApplied(table.to_string(), rows.len()));
        }

        fn on_transaction(&self, changes: &[TableChanges]) -> RowEventDispatch {
            self.push(Recorded::Transaction(
                changes.iter().map(|c| c.table.to_string()).collect(),
            ));
            if self.suppress_rows {
                RowEventDispatch::Suppress
            } else {
                RowEventDispatch::Dispatch
            }
        }

        fn on_insert(&self, table: &str, row: &Row) {
            self.push(Recorded::Insert(table.to_string(), id_of(row)));
        }

        fn on_delete(&self, table: &str, row: &Row) {
            self.push(Recorded::Delete(table.to_string(), id_of(row)));
        }

        fn on_update(&self, table: &str, old: &Row, new: &Row) {
            self.push(Recorded::Update(table.to_string(), id_of(old), age_of(old), age_of(new)));
        }

        fn on_reducer_result(&self, request_id: u32, _timestamp: Timestamp, _outcome: &ReducerOutcomeEvent) {
            self.push(Recorded::ReducerResult(request_id));
        }

        fn on_subscription_error(&self, request_id: Option<u32>, query_set_id: u32, error: &str) {
            self.push(Recorded::SubscriptionError(request_id, query_set_id, error.to_string()));
        }
    }

    fn person_schema() -> Schema {
        Schema::from_defs(
            [TableDef {
                name: "person".into(),
                columns: vec![
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
                .into(),
                primary_key: vec![0].into(),
            }],
            [ReducerDef {
                name: "set_age".into(),
                params: vec![
                    Column {
                        name: "id".into(),
                        ty: AlgebraicType::U64,
                    },
                    Column {
                        name: "age".into(),
                        ty: AlgebraicType::U32,
                    },
                ]
                .into(),
            }],
        )
    }

    fn test_inner(observer: Arc<Recorder>) -> Arc<Inner> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Inner {
            config: ClientConfig::builder("localhost:3000", "testdb").build(),
            schema: person_schema(),
            cache: Mutex::new(ClientCache::new()),
            state: Mutex::new(ConnectionState::default()),
            sender: Mutex::new(None),
            observer,
            shutdown,
        })
    }

    fn person_bytes(id: u64, name: &str, age: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&age.to_le_bytes());
        out
    }

    fn row_list(rows: &[Vec<u8>]) -> BsatnRowList {
        let mut offsets = Vec::with_capacity(rows.len());
        let mut data = Vec::new();
        for row in rows {
            offsets.push(data.len() as u64);
            data.extend_from_slice(row);
        }
        BsatnRowList::with_offsets(offsets, data)
    }

    fn person_tx(deletes: &[Vec<u8>], inserts: &[Vec<u8>]) -> TransactionUpdate {
        TransactionUpdate {
            query_sets: vec![QuerySetUpdate {
                query_set_id: 1,
                tables: vec![TableUpdate {
                    table_name: "person".into(),
                    rows: vec![TableUpdateRows::Persistent(PersistentTableRows {
                        inserts: row_list(inserts),
                        deletes: row_list(deletes),
                    })]
                    .into(),
                }]
                .into(),
            }]
            .into(),
        }
    }

    #[test]
    fn snapshot_feeds_cache_then_fires_callback() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::SubscribeApplied(SubscribeApplied {
            request_id: 1,
            query_set_id: 1,
            rows: QueryRows {
                tables: vec![SingleTableRows {
                    table: "person".into(),
                    rows: row_list(&[person_bytes(1, "A", 30), person_bytes(2, "B", 25)]),
                }]
                .into(),
            },
        }));

        assert_eq!(observer.take(), vec![Recorded::SubscribeApplied("person".into(), 2)]);
        assert_eq!(inner.cache.lock().unwrap().count("person"), 2);
    }

    #[test]
    fn pk_matched_delete_insert_pair_is_one_update() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::TransactionUpdate(person_tx(
            &[person_bytes(1, "A", 30)],
            &[person_bytes(1, "A", 31)],
        )));

        assert_eq!(
            observer.take(),
            vec![
                Recorded::Transaction(vec!["person".into()]),
                Recorded::Update("person".into(), 1, 30, 31),
            ]
        );
        let cached = inner.cache.lock().unwrap().find("person", &1u64.into()).unwrap();
        assert_eq!(age_of(&cached), 31);
    }

    #[test]
    fn mixed_delta_dispatches_deletes_updates_inserts_in_order() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::TransactionUpdate(person_tx(
            &[person_bytes(1, "A", 30), person_bytes(2, "B", 25)],
            &[person_bytes(1, "A", 31), person_bytes(3, "C", 40)],
        )));

        assert_eq!(
            observer.take(),
            vec![
                Recorded::Transaction(vec!["person".into()]),
                Recorded::Delete("person".into(), 2),
                Recorded::Update("person".into(), 1, 30, 31),
                Recorded::Insert("person".into(), 3),
            ]
        );
    }

    #[test]
    fn transaction_callback_can_suppress_row_events() {
        let observer = Arc::new(Recorder::suppressing());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::TransactionUpdate(person_tx(
            &[],
            &[person_bytes(1, "A", 30)],
        )));

        assert_eq!(observer.take(), vec![Recorded::Transaction(vec!["person".into()])]);
        // Suppression only silences callbacks; the cache still moved.
        assert_eq!(inner.cache.lock().unwrap().count("person"), 1);
    }

    #[test]
    fn bad_row_offsets_drop_the_whole_transaction() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());
        inner.handle_server_message(ServerMessage::SubscribeApplied(SubscribeApplied {
            request_id: 1,
            query_set_id: 1,
            rows: QueryRows {
                tables: vec![SingleTableRows {
                    table: "person".into(),
                    rows: row_list(&[person_bytes(1, "A", 30)]),
                }]
                .into(),
            },
        }));
        observer.take();

        let mut tx = person_tx(&[person_bytes(1, "A", 30)], &[]);
        // Corrupt the insert list with an offset past the data.
        let TableUpdateRows::Persistent(rows) = &mut tx.query_sets[0].tables[0].rows[0] else {
            unreachable!()
        };
        rows.inserts = BsatnRowList::with_offsets(vec![0u64, 100], Bytes::from_static(&[0; 4]));

        inner.handle_server_message(ServerMessage::TransactionUpdate(tx));

        // No events fired and the delete was not applied.
        assert_eq!(observer.take(), vec![]);
        assert_eq!(inner.cache.lock().unwrap().count("person"), 1);
    }

    #[test]
    fn initial_connection_stores_negotiated_state() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::InitialConnection(
            stdb_dyn_client_messages::websocket::InitialConnection {
                identity: Identity([7; 32]),
                connection_id: ConnectionId([9; 16]),
                token: "tok".into(),
            },
        ));

        assert_eq!(observer.take(), vec![Recorded::Connect("tok".into())]);
        let state = inner.state.lock().unwrap();
        assert!(state.connected);
        assert_eq!(state.identity, Some(Identity([7; 32])));
        assert_eq!(state.connection_id, Some(ConnectionId([9; 16])));
        assert_eq!(state.token.as_deref(), Some("tok"));
    }

    #[test]
    fn subscription_error_clears_only_the_named_request() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());
        {
            let mut state = inner.state.lock().unwrap();
            state.pending.insert(3, RequestDescriptor::Unsubscribe { query_set_id: 10 });
            state.pending.insert(4, RequestDescriptor::OneOffQuery { query: "q".into() });
        }

        // Without a request_id, nothing is cleared.
        inner.handle_server_message(ServerMessage::SubscriptionError(SubscriptionError {
            request_id: None,
            query_set_id: 10,
            error: "bad query".into(),
        }));
        assert_eq!(inner.state.lock().unwrap().pending.len(), 2);

        // With one, exactly that descriptor is cleared.
        inner.handle_server_message(ServerMessage::SubscriptionError(SubscriptionError {
            request_id: Some(3),
            query_set_id: 10,
            error: "bad query".into(),
        }));
        let state = inner.state.lock().unwrap();
        assert_eq!(state.pending.len(), 1);
        assert!(state.pending.contains_key(&4));
        drop(state);

        assert_eq!(
            observer.take(),
            vec![
                Recorded::SubscriptionError(None, 10, "bad query".into()),
                Recorded::SubscriptionError(Some(3), 10, "bad query".into()),
            ]
        );
    }

    #[test]
    fn reducer_result_applies_tx_before_reporting() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer.clone());

        inner.handle_server_message(ServerMessage::ReducerResult(ReducerResult {
            request_id: 9,
            timestamp: Timestamp(1),
            outcome: ReducerOutcome::Ok {
                ret: Bytes::new(),
                tx: person_tx(&[], &[person_bytes(5, "E", 50)]),
            },
        }));

        assert_eq!(
            observer.take(),
            vec![
                Recorded::Transaction(vec!["person".into()]),
                Recorded::Insert("person".into(), 5),
                Recorded::ReducerResult(9),
            ]
        );
        assert_eq!(inner.cache.lock().unwrap().count("person"), 1);
    }

    #[test]
    fn unknown_reducer_fails_before_the_socket() {
        let observer = Arc::new(Recorder::default());
        let inner = test_inner(observer);

        let err = inner.call_reducer("nope", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ClientError::Schema(SchemaError::UnknownReducer(_))));
        // Nothing was registered as pending.
        assert!(inner.state.lock().unwrap().pending.is_empty());

        // A known reducer with good args gets as far as the (absent) socket.
        let mut args = HashMap::new();
        args.insert("id".to_string(), 1u64.into());
        args.insert("age".to_string(), 31u32.into());
        let err = inner.call_reducer("set_age", &args).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(inner.state.lock().unwrap().pending.is_empty());
    }
}
