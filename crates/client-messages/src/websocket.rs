//! Messages sent over the SpacetimeDB WebSocket protocol.
//!
//! Client -> Server messages are encoded from [`ClientMessage`].
//! Server -> Client messages are decoded into [`ServerMessage`].
//!
//! Both directions are BSATN: a leading `u8` variant tag, then the variant's
//! fields concatenated in declaration order. The client only ever encodes
//! [`ClientMessage`] and only ever decodes [`ServerMessage`], so each shape
//! implements just the direction it needs.

use bytes::Bytes;
use stdb_dyn_sats::{BufReader, BufWriter, DecodeError};

use crate::row_list::BsatnRowList;

/// The WebSocket subprotocol spoken here.
pub const BIN_PROTOCOL: &str = "v2.bsatn.spacetimedb";

/// A client's public identity: an opaque 32-byte value minted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(pub [u8; 32]);

/// An identifier for one WebSocket connection: an opaque 16-byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub [u8; 16]);

/// A point in time, as nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

/// A span of time, as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeDuration(pub i64);

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A message from the client to the database.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Register a set of queries, about which the client will receive
    /// `TransactionUpdate`s.
    Subscribe(Subscribe),
    /// Tear down a query set previously registered with [`Subscribe`].
    Unsubscribe(Unsubscribe),
    /// A one-off SQL query outside any subscription.
    OneOffQuery(OneOffQuery),
    /// Request a reducer run.
    CallReducer(CallReducer),
    /// Request a procedure run.
    CallProcedure(CallProcedure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    /// An identifier for a client request.
    pub request_id: u32,
    /// An identifier for this subscription, which should not be reused for
    /// any other subscription on the same connection. Referenced by
    /// [`Unsubscribe`] and by various server responses.
    pub query_set_id: u32,
    /// The queries to subscribe to, each a single SQL `SELECT` statement.
    pub query_strings: Box<[Box<str>]>,
}

/// Flags for [`Unsubscribe`]. Bit 0 set asks the server to include the
/// dropped rows in its `UnsubscribeApplied` response.
pub const UNSUBSCRIBE_FLAG_SEND_DROPPED_ROWS: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    /// An identifier for a client request.
    pub request_id: u32,
    /// The ID used in the corresponding [`Subscribe`] message.
    pub query_set_id: u32,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneOffQuery {
    /// An identifier for a client request.
    pub request_id: u32,
    /// A single SQL `SELECT` statement.
    pub query_string: Box<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallReducer {
    /// An identifier for a client request.
    pub request_id: u32,
    /// Currently always 0.
    pub flags: u8,
    /// The name of the reducer to call.
    pub reducer: Box<str>,
    /// The arguments to the reducer: a BSATN-encoded product value meeting
    /// the reducer's parameter schema.
    pub args: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallProcedure {
    /// An identifier for a client request.
    pub request_id: u32,
    /// Currently always 0.
    pub flags: u8,
    /// The name of the procedure to call.
    pub procedure: Box<str>,
    /// The arguments to the procedure: a BSATN-encoded product value meeting
    /// the procedure's parameter schema.
    pub args: Bytes,
}

/// A message from the database to the client, after the compression envelope
/// has been stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Always the first message on a new connection; informs the client of
    /// its identity and (possibly server-minted) token.
    InitialConnection(InitialConnection),
    /// Response to [`Subscribe`] containing the initial matching rows.
    SubscribeApplied(SubscribeApplied),
    /// Response to [`Unsubscribe`].
    UnsubscribeApplied(UnsubscribeApplied),
    /// An error at any point of the subscription lifecycle.
    SubscriptionError(SubscriptionError),
    /// Changes to subscribed rows from a committed transaction.
    TransactionUpdate(TransactionUpdate),
    /// Results of a [`OneOffQuery`].
    OneOffQueryResult(OneOffQueryResult),
    /// The outcome of a [`CallReducer`] request.
    ReducerResult(ReducerResult),
    /// The outcome of a [`CallProcedure`] request.
    ProcedureResult(ProcedureResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitialConnection {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    /// A token identifying the client across connections. If the client
    /// connected anonymously, a fresh token minted by the server.
    pub token: Box<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeApplied {
    /// The request_id of the corresponding [`Subscribe`] message.
    pub request_id: u32,
    /// The query set ID sent by the client.
    pub query_set_id: u32,
    /// The matching rows for the subscribed queries.
    pub rows: QueryRows,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeApplied {
    /// The request_id of the corresponding [`Unsubscribe`] message.
    pub request_id: u32,
    /// The query set ID included in the `Unsubscribe` message.
    pub query_set_id: u32,
    /// The rows dropped by the unsubscription, if the client asked for them
    /// via [`UNSUBSCRIBE_FLAG_SEND_DROPPED_ROWS`].
    pub rows: Option<QueryRows>,
}

/// An error at any point of the subscription lifecycle.
///
/// If `request_id` is absent, the error was raised while evaluating an
/// already-established subscription rather than in response to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionError {
    pub request_id: Option<u32>,
    /// The query set the error applies to. The client should not expect
    /// further updates for it.
    pub query_set_id: u32,
    /// A diagnostic message; no predictable format.
    pub error: Box<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRows {
    pub tables: Box<[SingleTableRows]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleTableRows {
    pub table: Box<str>,
    pub rows: BsatnRowList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpdate {
    pub query_sets: Box<[QuerySetUpdate]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySetUpdate {
    pub query_set_id: u32,
    pub tables: Box<[TableUpdate]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableUpdate {
    pub table_name: Box<str>,
    pub rows: Box<[TableUpdateRows]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableUpdateRows {
    /// Rows of a persistent table: inserts and deletes to reconcile against
    /// the local mirror.
    Persistent(PersistentTableRows),
    /// Rows of an event table; these are never resident in the mirror.
    Event(EventTableRows),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentTableRows {
    pub inserts: BsatnRowList,
    pub deletes: BsatnRowList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventTableRows {
    pub events: BsatnRowList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneOffQueryResult {
    /// The request_id of the corresponding [`OneOffQuery`] message.
    pub request_id: u32,
    /// The matching rows, or an error message if evaluation failed.
    pub result: Result<QueryRows, Box<str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducerResult {
    /// The request_id of the corresponding [`CallReducer`] message.
    pub request_id: u32,
    /// The time when the reducer started.
    pub timestamp: Timestamp,
    pub outcome: ReducerOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReducerOutcome {
    /// The reducer committed; its return value and the resulting transaction
    /// update are enclosed.
    Ok { ret: Bytes, tx: TransactionUpdate },
    /// The reducer committed and there is nothing to report.
    OkEmpty,
    /// The reducer rejected the call with a BSATN-encoded error value.
    Err(Bytes),
    /// The call failed in the host, e.g. a type error or unknown reducer.
    InternalError(Box<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureResult {
    /// The status of the procedure run, including the return value on
    /// success.
    pub status: ProcedureStatus,
    /// The time when the procedure started.
    pub timestamp: Timestamp,
    /// How long the procedure took to run.
    pub total_host_execution_duration: TimeDuration,
    /// The request_id of the corresponding [`CallProcedure`] message.
    pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureStatus {
    /// The procedure ran and returned the enclosed value. All user error
    /// handling happens inside that value.
    Returned(Bytes),
    /// The call failed in the host.
    InternalError(Box<str>),
}

impl ClientMessage {
    /// The request_id carried by this message.
    pub fn request_id(&self) -> u32 {
        match self {
            ClientMessage::Subscribe(m) => m.request_id,
            ClientMessage::Unsubscribe(m) => m.request_id,
            ClientMessage::OneOffQuery(m) => m.request_id,
            ClientMessage::CallReducer(m) => m.request_id,
            ClientMessage::CallProcedure(m) => m.request_id,
        }
    }

    /// Encodes this message for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        match self {
            ClientMessage::Subscribe(m) => {
                w.put_u8(0);
                w.put_u32(m.request_id);
                w.put_u32(m.query_set_id);
                w.put_u32(m.query_strings.len() as u32);
                for query in m.query_strings.iter() {
                    put_str(&mut w, query);
                }
            }
            ClientMessage::Unsubscribe(m) => {
                w.put_u8(1);
                w.put_u32(m.request_id);
                w.put_u32(m.query_set_id);
                w.put_u8(m.flags);
            }
            ClientMessage::OneOffQuery(m) => {
                w.put_u8(2);
                w.put_u32(m.request_id);
                put_str(&mut w, &m.query_string);
            }
            ClientMessage::CallReducer(m) => {
                w.put_u8(3);
                w.put_u32(m.request_id);
                w.put_u8(m.flags);
                put_str(&mut w, &m.reducer);
                w.put_u32(m.args.len() as u32);
                w.put_slice(&m.args);
            }
            ClientMessage::CallProcedure(m) => {
                w.put_u8(4);
                w.put_u32(m.request_id);
                w.put_u8(m.flags);
                put_str(&mut w, &m.procedure);
                w.put_u32(m.args.len() as u32);
                w.put_slice(&m.args);
            }
        }
        w
    }
}

fn put_str(w: &mut impl BufWriter, s: &str) {
    w.put_u32(s.len() as u32);
    w.put_slice(s.as_bytes());
}

fn get_str<'de>(r: &mut impl BufReader<'de>) -> Result<Box<str>, DecodeError> {
    let len = r.get_u32()?;
    let bytes = r.get_slice(len as usize)?;
    core::str::from_utf8(bytes)
        .map(Into::into)
        .map_err(|_| DecodeError::InvalidUtf8(len))
}

fn get_bytes<'de>(r: &mut impl BufReader<'de>) -> Result<Bytes, DecodeError> {
    let len = r.get_u32()?;
    Ok(Bytes::copy_from_slice(r.get_slice(len as usize)?))
}

fn get_option<'de, R: BufReader<'de>, T>(
    r: &mut R,
    get: impl FnOnce(&mut R) -> Result<T, DecodeError>,
) -> Result<Option<T>, DecodeError> {
    match r.get_u8()? {
        0 => Ok(Some(get(r)?)),
        1 => Ok(None),
        tag => Err(DecodeError::InvalidOptionTag(tag)),
    }
}

impl ServerMessage {
    /// Decodes one server message from a decompressed payload.
    ///
    /// Trailing bytes after the message are tolerated; the transport logs at
    /// a higher level if it cares.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let r = &mut &payload[..];
        Ok(match r.get_u8()? {
            0 => ServerMessage::InitialConnection(InitialConnection {
                identity: Identity(r.get_array()?),
                connection_id: ConnectionId(r.get_array()?),
                token: get_str(r)?,
            }),
            1 => ServerMessage::SubscribeApplied(SubscribeApplied {
                request_id: r.get_u32()?,
                query_set_id: r.get_u32()?,
                rows: QueryRows::decode(r)?,
            }),
            2 => ServerMessage::UnsubscribeApplied(UnsubscribeApplied {
                request_id: r.get_u32()?,
                query_set_id: r.get_u32()?,
                rows: get_option(r, QueryRows::decode)?,
            }),
            3 => ServerMessage::SubscriptionError(SubscriptionError {
                request_id: get_option(r, |r| r.get_u32())?,
                query_set_id: r.get_u32()?,
                error: get_str(r)?,
            }),
            4 => ServerMessage::TransactionUpdate(TransactionUpdate::decode(r)?),
            5 => ServerMessage::OneOffQueryResult(OneOffQueryResult {
                request_id: r.get_u32()?,
                result: match r.get_u8()? {
                    0 => Ok(QueryRows::decode(r)?),
                    1 => Err(get_str(r)?),
                    tag => return Err(DecodeError::unknown_tag(tag, "OneOffQueryResult")),
                },
            }),
            6 => ServerMessage::ReducerResult(ReducerResult {
                request_id: r.get_u32()?,
                timestamp: Timestamp(r.get_i64()?),
                outcome: ReducerOutcome::decode(r)?,
            }),
            7 => ServerMessage::ProcedureResult(ProcedureResult {
                status: match r.get_u8()? {
                    0 => ProcedureStatus::Returned(get_bytes(r)?),
                    1 => ProcedureStatus::InternalError(get_str(r)?),
                    tag => return Err(DecodeError::unknown_tag(tag, "ProcedureStatus")),
                },
                timestamp: Timestamp(r.get_i64()?),
                total_host_execution_duration: TimeDuration(r.get_i64()?),
                request_id: r.get_u32()?,
            }),
            tag => return Err(DecodeError::unknown_tag(tag, "ServerMessage")),
        })
    }

    /// The request_id this message responds to, if it is a response.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            ServerMessage::InitialConnection(_) | ServerMessage::TransactionUpdate(_) => None,
            ServerMessage::SubscribeApplied(m) => Some(m.request_id),
            ServerMessage::UnsubscribeApplied(m) => Some(m.request_id),
            ServerMessage::SubscriptionError(m) => m.request_id,
            ServerMessage::OneOffQueryResult(m) => Some(m.request_id),
            ServerMessage::ReducerResult(m) => Some(m.request_id),
            ServerMessage::ProcedureResult(m) => Some(m.request_id),
        }
    }
}

impl QueryRows {
    fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let count = r.get_u32()?;
        let mut tables = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            tables.push(SingleTableRows {
                table: get_str(r)?,
                rows: BsatnRowList::decode(r)?,
            });
        }
        Ok(QueryRows { tables: tables.into() })
    }
}

impl TransactionUpdate {
    pub(crate) fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let count = r.get_u32()?;
        let mut query_sets = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            query_sets.push(QuerySetUpdate::decode(r)?);
        }
        Ok(TransactionUpdate {
            query_sets: query_sets.into(),
        })
    }
}

impl QuerySetUpdate {
    fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let query_set_id = r.get_u32()?;
        let count = r.get_u32()?;
        let mut tables = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            tables.push(TableUpdate::decode(r)?);
        }
        Ok(QuerySetUpdate {
            query_set_id,
            tables: tables.into(),
        })
    }
}

impl TableUpdate {
    fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        let table_name = get_str(r)?;
        let count = r.get_u32()?;
        let mut rows = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            rows.push(match r.get_u8()? {
                0 => TableUpdateRows::Persistent(PersistentTableRows {
                    inserts: BsatnRowList::decode(r)?,
                    deletes: BsatnRowList::decode(r)?,
                }),
                1 => TableUpdateRows::Event(EventTableRows {
                    events: BsatnRowList::decode(r)?,
                }),
                tag => return Err(DecodeError::unknown_tag(tag, "TableUpdateRows")),
            });
        }
        Ok(TableUpdate {
            table_name,
            rows: rows.into(),
        })
    }
}

impl ReducerOutcome {
    fn decode<'de>(r: &mut impl BufReader<'de>) -> Result<Self, DecodeError> {
        Ok(match r.get_u8()? {
            0 => ReducerOutcome::Ok {
                ret: get_bytes(r)?,
                tx: TransactionUpdate::decode(r)?,
            },
            1 => ReducerOutcome::OkEmpty,
            2 => ReducerOutcome::Err(get_bytes(r)?),
            3 => ReducerOutcome::InternalError(get_str(r)?),
            tag => return Err(DecodeError::unknown_tag(tag, "ReducerOutcome")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_encodes_tag_ids_then_queries() {
        let msg = ClientMessage::Subscribe(Subscribe {
            request_id: 42,
            query_set_id: 7,
            query_strings: vec!["a".into(), "b".into()].into(),
        });
        assert_eq!(
            msg.encode(),
            [
                0x00, // tag
                0x2A, 0x00, 0x00, 0x00, // request_id
                0x07, 0x00, 0x00, 0x00, // query_set_id
                0x02, 0x00, 0x00, 0x00, // query count
                0x01, 0x00, 0x00, 0x00, b'a', // "a"
                0x01, 0x00, 0x00, 0x00, b'b', // "b"
            ]
        );
    }

    #[test]
    fn unsubscribe_encodes_flags_byte() {
        let msg = ClientMessage::Unsubscribe(Unsubscribe {
            request_id: 1,
            query_set_id: 2,
            flags: UNSUBSCRIBE_FLAG_SEND_DROPPED_ROWS,
        });
        assert_eq!(msg.encode(), [0x01, 1, 0, 0, 0, 2, 0, 0, 0, 1]);
    }

    #[test]
    fn call_reducer_encodes_preencoded_args_as_bytes() {
        let msg = ClientMessage::CallReducer(CallReducer {
            request_id: 3,
            flags: 0,
            reducer: "add".into(),
            args: Bytes::from_static(&[9, 9]),
        });
        assert_eq!(
            msg.encode(),
            [0x03, 3, 0, 0, 0, 0, 3, 0, 0, 0, b'a', b'd', b'd', 2, 0, 0, 0, 9, 9]
        );
    }

    #[test]
    fn initial_connection_decodes() {
        let mut payload = vec![0u8]; // tag
        payload.extend_from_slice(&[0; 32]);
        payload.extend_from_slice(&[0; 16]);
        payload.extend_from_slice(&[3, 0, 0, 0, b't', b'o', b'k']);

        let msg = ServerMessage::decode(&payload).unwrap();
        assert_eq!(
            msg,
            ServerMessage::InitialConnection(InitialConnection {
                identity: Identity([0; 32]),
                connection_id: ConnectionId([0; 16]),
                token: "tok".into(),
            })
        );
    }

    #[test]
    fn subscription_error_with_absent_request_id() {
        let mut payload = vec![3u8]; // tag
        payload.push(1); // request_id: none
        payload.extend_from_slice(&[0x0A, 0, 0, 0]); // query_set_id = 10
        payload.extend_from_slice(&[9, 0, 0, 0]);
        payload.extend_from_slice(b"bad query");

        let msg = ServerMessage::decode(&payload).unwrap();
        assert_eq!(
            msg,
            ServerMessage::SubscriptionError(SubscriptionError {
                request_id: None,
                query_set_id: 10,
                error: "bad query".into(),
            })
        );
        assert_eq!(msg.request_id(), None);
    }

    #[test]
    fn unknown_message_tag_is_a_typed_error() {
        assert_eq!(
            ServerMessage::decode(&[0xFF]),
            Err(DecodeError::unknown_tag(0xFF, "ServerMessage"))
        );
    }

    #[test]
    fn reducer_result_ok_empty_decodes() {
        let mut payload = vec![6u8]; // tag
        payload.extend_from_slice(&[5, 0, 0, 0]); // request_id
        payload.extend_from_slice(&7i64.to_le_bytes()); // timestamp
        payload.push(1); // OkEmpty

        let msg = ServerMessage::decode(&payload).unwrap();
        assert_eq!(
            msg,
            ServerMessage::ReducerResult(ReducerResult {
                request_id: 5,
                timestamp: Timestamp(7),
                outcome: ReducerOutcome::OkEmpty,
            })
        );
    }

    #[test]
    fn transaction_update_decodes_persistent_and_event_rows() {
        let mut payload = vec![4u8]; // tag
        payload.extend_from_slice(&[1, 0, 0, 0]); // one query set
        payload.extend_from_slice(&[2, 0, 0, 0]); // query_set_id = 2
        payload.extend_from_slice(&[1, 0, 0, 0]); // one table
        payload.extend_from_slice(&[1, 0, 0, 0, b't']); // table name "t"
        payload.extend_from_slice(&[2, 0, 0, 0]); // two row groups
        // Persistent: inserts FixedSize(1) with one byte, deletes empty.
        payload.push(0);
        payload.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0xAB]);
        payload.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
        // Event rows: FixedSize(0), no data.
        payload.push(1);
        payload.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);

        let msg = ServerMessage::decode(&payload).unwrap();
        let ServerMessage::TransactionUpdate(tx) = msg else {
            panic!("expected TransactionUpdate");
        };
        assert_eq!(tx.query_sets.len(), 1);
        let qs = &tx.query_sets[0];
        assert_eq!(qs.query_set_id, 2);
        assert_eq!(qs.tables[0].table_name, "t".into());
        match &qs.tables[0].rows[0] {
            TableUpdateRows::Persistent(rows) => {
                assert_eq!(rows.inserts.rows().unwrap().len(), 1);
                assert_eq!(rows.deletes.rows().unwrap().len(), 0);
            }
            other => panic!("expected persistent rows, got {other:?}"),
        }
        assert!(matches!(&qs.tables[0].rows[1], TableUpdateRows::Event(_)));
    }
}
