use stdb_dyn_sats::bsatn::EncodeError;
use thiserror::Error;

use crate::schema::SchemaError;

/// An error returned to the caller by a [`DbClient`](crate::DbClient)
/// operation.
///
/// Errors arising from server traffic never appear here; those are logged or
/// surfaced through [`ClientObserver`](crate::ClientObserver) callbacks, and
/// the connection keeps reading through them.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to encode reducer arguments: {0}")]
    Encode(#[from] EncodeError),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Disconnected,
    #[error("invalid connection configuration: {0}")]
    BadConfig(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
