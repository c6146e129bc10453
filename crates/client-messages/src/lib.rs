//! Messages exchanged over the SpacetimeDB WebSocket protocol, and the
//! framing around them.
//!
//! Client -> Server messages are encoded from [`websocket::ClientMessage`].
//! Server -> Client messages are decoded into [`websocket::ServerMessage`]
//! after the per-frame compression envelope is stripped
//! ([`compression::decode_frame`]).

pub mod compression;
pub mod row_list;
pub mod websocket;

pub use compression::{decode_frame, decompress_frame, Compression, FrameError};
pub use row_list::{BsatnRowList, RowListError, RowSizeHint};
pub use websocket::{ClientMessage, ConnectionId, Identity, ServerMessage, Timestamp, BIN_PROTOCOL};
