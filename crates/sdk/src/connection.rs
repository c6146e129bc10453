//! Connection lifetime management: ID minting, request correlation, and the
//! reconnect loop that owns the socket.

use std::collections::HashMap;
use std::time::Duration;

use futures_channel::mpsc;
use stdb_dyn_client_messages::ServerMessage;

/// How many outgoing messages may be queued before senders block.
///
/// The queue is deliberately shallow: a caller issuing requests faster than
/// the socket drains blocks in the send path rather than growing a buffer.
pub(crate) const OUTGOING_QUEUE_DEPTH: usize = 64;

/// What a pending request was, so its response (or its loss) can be acted
/// on. Owned exclusively by the connection; erased on completion or
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestDescriptor {
    Subscribe {
        query_set_id: u32,
        queries: Box<[Box<str>]>,
    },
    Unsubscribe {
        query_set_id: u32,
    },
    OneOffQuery {
        query: Box<str>,
    },
    CallReducer {
        reducer: Box<str>,
    },
    CallProcedure {
        procedure: Box<str>,
    },
}

/// Mutable per-connection state, shared between the send path, the socket
/// task and the dispatcher behind one lock.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    next_request_id: u32,
    next_query_set_id: u32,
    pub pending: HashMap<u32, RequestDescriptor>,
    pub connected: bool,
    pub identity: Option<stdb_dyn_client_messages::Identity>,
    pub connection_id: Option<stdb_dyn_client_messages::ConnectionId>,
    pub token: Option<String>,
}

impl ConnectionState {
    /// Resets the counters for a fresh connection. Both restart at 1.
    pub fn reset(&mut self) {
        self.next_request_id = 1;
        self.next_query_set_id = 1;
        self.pending.clear();
        self.connected = false;
    }

    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id.max(1);
        self.next_request_id = id + 1;
        id
    }

    pub fn next_query_set_id(&mut self) -> u32 {
        let id = self.next_query_set_id.max(1);
        self.next_query_set_id = id + 1;
        id
    }

    /// Clears the descriptor a server response answers, if any.
    pub fn take_pending(&mut self, msg: &ServerMessage) -> Option<RequestDescriptor> {
        let request_id = msg.request_id()?;
        self.pending.remove(&request_id)
    }

    /// Drops every in-flight request, returning the descriptors so their
    /// loss can be reported.
    pub fn drain_pending(&mut self) -> Vec<(u32, RequestDescriptor)> {
        self.pending.drain().collect()
    }
}

/// How reconnection behaves after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Give up (and report `connection_failed`) after this many consecutive
    /// failed attempts.
    pub max_attempts: u32,
    /// The backoff before attempt `n` is `base_backoff * n`, capped at
    /// `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt).min(self.max_backoff)
    }
}

/// Events flowing from the connection to the dispatcher, in socket order.
pub(crate) enum ConnEvent {
    Message(Box<ServerMessage>),
    Disconnected { reason: Box<str>, attempt: u32 },
    ConnectionFailed,
}

pub(crate) type EventSender = mpsc::UnboundedSender<ConnEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<ConnEvent>;
