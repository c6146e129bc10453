//! The WebSocket transport: request construction, connection, and the socket
//! read/write loop.

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use futures_channel::mpsc;
use http::Uri;
use stdb_dyn_client_messages::{decode_frame, ClientMessage, BIN_PROTOCOL};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::protocol::Message as WebSocketMessage,
    MaybeTlsStream, WebSocketStream,
};

use crate::client::ClientConfig;
use crate::connection::ConnEvent;
use crate::error::ClientError;

pub(crate) struct WsConnection {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WebSocketMessage>,
}

/// Why the socket loop returned.
pub(crate) enum LoopExit {
    /// The client asked to shut down; do not reconnect.
    Shutdown,
    /// The connection ended for any other reason.
    Closed(Box<str>),
}

fn make_uri(config: &ClientConfig) -> Result<Uri, ClientError> {
    let scheme = if config.tls { "wss" } else { "ws" };
    format!(
        "{scheme}://{}/v1/database/{}/subscribe?compression={}",
        config.host,
        config.database,
        config.compression.query_value()
    )
    .parse()
    .map_err(|e| ClientError::BadConfig(format!("bad subscribe URI: {e}")))
}

/// Builds the handshake request: subscribe URI, our subprotocol, and a bearer
/// token when one is available.
pub(crate) fn make_request(config: &ClientConfig, token: Option<&str>) -> Result<http::Request<()>, ClientError> {
    let uri = make_uri(config)?;
    let mut req = IntoClientRequest::into_client_request(uri)?;
    req.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        http::header::HeaderValue::from_static(BIN_PROTOCOL),
    );
    if let Some(token) = token {
        let value = format!("Bearer {token}")
            .try_into()
            .map_err(|e| ClientError::BadConfig(format!("token is not a valid header value: {e}")))?;
        req.headers_mut().insert("Authorization", value);
    }
    Ok(req)
}

impl WsConnection {
    pub(crate) async fn connect(config: &ClientConfig, token: Option<&str>) -> Result<Self, ClientError> {
        let req = make_request(config, token)?;
        let (stream, _response) = connect_async(req).await?;
        let (write, read) = stream.split();
        Ok(WsConnection { read, write })
    }

    /// Runs the socket until it closes or shutdown is requested.
    ///
    /// Binary frames are stripped of their compression envelope and decoded;
    /// any framing or decode failure is logged and the frame dropped, never
    /// ending the connection. Pings are answered, text frames ignored.
    pub(crate) async fn message_loop(
        mut self,
        events: &mpsc::UnboundedSender<ConnEvent>,
        mut outgoing: mpsc::Receiver<ClientMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = self.write.send(WebSocketMessage::Close(None)).await;
                    return LoopExit::Shutdown;
                }

                Some(msg) = outgoing.next() => {
                    let frame = WebSocketMessage::Binary(msg.encode().into());
                    if let Err(e) = self.write.send(frame).await {
                        return LoopExit::Closed(format!("error writing to socket: {e}").into());
                    }
                }

                incoming = self.read.next() => match incoming {
                    None => return LoopExit::Closed("connection closed".into()),
                    Some(Err(e)) => return LoopExit::Closed(format!("websocket error: {e}").into()),

                    Some(Ok(WebSocketMessage::Binary(frame))) => match decode_frame(&frame) {
                        Ok(msg) => {
                            if events.unbounded_send(ConnEvent::Message(Box::new(msg))).is_err() {
                                return LoopExit::Shutdown;
                            }
                        }
                        Err(e) => log::warn!("dropping undecodable frame: {e}"),
                    },

                    Some(Ok(WebSocketMessage::Ping(payload))) => {
                        if let Err(e) = self.write.send(WebSocketMessage::Pong(payload)).await {
                            return LoopExit::Closed(format!("error writing to socket: {e}").into());
                        }
                    }

                    Some(Ok(WebSocketMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("server closed connection: {}", f.reason))
                            .unwrap_or_else(|| "server closed connection".to_string());
                        return LoopExit::Closed(reason.into());
                    }

                    Some(Ok(WebSocketMessage::Text(_))) => log::warn!("ignoring unexpected text frame"),
                    Some(Ok(other)) => log::debug!("ignoring websocket frame {other:?}"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;

    #[test]
    fn request_carries_subprotocol_and_bearer_token() {
        let config = ClientConfig::builder("localhost:3000", "quickstart").build();
        let req = make_request(&config, Some("tok")).unwrap();

        assert_eq!(
            req.uri().to_string(),
            "ws://localhost:3000/v1/database/quickstart/subscribe?compression=gzip"
        );
        assert_eq!(
            req.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "v2.bsatn.spacetimedb"
        );
        assert_eq!(req.headers().get("Authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn anonymous_request_has_no_auth_header() {
        let config = ClientConfig::builder("localhost:3000", "quickstart")
            .with_tls(true)
            .with_compression(stdb_dyn_client_messages::Compression::None)
            .build();
        let req = make_request(&config, None).unwrap();

        assert!(req.uri().to_string().starts_with("wss://"));
        assert!(req.uri().to_string().ends_with("compression=none"));
        assert!(req.headers().get("Authorization").is_none());
    }
}
