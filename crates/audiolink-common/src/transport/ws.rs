//! Persistent WebSocket connection to a single node.
//!
//! The socket performs the authenticated handshake (`Authorization`,
//! `User-Id`, `Client-Name` headers) and decodes the node's JSON push
//! messages. It is read-only from the pool's point of view: the pool never
//! sends application messages over it, it only listens for `ready`, `stats`
//! and the close frame.

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{AudiolinkError, Result};
use crate::protocol::IncomingMessage;

/// Close code reported when the transport drops without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// What the read side of a node socket produced.
#[derive(Debug)]
pub enum SocketEvent {
    /// A decoded message from the node.
    Message(IncomingMessage),
    /// The connection is gone. `code` and `reason` come from the close frame
    /// when the node sent one.
    Closed { code: u16, reason: String },
}

/// One node's WebSocket connection.
pub struct NodeSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl NodeSocket {
    /// Opens the socket and performs the authenticated handshake.
    ///
    /// A `401` handshake response maps to
    /// [`AudiolinkError::Unauthorized`]; retrying with the same password
    /// cannot succeed, so callers should treat it as permanent.
    pub async fn connect(
        host: &str,
        port: u16,
        ssl: bool,
        password: &str,
        user_id: u64,
        client_name: &str,
    ) -> Result<Self> {
        let scheme = if ssl { "wss" } else { "ws" };
        let url = format!("{}://{}:{}/v4/websocket", scheme, host, port);

        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("authorization", header_value(password)?);
        headers.insert("user-id", header_value(&user_id.to_string())?);
        headers.insert("client-name", header_value(client_name)?);

        match connect_async(request).await {
            Ok((stream, _response)) => Ok(Self { stream }),
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(AudiolinkError::Unauthorized(format!("{}:{}", host, port)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the next event from the node.
    ///
    /// Frames that fail to decode are logged and skipped; the stream ending
    /// in any way yields [`SocketEvent::Closed`] exactly once.
    pub async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => return SocketEvent::Message(message),
                    Err(e) => debug!("Discarding undecodable node message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => return close_event(frame),
                // Binary frames and ping/pong are not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: e.to_string(),
                    }
                }
                None => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "connection reset".to_string(),
                    }
                }
            }
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AudiolinkError::Connection(format!("invalid header value: {}", e)))
}

fn close_event(frame: Option<CloseFrame<'_>>) -> SocketEvent {
    match frame {
        Some(frame) => SocketEvent::Closed {
            code: frame.code.into(),
            reason: frame.reason.into_owned(),
        },
        None => SocketEvent::Closed {
            code: ABNORMAL_CLOSE_CODE,
            reason: String::new(),
        },
    }
}
