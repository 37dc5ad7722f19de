//! Transport contract (spec.md §6) plus a minimal `tokio-tungstenite`-backed
//! reference implementation.
//!
//! spec.md treats the transport as an external collaborator and only
//! records its event contract: a bidirectional, auto-reconnectable message
//! channel with named events and acknowledgements. `SessionClient` is
//! written against the `Transport` trait only; `WebSocketTransport` is one
//! concrete implementation built on the same `tokio-tungstenite` crate the
//! teacher already depends on for `CollaborationManager::join_session`
//! (`src/features/collaboration.rs`).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::CoreResult;

/// An inbound transport message: a named event plus its JSON argument
/// array, e.g. `("operation", [clientId, revision, op, selection])`.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub event: String,
    pub args: Vec<Value>,
}

/// Connection lifecycle events a `Transport` surfaces to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { intentional: bool },
    Message(InboundMessage),
}

/// The transport contract `SessionClient` depends on. Any bidirectional,
/// named-event, ordered-delivery channel can implement this — a real
/// Socket.IO client, a test double, or `WebSocketTransport` below.
#[async_trait]
pub trait Transport: Send {
    /// Send a named event with its JSON argument array.
    async fn emit(&mut self, event: &str, args: Vec<Value>) -> CoreResult<()>;
    /// Receive the next lifecycle or message event, or `None` once the
    /// transport is permanently closed.
    async fn next_event(&mut self) -> Option<TransportEvent>;
    /// Tear down the connection. `intentional` suppresses auto-reconnect.
    async fn disconnect(&mut self, intentional: bool);
    /// Re-establish the connection after a drop. Called by
    /// `SessionClient`'s reconnect supervisor (spec.md §4.3.6); the
    /// transport is responsible for emitting `TransportEvent::Connected`
    /// once the new connection's reader task is up.
    async fn reconnect(&mut self) -> CoreResult<()>;
}

/// Wire envelope: a two-element JSON array `[event, args]`, matching the
/// named-event/ack model spec.md §6 describes for a Socket.IO-like channel,
/// without pulling in a full Engine.IO/Socket.IO client dependency (none of
/// the retrieval pack's example repos depend on one).
fn encode_envelope(event: &str, args: &[Value]) -> Message {
    let envelope = Value::Array(vec![Value::String(event.to_string()), Value::Array(args.to_vec())]);
    Message::text(envelope.to_string())
}

fn decode_envelope(text: &str) -> Option<InboundMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let array = value.as_array()?;
    let event = array.first()?.as_str()?.to_string();
    let args = array.get(1).and_then(|v| v.as_array()).cloned().unwrap_or_default();
    Some(InboundMessage { event, args })
}

/// A session cookie-authenticated WebSocket transport. The handshake
/// carries `connect.sid=<cookie>` per spec.md §6's authentication
/// requirement; the cookie itself is opaque to this crate and supplied by
/// the caller (the interactive auth flows that produce it are out of
/// scope, per spec.md §1).
pub struct WebSocketTransport {
    url: String,
    session_cookie: String,
    outbound: Option<futures_util::stream::SplitSink<WsStream, Message>>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, session_cookie: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            session_cookie: session_cookie.into(),
            outbound: None,
            inbound: rx,
            inbound_tx: tx,
        }
    }

    /// Open (or reopen) the underlying WebSocket connection.
    pub async fn connect(&mut self) -> CoreResult<()> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!(e))?;
        let cookie = format!("connect.sid={}", self.session_cookie)
            .parse()
            .map_err(|e: http::header::InvalidHeaderValue| anyhow::anyhow!(e))?;
        request.headers_mut().insert(http::header::COOKIE, cookie);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let (sink, mut source) = stream.split();
        self.outbound = Some(sink);

        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(parsed) = decode_envelope(&text) {
                            if tx.send(TransportEvent::Message(parsed)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = tx.send(TransportEvent::Disconnected { intentional: false });
                        break;
                    }
                    Err(_) => {
                        let _ = tx.send(TransportEvent::Disconnected { intentional: false });
                        break;
                    }
                    _ => {}
                }
            }
        });
        let _ = self.inbound_tx.send(TransportEvent::Connected);
        Ok(())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn emit(&mut self, event: &str, args: Vec<Value>) -> CoreResult<()> {
        let sink = self
            .outbound
            .as_mut()
            .ok_or(crate::error::CoreError::Disconnected)?;
        sink.send(encode_envelope(event, &args))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    async fn disconnect(&mut self, intentional: bool) {
        if let Some(mut sink) = self.outbound.take() {
            let _ = sink.close().await;
        }
        let _ = self.inbound_tx.send(TransportEvent::Disconnected { intentional });
    }

    async fn reconnect(&mut self) -> CoreResult<()> {
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let msg = encode_envelope("operation", &[Value::from(3), Value::from("x")]);
        let text = match msg {
            Message::Text(t) => t,
            _ => panic!("expected text message"),
        };
        let decoded = decode_envelope(&text).unwrap();
        assert_eq!(decoded.event, "operation");
        assert_eq!(decoded.args, vec![Value::from(3), Value::from("x")]);
    }

    #[test]
    fn decode_rejects_malformed_envelope() {
        assert!(decode_envelope("not json").is_none());
        assert!(decode_envelope("[]").is_none());
    }
}
