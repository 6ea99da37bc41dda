//! WebSocket transport speaking the JSON hub protocol.
//!
//! The client connects to the negotiated URL with the grant's bearer token,
//! sends the protocol handshake and waits for the empty handshake reply.
//! Every frame afterwards is a JSON object terminated by the ASCII record
//! separator (0x1E); one WebSocket message may carry several frames.
//!
//! | type | meaning    |
//! |------|------------|
//! | 1    | invocation (`target` + `arguments`) |
//! | 6    | ping       |
//! | 7    | close      |
//!
//! The client answers nothing but sends its own ping on a fixed interval so
//! the hub keeps the connection open.

use super::{ChannelConnection, ChannelEvent, ChannelEventKind, ChannelGrant, ChannelTransport, EventPayload};
use crate::remote::RemoteError;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const RECORD_SEPARATOR: char = '\u{1e}';
const HANDSHAKE: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";
const PING: &str = "{\"type\":6}\u{1e}";

const INVOCATION: u8 = 1;
const PING_TYPE: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Deserialize)]
struct HubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// A decoded hub frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Event(ChannelEvent),
    Ping,
    Close(Option<String>),
    /// Frames with no meaning for this client (unknown targets, completions).
    Ignored,
}

/// Split a WebSocket text message into frames and decode each one.
pub(crate) fn parse_frames(text: &str) -> Vec<Result<Frame, String>> {
    text.split(RECORD_SEPARATOR)
        .filter(|frame| !frame.trim().is_empty())
        .map(parse_frame)
        .collect()
}

fn parse_frame(frame: &str) -> Result<Frame, String> {
    let message: HubMessage = serde_json::from_str(frame).map_err(|e| e.to_string())?;
    match message.kind {
        INVOCATION => {
            let Some(kind) = message.target.as_deref().and_then(ChannelEventKind::from_name) else {
                return Ok(Frame::Ignored);
            };
            let argument = message
                .arguments
                .into_iter()
                .next()
                .ok_or_else(|| format!("{} without arguments", kind.name()))?;
            let payload: EventPayload = serde_json::from_value(argument).map_err(|e| e.to_string())?;
            Ok(Frame::Event(ChannelEvent::new(kind, payload)))
        }
        PING_TYPE => Ok(Frame::Ping),
        CLOSE => Ok(Frame::Close(message.error)),
        _ => Ok(Frame::Ignored),
    }
}

/// Check the handshake reply: `{}` on success, `{"error": ...}` otherwise.
///
/// Returns the frames that arrived in the same message after the reply.
fn check_handshake(text: &str) -> Result<&str, RemoteError> {
    let (reply, rest) = text.split_once(RECORD_SEPARATOR).unwrap_or((text, ""));
    let value: Value = serde_json::from_str(reply)
        .map_err(|e| RemoteError::Unreachable(format!("malformed hub handshake: {}", e)))?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(RemoteError::Unreachable(format!("hub handshake rejected: {}", error))),
        None => Ok(rest),
    }
}

/// Deliver the events in one text message. Returns `false` once the
/// connection is finished, either closed by the hub or dropped by the reader.
async fn forward(text: &str, events: &mpsc::Sender<ChannelEvent>) -> bool {
    for frame in parse_frames(text) {
        match frame {
            Ok(Frame::Event(event)) => {
                if events.send(event).await.is_err() {
                    return false;
                }
            }
            Ok(Frame::Close(error)) => {
                tracing::info!("Hub closed the connection: {:?}", error);
                return false;
            }
            Ok(Frame::Ping) | Ok(Frame::Ignored) => {}
            Err(e) => tracing::warn!("Skipping undecodable hub frame: {}", e),
        }
    }
    true
}

fn unreachable(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Unreachable(err.to_string())
}

/// Hub protocol transport over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct HubTransport {
    keepalive: Duration,
    buffer: usize,
}

impl Default for HubTransport {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            buffer: 64,
        }
    }
}

impl HubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval between client pings.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl ChannelTransport for HubTransport {
    async fn connect(&self, grant: &ChannelGrant) -> Result<ChannelConnection, RemoteError> {
        let mut request = grant.url.as_str().into_client_request().map_err(unreachable)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", grant.access_token))
            .map_err(|e| RemoteError::Validation(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(unreachable)?;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(HANDSHAKE.to_string()))
            .await
            .map_err(unreachable)?;
        let leftover = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => break check_handshake(&text)?.to_string(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(unreachable("hub closed during handshake"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(unreachable(e)),
            }
        };
        tracing::debug!("Hub handshake complete");

        let (events, receiver) = mpsc::channel(self.buffer);
        let keepalive = self.keepalive;
        let reader = tokio::spawn(async move {
            if !forward(&leftover, &events).await {
                return;
            }
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;

            loop {
                tokio::select! {
                    message = read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if !forward(&text, &events).await {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("Hub connection error: {}", e);
                            return;
                        }
                    },
                    _ = ticker.tick() => {
                        if write.send(Message::Text(PING.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ChannelConnection::with_reader(receiver, reader))
    }
}
