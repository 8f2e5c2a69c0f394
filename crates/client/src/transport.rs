//! Transport seam between the connection layer and the wire.
//!
//! A [`Transport`] turns a relay URL into a pair of channels speaking the
//! NIP-01 message types. The production implementation runs over
//! WebSockets; tests inject channel-backed fakes with scripted relays.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// An open session with one relay.
///
/// Dropping the sender closes the session; the receiver yields `None`
/// once the relay side is gone.
pub struct RelayIo {
    /// Outgoing client messages
    pub sender: mpsc::UnboundedSender<ClientMessage>,
    /// Incoming relay messages
    pub receiver: mpsc::UnboundedReceiver<RelayMessage>,
}

impl RelayIo {
    /// Pair a session with its relay-side counterpart. Used by tests to
    /// script relay behavior.
    pub fn pipe() -> (
        Self,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<RelayMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: out_tx,
                receiver: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens sessions with relays.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session with the relay at `url`.
    ///
    /// Callers bound this with their own timeout; implementations may
    /// block until the relay answers or refuses.
    async fn open(&self, url: &str) -> Result<RelayIo>;
}

/// WebSocket transport over tokio-tungstenite.
///
/// One task per connection owns the socket and shuttles messages between
/// it and the session channels, answering pings inline. The task exits
/// when either side goes away.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<RelayIo> {
        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )));
            }
        }

        let (mut ws, _response) = connect_async(url)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        debug!(relay = url, "websocket connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayMessage>();
        let relay = url.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(msg) => {
                            let json = match msg.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(relay = %relay, error = %e, "dropping unserializable message");
                                    continue;
                                }
                            };
                            if ws.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        // Session handle dropped: say goodbye and stop.
                        None => {
                            let _ = ws.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = ws.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(relay = %relay, error = %e, "ignoring unparseable relay message");
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(relay = %relay, error = %e, "websocket read error");
                            break;
                        }
                    },
                }
            }
            debug!(relay = %relay, "websocket session ended");
        });

        Ok(RelayIo {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}
