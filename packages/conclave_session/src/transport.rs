//! Duplex text links to the chat server.
//!
//! A `Connector` opens a raw `Link` (no authentication); the
//! `ConnectionManager` runs the handshake on top of it. Two connectors ship
//! with the crate:
//! - `WsConnector` — WebSocket via tokio-tungstenite
//! - `MemoryConnector` — in-process channels, for embedding and tests

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Channel capacity for each direction of a link.
const LINK_CHANNEL_CAPACITY: usize = 256;

/// One established duplex channel. Dropping `outgoing` closes the link;
/// `incoming` yields `None` once the peer is gone.
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

pub trait Connector: Send + Sync + 'static {
    fn dial(&self) -> impl Future<Output = Result<Link, SessionError>> + Send;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn dial(&self) -> Result<Link, SessionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(SessionError::from_tungstenite)?;
        debug!(url = %self.url, "websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        // Writer task: drain channel → websocket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = out_rx.recv() => {
                        match msg {
                            Some(text) => {
                                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                                    warn!("websocket write error: {}", e);
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            writer_cancel.cancel();
        });

        // Reader task: websocket → channel
        let reader_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                if in_tx.send(text.as_str().to_string()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(tungstenite::Message::Close(_))) | None => {
                                debug!("websocket closed by peer");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("websocket read error: {}", e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
            reader_cancel.cancel();
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Server side of an in-memory link.
pub struct ServerEnd {
    /// Text sent by the client.
    pub incoming: mpsc::Receiver<String>,
    /// Text delivered to the client.
    pub outgoing: mpsc::Sender<String>,
}

impl ServerEnd {
    /// Next client message, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            let text = self.incoming.recv().await?;
            match serde_json::from_str(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!("memory link: unparseable client message: {}", e),
            }
        }
    }

    pub async fn send(&self, msg: &ServerMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.outgoing.send(json).await.is_ok(),
            Err(_) => false,
        }
    }
}

/// Accepts links dialed through a `MemoryConnector`.
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.rx.recv().await
    }
}

/// In-process connector. Each `dial` hands the server side of a fresh link
/// to the paired `MemoryListener`.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    refuse_next: Arc<AtomicU32>,
    dials: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryListener) {
        let (accept_tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse_next: Arc::new(AtomicU32::new(0)),
                dials: Arc::new(AtomicU32::new(0)),
            },
            MemoryListener { rx },
        )
    }

    /// Make the next `n` dials fail with a transport error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, including refused ones.
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    async fn dial(&self) -> Result<Link, SessionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SessionError::Transport("connection refused".to_string()));
        }

        let (c2s_tx, c2s_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (s2c_tx, s2c_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        self.accept_tx
            .send(ServerEnd {
                incoming: c2s_rx,
                outgoing: s2c_tx,
            })
            .map_err(|_| SessionError::Transport("listener closed".to_string()))?;
        Ok(Link {
            outgoing: c2s_tx,
            incoming: s2c_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_link_round_trip() {
        let (connector, mut listener) = MemoryConnector::pair();
        let mut link = connector.dial().await.unwrap();
        let mut server = listener.accept().await.unwrap();

        let hello = serde_json::to_string(&ClientMessage::Authenticate {
            token: "t".to_string(),
        })
        .unwrap();
        link.outgoing.send(hello).await.unwrap();
        assert_eq!(
            server.recv().await,
            Some(ClientMessage::Authenticate {
                token: "t".to_string()
            })
        );

        assert!(server.send(&ServerMessage::AuthOk { connection_id: None }).await);
        let reply = link.incoming.recv().await.unwrap();
        assert_eq!(ServerMessage::parse(&reply).unwrap(), ServerMessage::AuthOk {
            connection_id: None
        });
    }

    #[tokio::test]
    async fn refused_dials_fail_then_recover() {
        let (connector, _listener) = MemoryConnector::pair();
        connector.refuse_next(2);
        assert!(connector.dial().await.is_err());
        assert!(connector.dial().await.is_err());
        assert!(connector.dial().await.is_ok());
        assert_eq!(connector.dial_count(), 3);
    }

    #[tokio::test]
    async fn dial_fails_when_listener_dropped() {
        let (connector, listener) = MemoryConnector::pair();
        drop(listener);
        assert!(matches!(
            connector.dial().await,
            Err(SessionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn ws_dial_to_closed_port_is_transport_error() {
        // Port 1 is reserved — nothing listens there
        let connector = WsConnector::new("ws://127.0.0.1:1/ws");
        assert!(matches!(
            connector.dial().await,
            Err(SessionError::Transport(_))
        ));
    }
}
