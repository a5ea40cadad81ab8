//! ConnectionManager: the single real-time connection to the chat server.
//!
//! Owns the connection state, performs the authentication handshake on every
//! link, and reconnects with exponential backoff when the link drops. On each
//! successful reconnect it re-authenticates and re-subscribes to the bound
//! conversation with the last sequence it delivered, so the server only
//! replays what the client has not seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{ClientMessage, ConversationId, InboundFrame, ServerMessage};
use crate::transport::{Connector, Link};

/// Inbound frames queued for the consumer. When full, the link stops reading
/// until the consumer catches up.
const FRAME_QUEUE_CAPACITY: usize = 1024;
const EVENT_BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    Authenticated,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// Only an authenticated connection may carry outbound frames.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConnectedUnauthenticated => "connected-unauthenticated",
            Self::Authenticated => "authenticated",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Lifecycle events for observers (status bars, the controller's driver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Reconnected after a transport loss.
    Resumed { attempts: u32 },
    /// The server refused the token. Fatal for the connection.
    AuthRejected { reason: String },
    /// Reconnection policy exhausted; the connection is now disconnected.
    RetriesExhausted { attempts: u32 },
}

/// Exponential backoff with jitter and a capped retry count.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
    pub max_retries: u32,
    pub handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.2,
            max_retries: 8,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before reconnect `attempt` (1-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64((base * factor).min(self.max_delay.as_secs_f64()))
    }
}

struct Inner {
    token: Option<String>,
    outbound: Option<mpsc::Sender<String>>,
    link_cancel: Option<CancellationToken>,
    subscription: Option<ConversationId>,
    /// Highest sequence handed to the frame consumer per conversation, sent
    /// back on resubscribe.
    last_seq: HashMap<ConversationId, u64>,
    /// Consumer side of the frame queue until someone takes it.
    frames: Option<mpsc::Receiver<InboundFrame>>,
}

struct Core<C> {
    connector: C,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    frame_tx: mpsc::Sender<InboundFrame>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

/// Frames handed to the reconciler, in arrival order and without gaps.
/// There is one stream per manager; see [`ConnectionManager::take_frames`].
pub struct FrameStream {
    rx: mpsc::Receiver<InboundFrame>,
}

impl FrameStream {
    /// Next frame; `None` only once the manager is gone.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }
}

pub struct ConnectionManager<C: Connector> {
    core: Arc<Core<C>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            core: Arc::new(Core {
                connector,
                policy,
                state_tx,
                frame_tx,
                event_tx,
                inner: Mutex::new(Inner {
                    token: None,
                    outbound: None,
                    link_cancel: None,
                    subscription: None,
                    last_seq: HashMap::new(),
                    frames: Some(frame_rx),
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.core.connector
    }

    pub fn state(&self) -> ConnectionState {
        *self.core.state_tx.borrow()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.event_tx.subscribe()
    }

    /// The inbound frame stream. Frames queue from the first link on, so
    /// nothing is missed before the consumer starts; `None` once taken.
    pub async fn take_frames(&self) -> Option<FrameStream> {
        let rx = self.core.inner.lock().await.frames.take()?;
        Some(FrameStream { rx })
    }

    /// Wait until the connection is authenticated. Fails with
    /// `NotAuthenticated` if it ends up disconnected instead.
    pub async fn wait_for_authenticated(&self) -> Result<(), SessionError> {
        let mut rx = self.core.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Authenticated | ConnectionState::Disconnected
                )
            })
            .await
            .map_err(|_| SessionError::NotAuthenticated)?;
        if state.is_authenticated() {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }

    /// Establish the channel and authenticate with `token`. Any existing
    /// link is torn down first.
    pub async fn connect(&self, token: &str) -> Result<(), SessionError> {
        self.teardown().await;
        self.core.inner.lock().await.token = Some(token.to_string());

        self.core.set_state(ConnectionState::Connecting);
        let link = match self.core.connector.dial().await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.core.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.core.set_state(ConnectionState::ConnectedUnauthenticated);
        let link = match self.core.handshake(link, token).await {
            Ok(link) => link,
            Err(e) => {
                if let SessionError::AuthRejected { reason } = &e {
                    self.core.emit(ConnectionEvent::AuthRejected {
                        reason: reason.clone(),
                    });
                }
                self.core.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let cancel = self.core.shutdown.child_token();
        let Some(incoming) = self.core.attach_link(link, &cancel).await else {
            return Err(SessionError::Transport("connection manager shut down".to_string()));
        };
        tokio::spawn(run_link(self.core.clone(), incoming, cancel));
        Ok(())
    }

    /// Tear down the channel. Idempotent.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.core.inner.lock().await.token = None;
        self.core.set_state(ConnectionState::Disconnected);
    }

    /// Apply a token change from the auth provider: reconnect with the new
    /// token if connected, otherwise just remember it.
    pub async fn set_token(&self, token: &str) -> Result<(), SessionError> {
        let changed = {
            let mut inner = self.core.inner.lock().await;
            let changed = inner.token.as_deref() != Some(token);
            inner.token = Some(token.to_string());
            changed
        };
        if changed && self.state() != ConnectionState::Disconnected {
            info!("auth token changed, reconnecting");
            return self.connect(token).await;
        }
        Ok(())
    }

    /// Send a frame. Rejected unless the connection is authenticated; never
    /// queued.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), SessionError> {
        if !self.state().is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        let tx = self
            .core
            .inner
            .lock()
            .await
            .outbound
            .clone()
            .ok_or(SessionError::NotAuthenticated)?;
        let json = serde_json::to_string(msg)?;
        tx.send(json)
            .await
            .map_err(|_| SessionError::NotAuthenticated)
    }

    /// Follow `session_id` on this and every future link. Sends the subscribe
    /// frame right away when authenticated.
    pub async fn subscribe(&self, session_id: Option<ConversationId>) -> Result<(), SessionError> {
        let (tx, msg) = {
            let mut inner = self.core.inner.lock().await;
            if inner.subscription == session_id {
                return Ok(());
            }
            inner.subscription = session_id.clone();
            let Some(session_id) = session_id else {
                return Ok(());
            };
            let last_seq = inner.last_seq.get(&session_id).copied();
            (
                inner.outbound.clone(),
                ClientMessage::Subscribe {
                    session_id,
                    last_seq,
                },
            )
        };
        match tx {
            Some(tx) if self.state().is_authenticated() => {
                let json = serde_json::to_string(&msg)?;
                tx.send(json)
                    .await
                    .map_err(|_| SessionError::NotAuthenticated)
            }
            // re-sent on the next authenticated link
            _ => Ok(()),
        }
    }

    /// Highest sequence delivered for `session_id` on any link.
    pub async fn last_delivered(&self, session_id: &ConversationId) -> Option<u64> {
        self.core.inner.lock().await.last_seq.get(session_id).copied()
    }

    async fn teardown(&self) {
        let mut inner = self.core.inner.lock().await;
        if let Some(cancel) = inner.link_cancel.take() {
            cancel.cancel();
        }
        inner.outbound = None;
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}

impl<C: Connector> Core<C> {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            info!(state = next.name(), "connection state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn handshake(&self, mut link: Link, token: &str) -> Result<Link, SessionError> {
        let hello = serde_json::to_string(&ClientMessage::Authenticate {
            token: token.to_string(),
        })?;
        link.outgoing
            .send(hello)
            .await
            .map_err(|_| SessionError::Transport("link closed during handshake".to_string()))?;

        let reply = tokio::time::timeout(self.policy.handshake_timeout, link.incoming.recv())
            .await
            .map_err(|_| SessionError::Transport("handshake timed out".to_string()))?
            .ok_or_else(|| SessionError::Transport("link closed during handshake".to_string()))?;

        match ServerMessage::parse(&reply)? {
            ServerMessage::AuthOk { connection_id } => {
                debug!(connection_id = ?connection_id, "authenticated");
                Ok(link)
            }
            ServerMessage::AuthRejected { reason } => {
                warn!(reason = %reason, "authentication rejected");
                Err(SessionError::AuthRejected { reason })
            }
            other => Err(SessionError::Protocol(format!(
                "expected auth_ok, got {other:?}"
            ))),
        }
    }

    /// Make an authenticated link the current one: re-subscribe, expose the
    /// outbound side to `send`, and flip the state. Returns `None` if `cancel`
    /// already fired, i.e. a newer `connect` or `disconnect` took over.
    async fn attach_link(
        &self,
        link: Link,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<String>> {
        let Link { outgoing, incoming } = link;
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(session_id) = inner.subscription.clone() {
            let last_seq = inner.last_seq.get(&session_id).copied();
            debug!(session_id = %session_id, last_seq = ?last_seq, "re-subscribing");
            let msg = ClientMessage::Subscribe {
                session_id,
                last_seq,
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = outgoing.send(json).await;
            }
        }
        inner.outbound = Some(outgoing);
        inner.link_cancel = Some(cancel.clone());
        self.set_state(ConnectionState::Authenticated);
        Some(incoming)
    }

    /// Move to `next` on behalf of the link owned by `cancel`. Checked under
    /// the lock `teardown` cancels under, so a superseded link never touches
    /// its successor's state.
    async fn set_link_state(&self, cancel: &CancellationToken, next: ConnectionState) -> bool {
        let _inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        self.set_state(next);
        true
    }

    /// End the link owned by `cancel` and move to `next`. No-op if that link
    /// was already superseded.
    async fn retire_link(&self, cancel: &CancellationToken, next: ConnectionState) -> bool {
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        cancel.cancel();
        inner.outbound = None;
        inner.link_cancel = None;
        self.set_state(next);
        true
    }

    /// Handle one inbound text. Returns false when the connection must end.
    async fn handle_text(&self, text: &str, cancel: &CancellationToken) -> bool {
        let msg = match ServerMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable server message");
                return true;
            }
        };
        match msg {
            ServerMessage::AuthRejected { reason } => {
                warn!(reason = %reason, "server revoked authentication");
                if self.retire_link(cancel, ConnectionState::Disconnected).await {
                    self.emit(ConnectionEvent::AuthRejected { reason });
                }
                false
            }
            ServerMessage::AuthOk { .. } => true,
            other => {
                let Some(frame) = other.into_frame() else {
                    return true;
                };
                let session_id = frame.conversation_id.clone();
                let sequence = frame.sequence;
                // waits while the consumer is behind; the resume cursor only
                // moves once the frame is queued
                tokio::select! {
                    _ = cancel.cancelled() => return true,
                    sent = self.frame_tx.send(frame) => {
                        if sent.is_err() {
                            debug!("frame consumer gone, dropping frame");
                            return true;
                        }
                    }
                }
                if let Some(id) = session_id {
                    let mut inner = self.inner.lock().await;
                    let seq = inner.last_seq.entry(id).or_insert(sequence);
                    *seq = (*seq).max(sequence);
                }
                true
            }
        }
    }

    /// Backoff loop after a transport loss. Returns the incoming side of the
    /// new link, or `None` if the connection is over or was taken over.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<mpsc::Receiver<String>> {
        for attempt in 1..=self.policy.max_retries {
            if !self
                .set_link_state(cancel, ConnectionState::Reconnecting { attempt })
                .await
            {
                return None;
            }
            let delay = self.policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(token) = self.inner.lock().await.token.clone() else {
                self.retire_link(cancel, ConnectionState::Disconnected).await;
                return None;
            };

            info!(attempt, "reconnection attempt");
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return None,
                dialed = self.connector.dial() => dialed,
            };
            let link = match dialed {
                Ok(link) => link,
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect failed");
                    continue;
                }
            };
            let handshake = tokio::select! {
                _ = cancel.cancelled() => return None,
                handshake = self.handshake(link, &token) => handshake,
            };
            match handshake {
                Ok(link) => {
                    let incoming = self.attach_link(link, cancel).await?;
                    info!(attempt, "reconnected");
                    self.emit(ConnectionEvent::Resumed { attempts: attempt });
                    return Some(incoming);
                }
                Err(SessionError::AuthRejected { reason }) => {
                    if self.retire_link(cancel, ConnectionState::Disconnected).await {
                        self.emit(ConnectionEvent::AuthRejected { reason });
                    }
                    return None;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect handshake failed");
                }
            }
        }

        if self.retire_link(cancel, ConnectionState::Disconnected).await {
            warn!(attempts = self.policy.max_retries, "giving up reconnecting");
            self.emit(ConnectionEvent::RetriesExhausted {
                attempts: self.policy.max_retries,
            });
        }
        None
    }
}

/// Pump one connection: deliver frames, and on transport loss run the
/// reconnection policy and continue on the new link.
async fn run_link<C: Connector>(
    core: Arc<Core<C>>,
    mut incoming: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = incoming.recv() => match msg {
                    Some(text) => {
                        if !core.handle_text(&text, &cancel).await {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }

        {
            let mut inner = core.inner.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            inner.outbound = None;
        }
        info!("connection lost, will attempt reconnection");

        match core.reconnect(&cancel).await {
            Some(next) => incoming = next,
            None => return,
        }
    }
}
