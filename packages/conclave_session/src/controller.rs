//! SessionController: the top-level coordinator presentation talks to.
//!
//! Composes the binding, the reconciler, the retained logs and the shared
//! `ConnectionManager`. Every mutation of binding and logs, whether from a
//! user action or an inbound frame, happens inside one critical section, so
//! an action or a frame is processed to completion before the next.
//!
//! The controller arms no timers of its own. [`SessionController::run`]
//! sleeps until the binding's creation deadline and reacts to frames and
//! connection events as they arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::{BindingState, DEFAULT_CREATION_TIMEOUT, SessionBinding};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::SessionError;
use crate::log::{ConversationLog, DEFAULT_MAX_CACHED_CONVERSATIONS, LogStore, Message};
use crate::model::{ModelCatalog, ModelSelection};
use crate::protocol::{ClientMessage, ClientRequestId, ConversationId, InboundFrame};
use crate::reconciler::{IngestOutcome, MessageReconciler, ReconcilerSnapshot};
use crate::storage::{ConversationStore, ConversationSummary};
use crate::transport::Connector;

const CONTROLLER_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for `session_created` after the first message of a
    /// new conversation was sent.
    pub creation_timeout: Duration,
    pub max_cached_conversations: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            max_cached_conversations: DEFAULT_MAX_CACHED_CONVERSATIONS,
        }
    }
}

/// What the auth provider currently reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthSnapshot {
    pub is_authenticated: bool,
    pub token: Option<String>,
}

impl AuthSnapshot {
    pub fn signed_in(token: impl Into<String>) -> Self {
        Self {
            is_authenticated: true,
            token: Some(token.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

/// Observable changes for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The displayed log changed.
    LogUpdated { session_id: Option<ConversationId> },
    /// Fetched history was merged into the displayed log; earlier entries
    /// may have been inserted, so presentation redraws it.
    HistoryLoaded { session_id: ConversationId },
    /// A retained off-screen log changed.
    OffscreenUpdated { session_id: ConversationId },
    /// A new conversation received its id.
    Bound { session_id: ConversationId },
    /// No `session_created` arrived in time; the user must resend.
    CreationTimedOut,
    Connection(ConnectionEvent),
}

struct State {
    binding: SessionBinding,
    logs: LogStore,
    selection: ModelSelection,
    catalog: ModelCatalog,
}

impl State {
    fn is_cached(&self, id: &ConversationId) -> bool {
        self.logs.get(id).is_some_and(ConversationLog::is_hydrated)
    }

    /// The log on screen. While creating, it is assembled from the pending
    /// echoes and buffered frames.
    fn displayed_log(&self) -> ConversationLog {
        match self.binding.state() {
            BindingState::Creating(pending) => {
                let mut log = ConversationLog::new();
                for message in pending.outbound() {
                    log.push_local(message.clone());
                }
                for frame in pending.buffered_frames() {
                    if let Some(message) = Message::from_frame(frame) {
                        log.push_local(message);
                    }
                }
                log
            }
            _ => self
                .binding
                .active_id()
                .and_then(|id| self.logs.get(id))
                .cloned()
                .unwrap_or_default(),
        }
    }
}

pub struct SessionController<C: Connector, S: ConversationStore> {
    connection: Arc<ConnectionManager<C>>,
    store: Arc<S>,
    reconciler: MessageReconciler,
    state: Mutex<State>,
    deadline_changed: Notify,
    events: broadcast::Sender<ControllerEvent>,
}

impl<C: Connector, S: ConversationStore> SessionController<C, S> {
    pub fn new(connection: Arc<ConnectionManager<C>>, store: Arc<S>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(CONTROLLER_EVENT_CAPACITY);
        Self {
            connection,
            store,
            reconciler: MessageReconciler::new(),
            state: Mutex::new(State {
                binding: SessionBinding::new(config.creation_timeout),
                logs: LogStore::new(config.max_cached_conversations),
                selection: ModelSelection::default(),
                catalog: ModelCatalog::default(),
            }),
            deadline_changed: Notify::new(),
            events,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    // -- user actions --

    /// Start a brand-new conversation and clear the display. The id arrives
    /// with `session_created` after the first message is sent.
    pub async fn new_chat(&self) -> ClientRequestId {
        let request_id = {
            let mut st = self.state.lock().await;
            let request_id = st.binding.start_new_conversation();
            st.logs.set_active(None);
            request_id
        };
        self.follow(None).await;
        self.deadline_changed.notify_one();
        self.emit(ControllerEvent::LogUpdated { session_id: None });
        request_id
    }

    /// Show conversation `id`. History is fetched from storage unless the
    /// log is already retained; frames that arrive meanwhile land in the
    /// displayed log and are kept after the fetched history.
    pub async fn switch_to(&self, id: ConversationId) -> Result<(), SessionError> {
        let cached = {
            let mut st = self.state.lock().await;
            st.binding.select_conversation(id.clone());
            let cached = st.is_cached(&id);
            st.logs.set_active(Some(id.clone()));
            if cached {
                st.binding.finish_switch(&id);
            } else if let Some(log) = st.logs.get_mut(&id) {
                log.begin_history_fetch();
            }
            cached
        };
        self.follow(Some(id.clone())).await;
        self.deadline_changed.notify_one();
        self.emit(ControllerEvent::LogUpdated {
            session_id: Some(id.clone()),
        });
        if cached {
            debug!(session_id = %id, "switched to cached conversation");
            return Ok(());
        }

        let fetched = self.store.fetch_history(&id).await;

        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let result = match fetched {
            Ok(history) => {
                match st.logs.get_mut(&id) {
                    Some(log) => log.merge_history(history),
                    None => st.logs.insert(id.clone(), ConversationLog::from_history(history)),
                }
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "history fetch failed");
                Err(e)
            }
        };
        let on_screen = st.binding.active_id() == Some(&id);
        if st.binding.finish_switch(&id) {
            info!(session_id = %id, "binding: bound");
        }
        drop(guard);
        if on_screen && result.is_ok() {
            self.emit(ControllerEvent::HistoryLoaded { session_id: id });
        }
        result
    }

    /// Send `text` with `selection`. Fails with `NotAuthenticated`, without
    /// touching the network, unless the connection is authenticated. The
    /// first message of a new conversation carries the client request id.
    pub async fn send_message(
        &self,
        text: &str,
        selection: &ModelSelection,
    ) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if !self.connection.state().is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        let selection = selection.validate(&st.catalog)?;

        let (session_id, request_id) = match st.binding.state() {
            BindingState::Bound(id) | BindingState::Switching { to: id, .. } => {
                (Some(id.clone()), None)
            }
            BindingState::Creating(pending) => (None, Some(pending.request_id().clone())),
            BindingState::Unbound => {
                let request_id = st.binding.start_new_conversation();
                st.logs.set_active(None);
                (None, Some(request_id))
            }
        };

        let msg = ClientMessage::SendMessage {
            client_request_id: request_id.clone(),
            session_id: session_id.clone(),
            text: text.to_string(),
            model_selection: selection,
        };
        self.connection.send(&msg).await?;

        let echo = Message::user(text);
        match &session_id {
            Some(id) => {
                if let Some(log) = st.logs.get_mut(id) {
                    log.push_local(echo);
                }
            }
            None => {
                st.binding.push_outbound(echo);
                if st.binding.arm_creation_timeout(Instant::now()).is_some() {
                    debug!(request_id = ?request_id.as_ref().map(|r| r.as_str()), "creation timeout armed");
                }
                self.deadline_changed.notify_one();
            }
        }
        drop(guard);
        self.emit(ControllerEvent::LogUpdated { session_id });
        Ok(())
    }

    /// Send `text` with the stored model selection.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        let selection = self.state.lock().await.selection.clone();
        self.send_message(text, &selection).await
    }

    /// Store the selection used by subsequent `send` calls. Messages already
    /// sent are not affected.
    pub async fn set_model_selection(&self, selection: ModelSelection) {
        self.state.lock().await.selection = selection;
    }

    pub async fn model_selection(&self) -> ModelSelection {
        self.state.lock().await.selection.clone()
    }

    /// Fetch the catalog used to validate selections.
    pub async fn refresh_models(&self) -> Result<ModelCatalog, SessionError> {
        let catalog = self.store.list_models().await?;
        self.state.lock().await.catalog = catalog.clone();
        Ok(catalog)
    }

    pub async fn catalog(&self) -> ModelCatalog {
        self.state.lock().await.catalog.clone()
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        self.store.list_conversations().await
    }

    /// Create an empty conversation through storage and show it.
    pub async fn create_conversation(&self) -> Result<ConversationId, SessionError> {
        let id = self.store.create_conversation().await?;
        {
            let mut st = self.state.lock().await;
            st.binding.select_conversation(id.clone());
            let mut log = ConversationLog::new();
            log.mark_hydrated();
            st.logs.insert(id.clone(), log);
            st.logs.set_active(Some(id.clone()));
            st.binding.finish_switch(&id);
        }
        self.follow(Some(id.clone())).await;
        self.deadline_changed.notify_one();
        self.emit(ControllerEvent::LogUpdated {
            session_id: Some(id.clone()),
        });
        Ok(id)
    }

    /// Delete a conversation server-side and forget its log. Deleting the
    /// active conversation leaves the controller unbound.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<(), SessionError> {
        self.store.delete_conversation(id).await?;
        let was_active = {
            let mut st = self.state.lock().await;
            let was_active = st.binding.active_id() == Some(id);
            if was_active {
                st.binding.reset();
            }
            st.logs.remove(id);
            was_active
        };
        info!(session_id = %id, was_active, "conversation deleted");
        if was_active {
            self.follow(None).await;
            self.emit(ControllerEvent::LogUpdated { session_id: None });
        }
        Ok(())
    }

    /// Apply a change reported by the auth provider. A new token reconnects;
    /// signing out disconnects.
    pub async fn on_auth_changed(&self, auth: AuthSnapshot) -> Result<(), SessionError> {
        let token = auth.token.filter(|_| auth.is_authenticated);
        self.store.set_token(token.clone()).await;
        match token {
            None => {
                info!("signed out, disconnecting");
                self.connection.disconnect().await;
                Ok(())
            }
            Some(token) if self.connection.state() == ConnectionState::Disconnected => {
                self.connection.connect(&token).await
            }
            Some(token) => self.connection.set_token(&token).await,
        }
    }

    // -- inbound --

    /// Route one inbound frame. Normally called by [`run`](Self::run).
    pub async fn ingest(&self, frame: InboundFrame) -> IngestOutcome {
        let outcome = {
            let mut guard = self.state.lock().await;
            let State { binding, logs, .. } = &mut *guard;
            self.reconciler.ingest(binding, logs, frame)
        };
        match &outcome {
            IngestOutcome::Bound {
                session_id,
                flushed,
            } => {
                debug!(session_id = %session_id, flushed, "new conversation bound");
                self.follow(Some(session_id.clone())).await;
                self.deadline_changed.notify_one();
                self.emit(ControllerEvent::Bound {
                    session_id: session_id.clone(),
                });
                self.emit(ControllerEvent::LogUpdated {
                    session_id: Some(session_id.clone()),
                });
            }
            IngestOutcome::Buffered => {
                self.emit(ControllerEvent::LogUpdated { session_id: None });
            }
            IngestOutcome::Applied { session_id } => {
                self.emit(ControllerEvent::LogUpdated {
                    session_id: Some(session_id.clone()),
                });
            }
            IngestOutcome::AppliedOffscreen { session_id } => {
                self.emit(ControllerEvent::OffscreenUpdated {
                    session_id: session_id.clone(),
                });
            }
            IngestOutcome::Dropped(_) => {}
        }
        outcome
    }

    /// Expire a pending creation whose deadline has passed.
    pub async fn check_timeout(&self) -> Result<(), SessionError> {
        let result = self.state.lock().await.binding.check_timeout(Instant::now());
        if result.is_err() {
            self.emit(ControllerEvent::CreationTimedOut);
            self.emit(ControllerEvent::LogUpdated { session_id: None });
        }
        result
    }

    async fn creation_deadline(&self) -> Option<Instant> {
        self.state.lock().await.binding.creation_deadline()
    }

    /// Drive the controller: ingest frames, expire pending creations and
    /// forward connection events, until `shutdown` fires or the connection
    /// manager is gone. Only the first call does anything.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(mut frames) = self.connection.take_frames().await else {
            warn!("session controller driver already running");
            return;
        };
        let mut conn_events = self.connection.events();

        loop {
            let deadline = self.creation_deadline().await;
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        self.ingest(frame).await;
                    }
                    None => break,
                },
                _ = expiry => {
                    let _ = self.check_timeout().await;
                }
                _ = self.deadline_changed.notified() => {}
                event = conn_events.recv() => match event {
                    Ok(event) => self.emit(ControllerEvent::Connection(event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("session controller driver stopped");
    }

    /// Point the connection's subscription at `id`. A failed subscribe is
    /// retried by the connection on its next authenticated link.
    async fn follow(&self, id: Option<ConversationId>) {
        if let Err(e) = self.connection.subscribe(id).await {
            debug!(error = %e, "subscribe deferred");
        }
    }

    // -- observable state --

    pub async fn binding_state(&self) -> BindingState {
        self.state.lock().await.binding.state().clone()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.state.lock().await.binding.active_id().cloned()
    }

    /// Raw entries of the displayed log.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.displayed_log().entries().to_vec()
    }

    /// Displayed log with streamed tokens coalesced.
    pub async fn transcript(&self) -> Vec<Message> {
        self.state.lock().await.displayed_log().transcript()
    }

    /// Retained log for any conversation, on screen or not.
    pub async fn log_for(&self, id: &ConversationId) -> Option<ConversationLog> {
        self.state.lock().await.logs.get(id).cloned()
    }

    pub async fn cached_conversations(&self) -> usize {
        self.state.lock().await.logs.len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn stats(&self) -> ReconcilerSnapshot {
        self.reconciler.stats()
    }
}
