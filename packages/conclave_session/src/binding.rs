//! SessionBinding: which conversation is active, including the window before
//! the server has assigned an id to a brand-new conversation.
//!
//! ```text
//!   unbound ──start_new──▶ creating ──session_created(match)──▶ bound(id)
//!      ▲                      │                                   │
//!      └──────timeout─────────┘        select(id') ──▶ switching(id, id') ──finish──▶ bound(id')
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::log::Message;
use crate::protocol::{ClientRequestId, ConversationId, InboundFrame};

/// Default time to wait for `session_created` after the first message went out.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames and local echoes held while a new conversation has no id yet.
#[derive(Debug, Clone)]
pub struct PendingBinding {
    request_id: ClientRequestId,
    buffered: Vec<InboundFrame>,
    outbound: Vec<Message>,
    /// Armed when the first message is actually sent.
    deadline: Option<Instant>,
}

impl PendingBinding {
    fn new() -> Self {
        Self {
            request_id: ClientRequestId::generate(),
            buffered: Vec::new(),
            outbound: Vec::new(),
            deadline: None,
        }
    }

    pub fn request_id(&self) -> &ClientRequestId {
        &self.request_id
    }

    pub fn buffered_frames(&self) -> &[InboundFrame] {
        &self.buffered
    }

    pub fn outbound(&self) -> &[Message] {
        &self.outbound
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Local echoes first, then buffered frames in arrival order.
    pub fn into_parts(self) -> (Vec<Message>, Vec<InboundFrame>) {
        (self.outbound, self.buffered)
    }
}

#[derive(Debug, Clone)]
pub enum BindingState {
    Unbound,
    Creating(PendingBinding),
    Bound(ConversationId),
    /// Log for `to` is on screen; its history may still be loading.
    Switching {
        from: Option<ConversationId>,
        to: ConversationId,
    },
}

impl BindingState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Creating(_) => "creating",
            Self::Bound(_) => "bound",
            Self::Switching { .. } => "switching",
        }
    }
}

/// Result of delivering a `session_created` announcement.
#[derive(Debug)]
pub enum CreationOutcome {
    /// The announcement matched; the caller flushes `pending` into the new log.
    Bound {
        session_id: ConversationId,
        pending: PendingBinding,
    },
    /// No outstanding request, or a different one. Dropped.
    Stale,
}

#[derive(Debug)]
pub struct SessionBinding {
    state: BindingState,
    creation_timeout: Duration,
}

impl SessionBinding {
    pub fn new(creation_timeout: Duration) -> Self {
        Self {
            state: BindingState::Unbound,
            creation_timeout,
        }
    }

    pub fn state(&self) -> &BindingState {
        &self.state
    }

    pub fn is_creating(&self) -> bool {
        matches!(self.state, BindingState::Creating(_))
    }

    /// The conversation whose frames go to the displayed log.
    pub fn active_id(&self) -> Option<&ConversationId> {
        match &self.state {
            BindingState::Bound(id) | BindingState::Switching { to: id, .. } => Some(id),
            BindingState::Unbound | BindingState::Creating(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingBinding> {
        match &self.state {
            BindingState::Creating(p) => Some(p),
            _ => None,
        }
    }

    pub fn creation_deadline(&self) -> Option<Instant> {
        self.pending().and_then(|p| p.deadline)
    }

    /// Begin a new conversation. Any outstanding creation is abandoned: its
    /// buffered frames are discarded and a late `session_created` for it
    /// will not match.
    pub fn start_new_conversation(&mut self) -> ClientRequestId {
        if let BindingState::Creating(old) = &self.state {
            debug!(request_id = %old.request_id, "abandoning pending conversation");
        }
        let pending = PendingBinding::new();
        let request_id = pending.request_id.clone();
        self.state = BindingState::Creating(pending);
        info!(request_id = %request_id, "binding: creating");
        request_id
    }

    /// Start the creation timeout, if it is not already running.
    pub fn arm_creation_timeout(&mut self, now: Instant) -> Option<Instant> {
        let timeout = self.creation_timeout;
        match &mut self.state {
            BindingState::Creating(p) => Some(*p.deadline.get_or_insert(now + timeout)),
            _ => None,
        }
    }

    /// Hold a local echo until the conversation has an id.
    pub fn push_outbound(&mut self, message: Message) -> bool {
        match &mut self.state {
            BindingState::Creating(p) => {
                p.outbound.push(message);
                true
            }
            _ => false,
        }
    }

    /// Buffer a frame streamed for the not-yet-announced conversation.
    pub fn buffer_frame(&mut self, frame: InboundFrame) -> bool {
        match &mut self.state {
            BindingState::Creating(p) => {
                p.buffered.push(frame);
                true
            }
            _ => false,
        }
    }

    pub fn receive_session_created(
        &mut self,
        session_id: ConversationId,
        request_id: &ClientRequestId,
    ) -> CreationOutcome {
        let matches = matches!(
            &self.state,
            BindingState::Creating(p) if &p.request_id == request_id
        );
        if !matches {
            debug!(
                session_id = %session_id,
                request_id = %request_id,
                state = self.state.name(),
                "dropping stale session_created"
            );
            return CreationOutcome::Stale;
        }
        let prev = std::mem::replace(&mut self.state, BindingState::Bound(session_id.clone()));
        let BindingState::Creating(pending) = prev else {
            unreachable!("state checked above");
        };
        info!(
            session_id = %session_id,
            buffered = pending.buffered.len(),
            "binding: bound to new conversation"
        );
        CreationOutcome::Bound {
            session_id,
            pending,
        }
    }

    /// Move to `switching(current, id)`. Returns the conversation left behind.
    /// A pending creation is cancelled for display purposes.
    pub fn select_conversation(&mut self, id: ConversationId) -> Option<ConversationId> {
        let from = match &self.state {
            BindingState::Bound(cur) => Some(cur.clone()),
            BindingState::Switching { to, .. } => Some(to.clone()),
            BindingState::Creating(p) => {
                debug!(request_id = %p.request_id, "switch cancels pending creation");
                None
            }
            BindingState::Unbound => None,
        };
        info!(from = ?from.as_ref().map(|f| f.as_str()), to = %id, "binding: switching");
        self.state = BindingState::Switching {
            from: from.clone(),
            to: id,
        };
        from
    }

    /// Complete a switch. Ignored if the user has switched elsewhere since.
    pub fn finish_switch(&mut self, id: &ConversationId) -> bool {
        match &self.state {
            BindingState::Switching { to, .. } if to == id => {
                self.state = BindingState::Bound(id.clone());
                true
            }
            _ => false,
        }
    }

    /// Expire a creation whose deadline has passed: back to `unbound`,
    /// buffered frames discarded.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), SessionError> {
        let expired = matches!(
            &self.state,
            BindingState::Creating(p) if p.deadline.is_some_and(|d| d <= now)
        );
        if !expired {
            return Ok(());
        }
        if let BindingState::Creating(p) = std::mem::replace(&mut self.state, BindingState::Unbound) {
            warn!(
                request_id = %p.request_id,
                discarded = p.buffered.len(),
                "conversation creation timed out"
            );
        }
        Err(SessionError::SessionCreationTimeout)
    }

    /// Drop whatever is active (e.g. the active conversation was deleted).
    pub fn reset(&mut self) {
        self.state = BindingState::Unbound;
    }
}

impl Default for SessionBinding {
    fn default() -> Self {
        Self::new(DEFAULT_CREATION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> ConversationId {
        ConversationId::from(s)
    }

    #[test]
    fn starts_unbound() {
        let b = SessionBinding::default();
        assert!(matches!(b.state(), BindingState::Unbound));
        assert!(b.active_id().is_none());
    }

    #[test]
    fn create_then_bind() {
        let mut b = SessionBinding::default();
        let req = b.start_new_conversation();
        assert!(b.buffer_frame(InboundFrame::token(None, 1, "a")));

        match b.receive_session_created(cid("c1"), &req) {
            CreationOutcome::Bound {
                session_id,
                pending,
            } => {
                assert_eq!(session_id, cid("c1"));
                assert_eq!(pending.buffered_frames().len(), 1);
            }
            CreationOutcome::Stale => panic!("expected bind"),
        }
        assert_eq!(b.active_id(), Some(&cid("c1")));
    }

    #[test]
    fn mismatched_request_is_stale() {
        let mut b = SessionBinding::default();
        b.start_new_conversation();
        let other = ClientRequestId::from("someone-else");
        assert!(matches!(
            b.receive_session_created(cid("c1"), &other),
            CreationOutcome::Stale
        ));
        assert!(b.is_creating());
    }

    #[test]
    fn session_created_while_bound_is_stale() {
        let mut b = SessionBinding::default();
        let req = b.start_new_conversation();
        b.receive_session_created(cid("c1"), &req);
        // duplicate delivery after reconnect
        assert!(matches!(
            b.receive_session_created(cid("c1"), &req),
            CreationOutcome::Stale
        ));
        assert_eq!(b.active_id(), Some(&cid("c1")));
    }

    #[test]
    fn new_conversation_abandons_previous_request() {
        let mut b = SessionBinding::default();
        let first = b.start_new_conversation();
        b.buffer_frame(InboundFrame::token(None, 1, "old"));
        let second = b.start_new_conversation();
        assert_ne!(first, second);
        assert!(b.pending().unwrap().buffered_frames().is_empty());
        assert!(matches!(
            b.receive_session_created(cid("c1"), &first),
            CreationOutcome::Stale
        ));
    }

    #[test]
    fn buffer_only_while_creating() {
        let mut b = SessionBinding::default();
        assert!(!b.buffer_frame(InboundFrame::token(None, 1, "x")));
        assert!(!b.push_outbound(Message::user("x")));
    }

    #[test]
    fn switch_transitions() {
        let mut b = SessionBinding::default();
        let req = b.start_new_conversation();
        b.receive_session_created(cid("a"), &req);

        let from = b.select_conversation(cid("b"));
        assert_eq!(from, Some(cid("a")));
        assert!(matches!(b.state(), BindingState::Switching { .. }));
        assert_eq!(b.active_id(), Some(&cid("b")));

        assert!(!b.finish_switch(&cid("a")));
        assert!(b.finish_switch(&cid("b")));
        assert!(matches!(b.state(), BindingState::Bound(id) if id == &cid("b")));
    }

    #[test]
    fn switch_during_creation_cancels_pending() {
        let mut b = SessionBinding::default();
        let req = b.start_new_conversation();
        assert_eq!(b.select_conversation(cid("b")), None);
        assert!(b.pending().is_none());
        assert!(matches!(
            b.receive_session_created(cid("new"), &req),
            CreationOutcome::Stale
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_only_after_armed() {
        let mut b = SessionBinding::new(Duration::from_secs(5));
        b.start_new_conversation();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(b.check_timeout(Instant::now()).is_ok(), "not armed yet");

        let deadline = b.arm_creation_timeout(Instant::now()).unwrap();
        assert_eq!(b.creation_deadline(), Some(deadline));
        // re-arming keeps the original deadline
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.arm_creation_timeout(Instant::now()), Some(deadline));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(
            b.check_timeout(Instant::now()),
            Err(SessionError::SessionCreationTimeout)
        ));
        assert!(matches!(b.state(), BindingState::Unbound));
    }

    #[tokio::test(start_paused = true)]
    async fn late_session_created_after_timeout_is_ignored() {
        let mut b = SessionBinding::new(Duration::from_secs(1));
        let req = b.start_new_conversation();
        b.buffer_frame(InboundFrame::token(None, 1, "lost"));
        b.arm_creation_timeout(Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(b.check_timeout(Instant::now()).is_err());

        assert!(matches!(
            b.receive_session_created(cid("late"), &req),
            CreationOutcome::Stale
        ));
        assert!(matches!(b.state(), BindingState::Unbound));
    }
}
