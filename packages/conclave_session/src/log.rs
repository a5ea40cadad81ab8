//! Per-conversation message logs and the bounded store that retains them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::model::ModelRef;
use crate::protocol::{ConversationId, FrameKind, InboundFrame};

/// Default number of conversation logs kept client-side.
pub const DEFAULT_MAX_CACHED_CONVERSATIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_source: Option<ModelRef>,
    pub created_at: DateTime<Utc>,
    /// Sequence of the frame this entry came from. `None` for local echoes
    /// and fetched history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Streaming token, not yet closed by a `final` frame.
    #[serde(default)]
    pub partial: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            model_source: None,
            created_at: Utc::now(),
            sequence: None,
            partial: false,
        }
    }

    pub fn assistant(text: impl Into<String>, model: Option<ModelRef>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            model_source: model,
            created_at: Utc::now(),
            sequence: None,
            partial: false,
        }
    }

    /// Convert a conversation frame into a log entry. `session_created`
    /// frames never become entries.
    pub fn from_frame(frame: &InboundFrame) -> Option<Self> {
        let (role, text, model_source, partial) = match &frame.kind {
            FrameKind::Token { text, model } => (Role::Assistant, text.clone(), model.clone(), true),
            FrameKind::Final { text, model } => {
                (Role::Assistant, text.clone(), model.clone(), false)
            }
            FrameKind::Error { message } => (Role::System, message.clone(), None, false),
            FrameKind::SessionCreated { .. } => return None,
        };
        Some(Self {
            role,
            text,
            model_source,
            created_at: Utc::now(),
            sequence: Some(frame.sequence),
            partial,
        })
    }
}

/// Ordered, append-only log of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationLog {
    entries: Vec<Message>,
    last_seq: Option<u64>,
    /// Holds the server-side history, so switching back needs no fetch.
    hydrated: bool,
    /// Entry count when the pending history fetch began.
    fetch_mark: Option<usize>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(messages: Vec<Message>) -> Self {
        let mut log = Self::new();
        log.merge_history(messages);
        log
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Mark a log that is complete without a fetch, e.g. one that started
    /// client-side.
    pub fn mark_hydrated(&mut self) {
        self.hydrated = true;
    }

    /// Record that a history fetch is starting. Local echoes appended after
    /// this point survive [`merge_history`](Self::merge_history).
    pub fn begin_history_fetch(&mut self) {
        self.fetch_mark = Some(self.entries.len());
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest frame sequence applied, or `None` if no frame was applied yet.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Append a frame, enforcing strictly increasing sequence numbers.
    pub fn apply_frame(
        &mut self,
        conversation: &ConversationId,
        frame: &InboundFrame,
    ) -> Result<(), SessionError> {
        if let Some(last) = self.last_seq {
            if frame.sequence <= last {
                return Err(SessionError::SequenceRegression {
                    conversation: conversation.clone(),
                    sequence: frame.sequence,
                    last_applied: last,
                });
            }
        }
        if let Some(message) = Message::from_frame(frame) {
            self.entries.push(message);
        }
        self.last_seq = Some(frame.sequence);
        Ok(())
    }

    /// Append a locally produced entry (user echo). Does not touch sequence
    /// bookkeeping.
    pub fn push_local(&mut self, message: Message) {
        self.entries.push(message);
    }

    /// Put fetched history in front of the live entries. Frames the history
    /// already covers are dropped, as are local echoes from before the fetch
    /// began; echoes sent since then stay, in order.
    pub fn merge_history(&mut self, history: Vec<Message>) {
        let covered = history.iter().filter_map(|m| m.sequence).max();
        let mark = self.fetch_mark.take().unwrap_or(0);
        let live: Vec<Message> = self
            .entries
            .drain(..)
            .enumerate()
            .filter(|(idx, m)| match (m.sequence, covered) {
                (Some(seq), Some(hw)) => seq > hw,
                (Some(_), None) => true,
                (None, _) => *idx >= mark,
            })
            .map(|(_, m)| m)
            .collect();
        self.hydrated = true;
        self.entries = history;
        self.entries.extend(live);
        if let Some(hw) = covered {
            self.last_seq = Some(self.last_seq.map_or(hw, |last| last.max(hw)));
        }
    }

    /// Display view: consecutive tokens from the same model are joined into
    /// one message; a `final` entry closes it. A non-empty final text is the
    /// complete answer and replaces the streamed text.
    pub fn transcript(&self) -> Vec<Message> {
        let mut out: Vec<Message> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let open = out.last_mut().filter(|last| {
                last.partial
                    && last.role == Role::Assistant
                    && entry.role == Role::Assistant
                    && last.model_source == entry.model_source
            });
            match open {
                Some(last) if entry.partial => {
                    last.text.push_str(&entry.text);
                    last.sequence = entry.sequence;
                }
                Some(last) => {
                    if !entry.text.is_empty() {
                        last.text = entry.text.clone();
                    }
                    last.partial = false;
                    last.sequence = entry.sequence;
                }
                None => out.push(entry.clone()),
            }
        }
        out
    }
}

/// Conversation logs retained client-side, bounded by a least-recently-viewed
/// eviction order. The active conversation is never evicted.
#[derive(Debug)]
pub struct LogStore {
    logs: HashMap<ConversationId, ConversationLog>,
    /// Front = least recently touched.
    recency: VecDeque<ConversationId>,
    active: Option<ConversationId>,
    capacity: usize,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: HashMap::new(),
            recency: VecDeque::new(),
            active: None,
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.logs.contains_key(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationLog> {
        self.logs.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut ConversationLog> {
        self.logs.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Mark the conversation on screen. Creates an empty log for it if none
    /// is retained.
    pub fn set_active(&mut self, id: Option<ConversationId>) {
        if let Some(id) = &id {
            if !self.logs.contains_key(id) {
                self.insert(id.clone(), ConversationLog::new());
            }
            self.touch(id);
        }
        self.active = id;
        self.evict();
    }

    pub fn insert(&mut self, id: ConversationId, log: ConversationLog) {
        self.logs.insert(id.clone(), log);
        self.touch(&id);
        self.evict();
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<ConversationLog> {
        self.recency.retain(|r| r != id);
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
        self.logs.remove(id)
    }

    fn touch(&mut self, id: &ConversationId) {
        self.recency.retain(|r| r != id);
        self.recency.push_back(id.clone());
    }

    fn evict(&mut self) {
        while self.logs.len() > self.capacity {
            let Some(pos) = self
                .recency
                .iter()
                .position(|r| Some(r) != self.active.as_ref())
            else {
                break;
            };
            if let Some(victim) = self.recency.remove(pos) {
                tracing::debug!(session_id = %victim, "evicting cached conversation log");
                self.logs.remove(&victim);
            }
        }
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_CONVERSATIONS)
    }
}
