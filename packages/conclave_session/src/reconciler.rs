//! MessageReconciler: routes each inbound frame to the conversation it
//! belongs to.
//!
//! Routing rules, in order:
//! 1. `session_created` goes to the binding; it never becomes a log entry.
//! 2. A frame without a conversation id is buffered while a new conversation
//!    is being created.
//! 3. A frame for the active conversation is appended to its log, provided
//!    its sequence is above the last one applied.
//! 4. A frame for any other conversation updates that conversation's retained
//!    log, or is dropped when no log is retained (history is refetched on
//!    switch).
//!
//! The reconciler never sends; it only reads frames.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binding::{CreationOutcome, SessionBinding};
use crate::error::SessionError;
use crate::log::{ConversationLog, LogStore};
use crate::protocol::{ConversationId, FrameKind, InboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Sequence at or below the last applied one (duplicate delivery).
    SequenceRegression,
    /// `session_created` that does not match the outstanding request.
    StaleSessionCreated,
    /// Frame for an off-screen conversation whose log is not retained.
    NotRetained,
    /// Frame without a conversation id while nothing is being created.
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new conversation got its id; `flushed` buffered frames were applied.
    Bound {
        session_id: ConversationId,
        flushed: usize,
    },
    Buffered,
    Applied {
        session_id: ConversationId,
    },
    AppliedOffscreen {
        session_id: ConversationId,
    },
    Dropped(DropReason),
}

/// Counters for routed and dropped frames
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    pub applied: AtomicU64,
    pub applied_offscreen: AtomicU64,
    pub buffered: AtomicU64,
    pub sequence_regressions: AtomicU64,
    pub stale_session_created: AtomicU64,
    pub not_retained: AtomicU64,
    pub orphans: AtomicU64,
}

impl ReconcilerStats {
    fn record(&self, outcome: &IngestOutcome) {
        let counter = match outcome {
            IngestOutcome::Bound { .. } => return,
            IngestOutcome::Buffered => &self.buffered,
            IngestOutcome::Applied { .. } => &self.applied,
            IngestOutcome::AppliedOffscreen { .. } => &self.applied_offscreen,
            IngestOutcome::Dropped(DropReason::SequenceRegression) => &self.sequence_regressions,
            IngestOutcome::Dropped(DropReason::StaleSessionCreated) => &self.stale_session_created,
            IngestOutcome::Dropped(DropReason::NotRetained) => &self.not_retained,
            IngestOutcome::Dropped(DropReason::Orphan) => &self.orphans,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            applied_offscreen: self.applied_offscreen.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            sequence_regressions: self.sequence_regressions.load(Ordering::Relaxed),
            stale_session_created: self.stale_session_created.load(Ordering::Relaxed),
            not_retained: self.not_retained.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciler counters (for serialization/logging)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerSnapshot {
    pub applied: u64,
    pub applied_offscreen: u64,
    pub buffered: u64,
    pub sequence_regressions: u64,
    pub stale_session_created: u64,
    pub not_retained: u64,
    pub orphans: u64,
}

#[derive(Debug, Default)]
pub struct MessageReconciler {
    stats: ReconcilerStats,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ReconcilerSnapshot {
        self.stats.snapshot()
    }

    pub fn ingest(
        &self,
        binding: &mut SessionBinding,
        logs: &mut LogStore,
        frame: InboundFrame,
    ) -> IngestOutcome {
        let outcome = self.route(binding, logs, frame);
        self.stats.record(&outcome);
        outcome
    }

    fn route(
        &self,
        binding: &mut SessionBinding,
        logs: &mut LogStore,
        frame: InboundFrame,
    ) -> IngestOutcome {
        if let FrameKind::SessionCreated {
            session_id,
            client_request_id,
        } = &frame.kind
        {
            return match binding.receive_session_created(session_id.clone(), client_request_id) {
                CreationOutcome::Bound {
                    session_id,
                    pending,
                } => self.flush_pending(logs, session_id, pending.into_parts()),
                CreationOutcome::Stale => IngestOutcome::Dropped(DropReason::StaleSessionCreated),
            };
        }

        let Some(conversation) = frame.conversation_id.clone() else {
            if binding.buffer_frame(frame) {
                return IngestOutcome::Buffered;
            }
            debug!("dropping frame without conversation id");
            return IngestOutcome::Dropped(DropReason::Orphan);
        };

        if binding.active_id() == Some(&conversation) {
            if !logs.contains(&conversation) {
                logs.set_active(Some(conversation.clone()));
            }
            let Some(log) = logs.get_mut(&conversation) else {
                return IngestOutcome::Dropped(DropReason::NotRetained);
            };
            return match apply(log, &conversation, &frame) {
                Ok(()) => IngestOutcome::Applied {
                    session_id: conversation,
                },
                Err(reason) => IngestOutcome::Dropped(reason),
            };
        }

        match logs.get_mut(&conversation) {
            Some(log) => match apply(log, &conversation, &frame) {
                Ok(()) => IngestOutcome::AppliedOffscreen {
                    session_id: conversation,
                },
                Err(reason) => IngestOutcome::Dropped(reason),
            },
            None => {
                debug!(session_id = %conversation, sequence = frame.sequence, "dropping frame for conversation not retained");
                IngestOutcome::Dropped(DropReason::NotRetained)
            }
        }
    }

    fn flush_pending(
        &self,
        logs: &mut LogStore,
        session_id: ConversationId,
        (outbound, buffered): (Vec<crate::log::Message>, Vec<InboundFrame>),
    ) -> IngestOutcome {
        let mut log = ConversationLog::new();
        log.mark_hydrated();
        for message in outbound {
            log.push_local(message);
        }
        let mut flushed = 0;
        for frame in &buffered {
            match apply(&mut log, &session_id, frame) {
                Ok(()) => flushed += 1,
                Err(_) => self.stats.record(&IngestOutcome::Dropped(DropReason::SequenceRegression)),
            }
        }
        logs.insert(session_id.clone(), log);
        logs.set_active(Some(session_id.clone()));
        IngestOutcome::Bound {
            session_id,
            flushed,
        }
    }
}

fn apply(
    log: &mut ConversationLog,
    conversation: &ConversationId,
    frame: &InboundFrame,
) -> Result<(), DropReason> {
    match log.apply_frame(conversation, frame) {
        Ok(()) => Ok(()),
        Err(SessionError::SequenceRegression {
            sequence,
            last_applied,
            ..
        }) => {
            debug!(
                session_id = %conversation,
                sequence,
                last_applied,
                "dropping duplicate frame"
            );
            Err(DropReason::SequenceRegression)
        }
        Err(_) => Err(DropReason::SequenceRegression),
    }
}
