//! Wire protocol types
//!
//! Messages exchanged with the chat server over the real-time channel. The
//! wire enums are what serde sees; `InboundFrame` is the domain view the
//! reconciler routes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::model::{ModelRef, ModelSelection};

/// Server-issued conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Client-generated id that ties the first message of a new conversation to
/// the server's `session_created` answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientRequestId(String);

impl ClientRequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientRequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClientRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every link; the server answers `auth_ok` or `auth_rejected`.
    Authenticate { token: String },

    /// Follow a conversation. `last_seq` lets the server replay only frames
    /// the client has not applied yet.
    Subscribe {
        session_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<u64>,
    },

    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_request_id: Option<ClientRequestId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<ConversationId>,
        text: String,
        model_selection: ModelSelection,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPayload {
    pub session_id: ConversationId,
    pub client_request_id: ClientRequestId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    AuthRejected {
        #[serde(default)]
        reason: String,
    },
    Token {
        session_id: Option<ConversationId>,
        sequence: u64,
        payload: TextPayload,
    },
    Final {
        session_id: Option<ConversationId>,
        sequence: u64,
        payload: TextPayload,
    },
    SessionCreated {
        #[serde(default)]
        session_id: Option<ConversationId>,
        sequence: u64,
        payload: CreatedPayload,
    },
    Error {
        session_id: Option<ConversationId>,
        sequence: u64,
        #[serde(default)]
        payload: ErrorPayload,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The conversation frame carried by this message, if it is not a
    /// handshake message.
    pub fn into_frame(self) -> Option<InboundFrame> {
        let (conversation_id, sequence, kind) = match self {
            Self::AuthOk { .. } | Self::AuthRejected { .. } => return None,
            Self::Token {
                session_id,
                sequence,
                payload,
            } => (
                session_id,
                sequence,
                FrameKind::Token {
                    text: payload.text,
                    model: payload.model,
                },
            ),
            Self::Final {
                session_id,
                sequence,
                payload,
            } => (
                session_id,
                sequence,
                FrameKind::Final {
                    text: payload.text,
                    model: payload.model,
                },
            ),
            Self::SessionCreated {
                session_id,
                sequence,
                payload,
            } => (
                session_id,
                sequence,
                FrameKind::SessionCreated {
                    session_id: payload.session_id,
                    client_request_id: payload.client_request_id,
                },
            ),
            Self::Error {
                session_id,
                sequence,
                payload,
            } => (
                session_id,
                sequence,
                FrameKind::Error {
                    message: payload.message,
                },
            ),
        };
        Some(InboundFrame {
            conversation_id,
            sequence,
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Token {
        text: String,
        model: Option<ModelRef>,
    },
    Final {
        text: String,
        model: Option<ModelRef>,
    },
    SessionCreated {
        session_id: ConversationId,
        client_request_id: ClientRequestId,
    },
    Error {
        message: String,
    },
}

impl FrameKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Final { .. } => "final",
            Self::SessionCreated { .. } => "session_created",
            Self::Error { .. } => "error",
        }
    }
}

/// One unit of conversation data received over the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// `None` for `session_created` announcements and for frames streamed
    /// before the new conversation's id has been announced.
    pub conversation_id: Option<ConversationId>,
    pub sequence: u64,
    pub kind: FrameKind,
}

impl InboundFrame {
    pub fn token(conversation_id: Option<ConversationId>, sequence: u64, text: &str) -> Self {
        Self {
            conversation_id,
            sequence,
            kind: FrameKind::Token {
                text: text.to_string(),
                model: None,
            },
        }
    }

    pub fn final_text(conversation_id: Option<ConversationId>, sequence: u64, text: &str) -> Self {
        Self {
            conversation_id,
            sequence,
            kind: FrameKind::Final {
                text: text.to_string(),
                model: None,
            },
        }
    }

    pub fn session_created(
        sequence: u64,
        session_id: ConversationId,
        client_request_id: ClientRequestId,
    ) -> Self {
        Self {
            conversation_id: None,
            sequence,
            kind: FrameKind::SessionCreated {
                session_id,
                client_request_id,
            },
        }
    }

    pub fn with_model(mut self, model: ModelRef) -> Self {
        match &mut self.kind {
            FrameKind::Token { model: m, .. } | FrameKind::Final { model: m, .. } => {
                *m = Some(model)
            }
            _ => {}
        }
        self
    }
}
