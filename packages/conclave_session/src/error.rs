//! Error taxonomy for the session engine, with stable codes and recovery classes.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

use crate::model::ModelRef;
use crate::protocol::ConversationId;

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Obtain a fresh token and connect again.
    Reauthenticate,
    /// Wait for the connection to become authenticated, then retry.
    WaitForConnection,
    /// The user should retry the action.
    Retry,
    /// Absorbed internally; nothing to do.
    None,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("authentication rejected: {reason}")]
    AuthRejected { reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("conversation was not created within the timeout")]
    SessionCreationTimeout,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("stale frame for {conversation}: sequence {sequence} <= {last_applied}")]
    SequenceRegression {
        conversation: ConversationId,
        sequence: u64,
        last_applied: u64,
    },

    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("no models selected")]
    NoModelsSelected,

    #[error("unknown model: {0}")]
    UnknownModel(ModelRef),

    #[error("conversation storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthRejected { .. } => "auth_rejected",
            Self::Transport(_) => "transport_error",
            Self::SessionCreationTimeout => "session_creation_timeout",
            Self::NotAuthenticated => "not_authenticated",
            Self::SequenceRegression { .. } => "sequence_regression",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::NoModelsSelected => "no_models_selected",
            Self::UnknownModel(_) => "unknown_model",
            Self::Storage(_) => "storage_error",
            Self::Protocol(_) => "protocol_error",
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::AuthRejected { .. } => Recovery::Reauthenticate,
            Self::NotAuthenticated => Recovery::WaitForConnection,
            Self::SessionCreationTimeout
            | Self::RetriesExhausted { .. }
            | Self::Storage(_)
            | Self::NoModelsSelected
            | Self::UnknownModel(_) => Recovery::Retry,
            Self::Transport(_) | Self::SequenceRegression { .. } | Self::Protocol(_) => {
                Recovery::None
            }
        }
    }

    /// Whether the error can be resolved without re-authenticating.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::AuthRejected { .. })
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Transport(err.to_string())
        } else {
            Self::Storage(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
