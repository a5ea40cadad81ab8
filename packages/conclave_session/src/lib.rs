//! Client-side session core for a multi-model chat client.
//!
//! Keeps three things consistent while frames stream in over one real-time
//! connection: which conversation is active, which messages belong to which
//! conversation, and whether the connection may carry traffic.
//!
//! - [`ConnectionManager`] owns the authenticated connection and reconnects
//!   with backoff.
//! - [`SessionBinding`] tracks the active conversation, including the window
//!   before a new conversation has an id.
//! - [`MessageReconciler`] routes every inbound frame to the right log.
//! - [`SessionController`] composes them and is what presentation talks to.

pub mod binding;
pub mod connection;
pub mod controller;
pub mod error;
pub mod log;
pub mod model;
pub mod protocol;
pub mod reconciler;
pub mod storage;
pub mod transport;

pub use binding::{BindingState, PendingBinding, SessionBinding};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, FrameStream, ReconnectPolicy,
};
pub use controller::{AuthSnapshot, ControllerEvent, SessionConfig, SessionController};
pub use error::{Recovery, SessionError};
pub use log::{ConversationLog, LogStore, Message, Role};
pub use model::{CombineMode, ModelCatalog, ModelInfo, ModelRef, ModelSelection};
pub use protocol::{
    ClientMessage, ClientRequestId, ConversationId, FrameKind, InboundFrame, ServerMessage,
};
pub use reconciler::{DropReason, IngestOutcome, MessageReconciler, ReconcilerSnapshot};
pub use storage::{
    ConversationStore, ConversationSummary, HttpConversationStore, MemoryConversationStore,
};
pub use transport::{Connector, Link, MemoryConnector, MemoryListener, ServerEnd, WsConnector};
