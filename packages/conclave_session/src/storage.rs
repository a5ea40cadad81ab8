//! Conversation storage behind the server's HTTP API: listing, history,
//! deletion and the model catalog.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::SessionError;
use crate::log::Message;
use crate::model::{ModelCatalog, ModelInfo};
use crate::protocol::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: usize,
}

impl ConversationSummary {
    pub fn title_or_id(&self) -> &str {
        self.title.as_deref().unwrap_or(self.id.as_str())
    }
}

pub trait ConversationStore: Send + Sync + 'static {
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, SessionError>> + Send;

    /// Create an empty conversation server-side and return its id.
    fn create_conversation(
        &self,
    ) -> impl Future<Output = Result<ConversationId, SessionError>> + Send;

    /// Full server-side history, oldest first.
    fn fetch_history(
        &self,
        id: &ConversationId,
    ) -> impl Future<Output = Result<Vec<Message>, SessionError>> + Send;

    fn delete_conversation(
        &self,
        id: &ConversationId,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn list_models(&self) -> impl Future<Output = Result<ModelCatalog, SessionError>> + Send;

    /// Bearer token changed. Stores that do not authenticate ignore it.
    fn set_token(&self, _token: Option<String>) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CreatedBody {
    id: ConversationId,
}

/// `ConversationStore` over the server's REST endpoints:
/// - `GET    /api/conversations`
/// - `POST   /api/conversations`
/// - `GET    /api/conversations/{id}/messages`
/// - `DELETE /api/conversations/{id}`
/// - `GET    /api/models`
pub struct HttpConversationStore {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            token: RwLock::new(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.client.request(method, url);
        match self.token.read().await.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, SessionError> {
        let resp = req.send().await.map_err(SessionError::from_reqwest)?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SessionError::NotAuthenticated);
        }
        if !status.is_success() {
            let detail = match resp.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(SessionError::Storage(detail));
        }
        Ok(resp)
    }
}

impl ConversationStore for HttpConversationStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        let req = self.request(reqwest::Method::GET, "/api/conversations").await;
        let resp = self.send(req).await?;
        resp.json().await.map_err(SessionError::from_reqwest)
    }

    async fn create_conversation(&self) -> Result<ConversationId, SessionError> {
        let req = self.request(reqwest::Method::POST, "/api/conversations").await;
        let resp = self.send(req).await?;
        let body: CreatedBody = resp.json().await.map_err(SessionError::from_reqwest)?;
        debug!(session_id = %body.id, "created conversation");
        Ok(body.id)
    }

    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<Message>, SessionError> {
        let path = format!("/api/conversations/{}/messages", id);
        let req = self.request(reqwest::Method::GET, &path).await;
        let resp = self.send(req).await?;
        let messages: Vec<Message> = resp.json().await.map_err(SessionError::from_reqwest)?;
        debug!(session_id = %id, count = messages.len(), "fetched history");
        Ok(messages)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), SessionError> {
        let path = format!("/api/conversations/{}", id);
        let req = self.request(reqwest::Method::DELETE, &path).await;
        self.send(req).await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<ModelCatalog, SessionError> {
        let req = self.request(reqwest::Method::GET, "/api/models").await;
        let resp = self.send(req).await?;
        let models: Vec<ModelInfo> = resp.json().await.map_err(SessionError::from_reqwest)?;
        Ok(ModelCatalog::new(models))
    }

    async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, (ConversationSummary, Vec<Message>)>,
    history_fetches: usize,
    history_latency: Duration,
}

/// In-process store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryConversationStore {
    state: Arc<Mutex<MemoryState>>,
    models: Arc<Vec<ModelInfo>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: impl IntoIterator<Item = ModelInfo>) -> Self {
        Self {
            state: Arc::default(),
            models: Arc::new(models.into_iter().collect()),
        }
    }

    pub async fn put(&self, id: ConversationId, title: Option<&str>, messages: Vec<Message>) {
        let summary = ConversationSummary {
            id: id.clone(),
            title: title.map(str::to_string),
            updated_at: messages.last().map(|m| m.created_at),
            message_count: messages.len(),
        };
        self.state
            .lock()
            .await
            .conversations
            .insert(id, (summary, messages));
    }

    pub async fn history_fetches(&self) -> usize {
        self.state.lock().await.history_fetches
    }

    /// Delay every later `fetch_history` by `latency`.
    pub async fn set_history_latency(&self, latency: Duration) {
        self.state.lock().await.history_latency = latency;
    }
}

impl ConversationStore for MemoryConversationStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        let state = self.state.lock().await;
        let mut list: Vec<ConversationSummary> =
            state.conversations.values().map(|(s, _)| s.clone()).collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn create_conversation(&self) -> Result<ConversationId, SessionError> {
        let id = ConversationId::new(uuid::Uuid::new_v4().to_string());
        self.put(id.clone(), None, Vec::new()).await;
        Ok(id)
    }

    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<Message>, SessionError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.history_fetches += 1;
            state.history_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let state = self.state.lock().await;
        state
            .conversations
            .get(id)
            .map(|(_, messages)| messages.clone())
            .ok_or_else(|| SessionError::Storage(format!("conversation not found: {id}")))
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), SessionError> {
        self.state
            .lock()
            .await
            .conversations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::Storage(format!("conversation not found: {id}")))
    }

    async fn list_models(&self) -> Result<ModelCatalog, SessionError> {
        Ok(ModelCatalog::new(self.models.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_lists_newest_first() {
        let store = MemoryConversationStore::new();
        let mut old = Message::user("old");
        old.created_at = Utc::now() - chrono::Duration::hours(1);
        store.put(ConversationId::from("a"), Some("first"), vec![old]).await;
        store
            .put(ConversationId::from("b"), None, vec![Message::user("new")])
            .await;

        let list = store.list_conversations().await.unwrap();
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(list[1].title_or_id(), "first");
        assert_eq!(list[0].title_or_id(), "b");
    }

    #[tokio::test]
    async fn memory_store_delete_and_history() {
        let store = MemoryConversationStore::new();
        let id = ConversationId::from("a");
        store.put(id.clone(), None, vec![Message::user("q")]).await;

        assert_eq!(store.fetch_history(&id).await.unwrap().len(), 1);
        assert_eq!(store.history_fetches().await, 1);

        let created = store.create_conversation().await.unwrap();
        assert!(store.fetch_history(&created).await.unwrap().is_empty());

        store.delete_conversation(&id).await.unwrap();
        assert!(matches!(
            store.fetch_history(&id).await,
            Err(SessionError::Storage(_))
        ));
        assert!(store.delete_conversation(&id).await.is_err());
    }

    #[tokio::test]
    async fn http_store_unreachable_is_transport_error() {
        let store = HttpConversationStore::new("http://127.0.0.1:1/", None);
        assert_eq!(store.base_url(), "http://127.0.0.1:1");
        assert!(matches!(
            store.list_conversations().await,
            Err(SessionError::Transport(_))
        ));
    }

    #[test]
    fn summary_deserializes_with_defaults() {
        let s: ConversationSummary = serde_json::from_str(r#"{"id":"c9"}"#).unwrap();
        assert_eq!(s.id.as_str(), "c9");
        assert_eq!(s.message_count, 0);
        assert!(s.title.is_none());
    }
}
