use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{GroupId, TokenId, TokenSnapshot},
    protocol::{Notification, QueueEvent, ReorderRequest, ReorderResponse},
};
use storage::Storage;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

mod engine;

pub use engine::{target_position, DropEvent, ReorderEngine, ReorderError, ReorderOutcome};

#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("token {0} not found")]
    NotFound(TokenId),
    #[error("queue backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Read and commit operations the engine needs from whatever owns the queue.
#[async_trait]
pub trait QueueAccessor: Send + Sync {
    async fn fetch_token(&self, token_id: TokenId) -> Result<TokenSnapshot, AccessorError>;

    /// `Ok(false)` means the backend declined the move; it is not an error.
    async fn commit_reorder(
        &self,
        token_id: TokenId,
        new_position: i64,
        old_position: i64,
    ) -> Result<bool, AccessorError>;
}

/// The rendered queue: re-fetch from backend truth, and a fire-and-forget banner.
#[async_trait]
pub trait QueueView: Send + Sync {
    async fn reload(&self) -> anyhow::Result<()>;

    fn notify(&self, notification: Notification);
}

pub struct HttpQueueAccessor {
    http: Client,
    server_url: String,
}

impl HttpQueueAccessor {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self { http, server_url }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl QueueAccessor for HttpQueueAccessor {
    async fn fetch_token(&self, token_id: TokenId) -> Result<TokenSnapshot, AccessorError> {
        let response = self
            .http
            .get(format!("{}/tokens/{}", self.server_url, token_id.0))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AccessorError::NotFound(token_id));
        }
        let snapshot = response.error_for_status()?.json().await?;
        Ok(snapshot)
    }

    async fn commit_reorder(
        &self,
        token_id: TokenId,
        new_position: i64,
        old_position: i64,
    ) -> Result<bool, AccessorError> {
        let response = self
            .http
            .post(format!("{}/tokens/{}/reorder", self.server_url, token_id.0))
            .json(&ReorderRequest {
                new_position,
                old_position,
            })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AccessorError::NotFound(token_id));
        }
        let body: ReorderResponse = response.error_for_status()?.json().await?;
        Ok(body.accepted)
    }
}

/// Drives the engine straight against a local database.
#[derive(Clone)]
pub struct StorageQueueAccessor {
    storage: Storage,
}

impl StorageQueueAccessor {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl QueueAccessor for StorageQueueAccessor {
    async fn fetch_token(&self, token_id: TokenId) -> Result<TokenSnapshot, AccessorError> {
        self.storage
            .read_token(token_id)
            .await?
            .map(|token| token.snapshot())
            .ok_or(AccessorError::NotFound(token_id))
    }

    async fn commit_reorder(
        &self,
        token_id: TokenId,
        new_position: i64,
        old_position: i64,
    ) -> Result<bool, AccessorError> {
        if self.storage.read_token(token_id).await?.is_none() {
            return Err(AccessorError::NotFound(token_id));
        }
        Ok(self
            .storage
            .reorder_token(token_id, new_position, old_position)
            .await?)
    }
}

pub fn websocket_url(server_url: &str) -> anyhow::Result<String> {
    let server_url = server_url.trim_end_matches('/');
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_url}/ws"))
}

/// Keeps `view` in sync with changes made by other terminals: every server event that touches
/// `group_id` triggers a reload.
pub async fn spawn_queue_listener(
    server_url: &str,
    group_id: GroupId,
    view: Arc<dyn QueueView>,
) -> anyhow::Result<JoinHandle<()>> {
    let ws_url = websocket_url(server_url)?;
    let (ws_stream, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    let (_, mut ws_reader) = ws_stream.split();

    Ok(tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<QueueEvent>(&text) {
                    Ok(event) => {
                        if !event.affected_groups().contains(&group_id) {
                            continue;
                        }
                        debug!(group_id = group_id.0, ?event, "queue changed remotely");
                        if let Err(error) = view.reload().await {
                            warn!(group_id = group_id.0, %error, "queue reload failed");
                        }
                    }
                    Err(error) => warn!(%error, "ignoring malformed queue event"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "queue event stream failed");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
