//! Remote Fetcher
//!
//! The merge engine only needs "give me a page of items for this window".
//! `RemoteFetcher` is that seam; `MastodonClient` implements it for the
//! Mastodon and Pleroma REST endpoints each feed kind reads from.

use async_trait::async_trait;
use reqwest::header::LINK;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::merge::Window;
use crate::models::*;
use crate::ordered_id::OrderedId;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Io(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Connection, DNS and timeout failures: the device is probably offline.
    pub fn is_offline(&self) -> bool {
        matches!(self, FetchError::Io(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            FetchError::Io(e.to_string())
        }
    }
}

/// Query parameters of one page request, exactly as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub max_id: Option<OrderedId>,
    pub since_id: Option<OrderedId>,
    pub limit: usize,
}

impl PageRequest {
    /// Ask for one item more than `limit`, with `since_id` lowered by one, so
    /// a page that reaches the known boundary still returns the boundary item.
    pub fn for_window(window: &Window, limit: usize) -> Self {
        Self {
            max_id: window.max_id.clone(),
            since_id: window.fetch_since(),
            limit: limit + 1,
        }
    }
}

/// Items as returned by the server, newest first.
#[derive(Debug, Clone)]
pub struct RemotePage<T> {
    pub items: Vec<T>,
    /// Whether the response's `Link` header offers a next page. `None` when
    /// the server sent no `Link` header at all.
    pub has_more: Option<bool>,
}

impl<T> RemotePage<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, has_more: None }
    }
}

#[async_trait]
pub trait RemoteFetcher<T: TimelineItem>: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<RemotePage<T>>;

    /// Tell the server the user has seen everything up to `last_read_id`.
    async fn mark_read(&self, _last_read_id: &OrderedId) -> FetchResult<()> {
        Ok(())
    }
}

/// Thin authenticated client for a Mastodon-compatible instance
#[derive(Clone)]
pub struct MastodonClient {
    http_client: Client,
    base_url: String,
    access_token: String,
}

impl MastodonClient {
    pub fn new(base_url: &str, access_token: &str, timeout: Duration) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    pub fn home(&self) -> HomeTimelineFetcher {
        HomeTimelineFetcher { client: self.clone() }
    }

    pub fn chats(&self) -> ChatsFetcher {
        ChatsFetcher { client: self.clone() }
    }

    pub fn chat_messages(&self, chat_id: &str) -> ChatMessagesFetcher {
        ChatMessagesFetcher {
            client: self.clone(),
            chat_id: chat_id.to_string(),
        }
    }

    pub fn conversations(&self) -> ConversationsFetcher {
        ConversationsFetcher { client: self.clone() }
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        request: &PageRequest,
    ) -> FetchResult<RemotePage<T>> {
        let url = format!("{}{}", self.base_url, path);

        let mut query = vec![("limit", request.limit.to_string())];
        if let Some(max_id) = &request.max_id {
            query.push(("max_id", max_id.to_string()));
        }
        if let Some(since_id) = &request.since_id {
            query.push(("since_id", since_id.to_string()));
        }

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let has_more = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(has_next_link);

        // Reading the body can still fail on the wire; only a body that arrived
        // whole and does not parse is a decode error.
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        let items: Vec<T> =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;

        log::debug!("GET {} -> {} items", path, items.len());
        Ok(RemotePage { items, has_more })
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> FetchResult<()> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Http {
                status: response.status().as_u16(),
                message: format!("POST {} failed", path),
            });
        }
        Ok(())
    }
}

/// Whether an RFC 8288 `Link` header advertises a `rel="next"` page.
pub fn has_next_link(header: &str) -> bool {
    header.split(',').any(|link| {
        link.split(';').skip(1).any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        })
    })
}

// ==================== Feed fetchers ====================

pub struct HomeTimelineFetcher {
    client: MastodonClient,
}

#[async_trait]
impl RemoteFetcher<Status> for HomeTimelineFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<RemotePage<Status>> {
        self.client.get_page("/api/v1/timelines/home", request).await
    }

    async fn mark_read(&self, last_read_id: &OrderedId) -> FetchResult<()> {
        self.client
            .post_form("/api/v1/markers", &[("home[last_read_id]", last_read_id.as_str())])
            .await
    }
}

pub struct ChatsFetcher {
    client: MastodonClient,
}

#[async_trait]
impl RemoteFetcher<Chat> for ChatsFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<RemotePage<Chat>> {
        self.client.get_page("/api/v1/pleroma/chats", request).await
    }
}

pub struct ChatMessagesFetcher {
    client: MastodonClient,
    chat_id: String,
}

#[async_trait]
impl RemoteFetcher<ChatMessage> for ChatMessagesFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<RemotePage<ChatMessage>> {
        let path = format!("/api/v1/pleroma/chats/{}/messages", self.chat_id);
        self.client.get_page(&path, request).await
    }

    async fn mark_read(&self, last_read_id: &OrderedId) -> FetchResult<()> {
        let path = format!("/api/v1/pleroma/chats/{}/read", self.chat_id);
        self.client
            .post_form(&path, &[("last_read_id", last_read_id.as_str())])
            .await
    }
}

pub struct ConversationsFetcher {
    client: MastodonClient,
}

#[async_trait]
impl RemoteFetcher<Conversation> for ConversationsFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> FetchResult<RemotePage<Conversation>> {
        self.client.get_page("/api/v1/conversations", request).await
    }
}
