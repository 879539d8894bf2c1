use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ordered_id::OrderedId;

/// Anything that can live in a feed: statuses, chats, chat messages, conversations.
pub trait TimelineItem: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &OrderedId;

    /// Where the item sits in its feed, in the id space the server pages by.
    /// Feeds ordered by their own ids use `id()`; lists ordered by activity
    /// return the id of their newest activity instead.
    fn page_id(&self) -> &OrderedId {
        self.id()
    }

    /// Id of the account that authored the item.
    fn author_id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// One-line text for listings.
    fn summary(&self) -> String {
        String::new()
    }
}

/// One element of a feed: either a concrete item or a marker for a hole the
/// client has not fetched yet.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEntry<T> {
    Item(T),
    /// Zero or more unknown items exist with ids below this marker and above
    /// the next older known item.
    Gap(OrderedId),
}

impl<T: TimelineItem> FeedEntry<T> {
    /// Position in the feed: the item's `page_id()`, or the gap marker.
    pub fn id(&self) -> &OrderedId {
        match self {
            FeedEntry::Item(item) => item.page_id(),
            FeedEntry::Gap(id) => id,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, FeedEntry::Gap(_))
    }

    pub fn as_item(&self) -> Option<&T> {
        match self {
            FeedEntry::Item(item) => Some(item),
            FeedEntry::Gap(_) => None,
        }
    }
}

/// Position of the newest concrete item in a sequence.
pub fn newest_item_id<T: TimelineItem>(entries: &[FeedEntry<T>]) -> Option<&OrderedId> {
    entries.iter().find_map(|e| e.as_item().map(|i| i.page_id()))
}

/// Position of the oldest concrete item in a sequence.
pub fn oldest_item_id<T: TimelineItem>(entries: &[FeedEntry<T>]) -> Option<&OrderedId> {
    entries.iter().rev().find_map(|e| e.as_item().map(|i| i.page_id()))
}

pub fn item_count<T: TimelineItem>(entries: &[FeedEntry<T>]) -> usize {
    entries.iter().filter(|e| !e.is_gap()).count()
}

/// Opaque identifier of the logged-in account owning a cache partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey(pub String);

impl AccountKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which timeline a cache row or session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Home,
    Chats,
    ChatMessages { chat_id: String },
    Conversations,
}

impl FeedKind {
    /// Key used in the `feed_kind` column.
    pub fn storage_key(&self) -> String {
        match self {
            FeedKind::Home => "home".to_string(),
            FeedKind::Chats => "chats".to_string(),
            FeedKind::ChatMessages { chat_id } => format!("chat:{}", chat_id),
            FeedKind::Conversations => "conversations".to_string(),
        }
    }

    pub fn parse(key: &str) -> Option<FeedKind> {
        match key {
            "home" => Some(FeedKind::Home),
            "chats" => Some(FeedKind::Chats),
            "conversations" => Some(FeedKind::Conversations),
            _ => key
                .strip_prefix("chat:")
                .filter(|id| !id.is_empty())
                .map(|id| FeedKind::ChatMessages { chat_id: id.to_string() }),
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// ==================== Payloads ====================

/// Account as embedded in statuses and chats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub acct: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub bot: bool,
}

/// A post on the home timeline (or the last status of a conversation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: OrderedId,
    pub account: Account,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    #[serde(default)]
    pub in_reply_to_account_id: Option<String>,
    #[serde(default)]
    pub reblog: Option<Box<Status>>,
    #[serde(default)]
    pub spoiler_text: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub reblogs_count: u32,
    #[serde(default)]
    pub favourites_count: u32,
    #[serde(default)]
    pub reblogged: bool,
    #[serde(default)]
    pub favourited: bool,
    #[serde(default)]
    pub bookmarked: bool,
}

fn default_visibility() -> String {
    "public".to_string()
}

impl Status {
    /// The status the user interacts with: the reblogged one for boosts.
    pub fn actionable(&self) -> &Status {
        self.reblog.as_deref().unwrap_or(self)
    }
}

impl TimelineItem for Status {
    fn id(&self) -> &OrderedId {
        &self.id
    }

    fn author_id(&self) -> &str {
        &self.account.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.actionable().created_at
    }

    fn summary(&self) -> String {
        match &self.reblog {
            Some(original) => format!("boosted @{}: {}", original.account.acct, original.content),
            None => self.content.clone(),
        }
    }
}

/// Pleroma chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: OrderedId,
    pub chat_id: String,
    pub account_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachment: Option<serde_json::Value>,
}

impl TimelineItem for ChatMessage {
    fn id(&self) -> &OrderedId {
        &self.id
    }

    fn author_id(&self) -> &str {
        &self.account_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn summary(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

/// Pleroma chat, as listed on the chats screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: OrderedId,
    pub account: Account,
    #[serde(default)]
    pub unread: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
}

impl TimelineItem for Chat {
    fn id(&self) -> &OrderedId {
        &self.id
    }

    /// Chats are listed by last activity. Message ids are flake ids, so the
    /// last message's id follows that order; a chat without messages falls
    /// back to its own (equally time-ordered) id.
    fn page_id(&self) -> &OrderedId {
        self.last_message.as_ref().map_or(&self.id, |m| &m.id)
    }

    fn author_id(&self) -> &str {
        &self.account.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn summary(&self) -> String {
        let last = self.last_message.as_ref().map(|m| m.summary()).unwrap_or_default();
        format!("@{} ({} unread) {}", self.account.acct, self.unread, last)
    }
}

/// Direct-message conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: OrderedId,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub last_status: Option<Status>,
}

impl TimelineItem for Conversation {
    fn id(&self) -> &OrderedId {
        &self.id
    }

    /// Conversations are listed and paged by their last status.
    fn page_id(&self) -> &OrderedId {
        self.last_status.as_ref().map_or(&self.id, |s| &s.id)
    }

    fn author_id(&self) -> &str {
        self.last_status
            .as_ref()
            .map(|s| s.account.id.as_str())
            .or_else(|| self.accounts.first().map(|a| a.id.as_str()))
            .unwrap_or("")
    }

    fn created_at(&self) -> DateTime<Utc> {
        // Conversations without a last status sort as ancient and are the
        // first to go at cleanup.
        self.last_status
            .as_ref()
            .map(|s| s.created_at)
            .unwrap_or(DateTime::<Utc>::default())
    }

    fn summary(&self) -> String {
        let with: Vec<&str> = self.accounts.iter().map(|a| a.acct.as_str()).collect();
        let last = self.last_status.as_ref().map(|s| s.content.as_str()).unwrap_or("");
        format!("[{}] {}", with.join(", "), last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_kind_storage_key_roundtrip() {
        for kind in [
            FeedKind::Home,
            FeedKind::Chats,
            FeedKind::Conversations,
            FeedKind::ChatMessages { chat_id: "9Xy".to_string() },
        ] {
            assert_eq!(FeedKind::parse(&kind.storage_key()), Some(kind));
        }
        assert_eq!(FeedKind::parse("chat:"), None);
        assert_eq!(FeedKind::parse("public"), None);
    }

    #[test]
    fn test_status_from_mastodon_json() {
        let json = serde_json::json!({
            "id": "109876",
            "created_at": "2024-03-01T12:00:00.000Z",
            "content": "<p>hello</p>",
            "visibility": "unlisted",
            "account": {
                "id": "7",
                "username": "alice",
                "acct": "alice@example.com",
                "display_name": "Alice"
            },
            "media_attachments": []
        });
        let status: Status = serde_json::from_value(json).unwrap();
        assert_eq!(status.id, OrderedId::from("109876"));
        assert_eq!(status.author_id(), "7");
        assert_eq!(status.visibility, "unlisted");
        assert!(status.reblog.is_none());
    }

    #[test]
    fn test_reblog_uses_original_created_at() {
        let original = Status {
            id: OrderedId::from("5"),
            account: Account {
                id: "1".to_string(),
                username: "a".to_string(),
                acct: "a".to_string(),
                display_name: String::new(),
                url: String::new(),
                avatar: String::new(),
                bot: false,
            },
            content: "orig".to_string(),
            created_at: DateTime::<Utc>::default(),
            edited_at: None,
            url: None,
            in_reply_to_id: None,
            in_reply_to_account_id: None,
            reblog: None,
            spoiler_text: String::new(),
            sensitive: false,
            visibility: "public".to_string(),
            reblogs_count: 0,
            favourites_count: 0,
            reblogged: false,
            favourited: false,
            bookmarked: false,
        };
        let mut boost = original.clone();
        boost.id = OrderedId::from("6");
        boost.created_at = Utc::now();
        boost.reblog = Some(Box::new(original));

        assert_eq!(boost.created_at(), DateTime::<Utc>::default());
        assert_eq!(boost.actionable().content, "orig");
    }

    #[test]
    fn test_sequence_helpers() {
        let entries: Vec<FeedEntry<ChatMessage>> = vec![
            FeedEntry::Gap(OrderedId::from("9")),
            FeedEntry::Item(ChatMessage {
                id: OrderedId::from("8"),
                chat_id: "c".to_string(),
                account_id: "1".to_string(),
                content: None,
                created_at: Utc::now(),
                attachment: None,
            }),
            FeedEntry::Gap(OrderedId::from("7")),
        ];
        assert_eq!(newest_item_id(&entries), Some(&OrderedId::from("8")));
        assert_eq!(oldest_item_id(&entries), Some(&OrderedId::from("8")));
        assert_eq!(item_count(&entries), 1);
    }

    #[test]
    fn test_chat_and_conversation_page_by_last_activity() {
        let account = serde_json::json!({"id": "7", "username": "bob", "acct": "bob"});
        let chat: Chat = serde_json::from_value(serde_json::json!({
            "id": "9",
            "account": account,
            "unread": 2,
            "updated_at": "2024-03-01T12:00:00.000Z",
            "last_message": {
                "id": "AEt1Qv",
                "chat_id": "9",
                "account_id": "7",
                "content": "see you",
                "created_at": "2024-03-01T12:00:00.000Z"
            }
        }))
        .unwrap();
        assert_eq!(chat.id(), &OrderedId::from("9"));
        assert_eq!(chat.page_id(), &OrderedId::from("AEt1Qv"));

        let conversation: Conversation = serde_json::from_value(serde_json::json!({
            "id": "31",
            "accounts": [account],
            "unread": true,
            "last_status": {
                "id": "109876",
                "created_at": "2024-03-01T12:00:00.000Z",
                "account": account
            }
        }))
        .unwrap();
        assert_eq!(conversation.page_id(), &OrderedId::from("109876"));
        assert_eq!(FeedEntry::Item(conversation).id(), &OrderedId::from("109876"));

        let empty: Conversation =
            serde_json::from_value(serde_json::json!({"id": "32", "accounts": []})).unwrap();
        assert_eq!(empty.page_id(), &OrderedId::from("32"));
    }
}
